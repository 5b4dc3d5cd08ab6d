use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;

use crate::bus::{BusEvent, EventBus, EventType};
use crate::throttler::limiter::{Limiter, LimiterShared};
use crate::throttler::options::{SampleOptions, Strategy};
use crate::throttler::timer;

/// Admits a `rate` fraction of the source stream and drops the rest, with no
/// coalescing and nothing to flush at teardown.
///
/// `time_window` mode is deterministic: events are admitted while the clock
/// sits in the first second of each `1s / rate` window, measured from the
/// limiter's creation. Otherwise each event is admitted independently with
/// probability `rate`.
pub(crate) struct SampleLimiter {
    shared: LimiterShared,
    options: SampleOptions,
    started: Instant,
}

impl SampleLimiter {
    pub fn new(
        bus: Arc<EventBus>,
        source: EventType,
        target: EventType,
        options: SampleOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: LimiterShared::new(bus, source, target),
            options,
            started: timer::now(),
        })
    }

    fn admits(&self) -> bool {
        if self.options.time_window {
            let window_ms = 1000.0 / self.options.rate;
            let offset_ms = timer::now().duration_since(self.started).as_millis() as f64;
            offset_ms % window_ms < 1000.0
        } else {
            rand::thread_rng().gen::<f64>() < self.options.rate
        }
    }
}

impl Limiter for SampleLimiter {
    fn shared(&self) -> &LimiterShared {
        &self.shared
    }

    fn strategy(&self) -> Strategy {
        Strategy::Sample
    }

    fn options_value(&self) -> Value {
        self.options.to_value()
    }

    fn on_event(self: Arc<Self>, event: &BusEvent) {
        let Some(data) = self.shared.admit(event) else {
            return;
        };
        if self.admits() {
            self.shared.emit(data);
        } else {
            self.shared.note_dropped();
        }
    }

    fn teardown(&self) {
        // Dropped samples are not recoverable by design; nothing to flush.
        self.shared.detach();
    }
}
