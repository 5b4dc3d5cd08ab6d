use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::bus::{BusEvent, EventBus, EventType};
use crate::throttler::limiter::{Limiter, LimiterShared};
use crate::throttler::options::{BatchOptions, Strategy};
use crate::throttler::timer::{self, TimerToken};

/// Collects payloads and flushes them as one derived event, either when the
/// queue reaches `max_size` or when `max_interval` elapses since the first
/// enqueue — whichever bound is hit first. Flushing preserves arrival order.
pub(crate) struct BatchLimiter {
    shared: LimiterShared,
    options: BatchOptions,
    state: Mutex<BatchState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchItem {
    /// Wall-clock enqueue time, unix millis.
    timestamp: i64,
    data: Value,
}

#[derive(Default)]
struct BatchState {
    queue: Vec<BatchItem>,
    interval_timer: Option<TimerToken>,
    epoch: u64,
}

impl BatchLimiter {
    pub fn new(
        bus: Arc<EventBus>,
        source: EventType,
        target: EventType,
        options: BatchOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: LimiterShared::new(bus, source, target),
            options,
            state: Mutex::new(BatchState::default()),
        })
    }

    fn flush_due(&self, epoch: u64) {
        let items = {
            let mut state = self.state.lock().expect("batch state poisoned");
            if state.epoch != epoch {
                return;
            }
            state.interval_timer = None;
            std::mem::take(&mut state.queue)
        };
        self.emit_batch(items);
    }

    fn emit_batch(&self, items: Vec<BatchItem>) {
        if items.is_empty() {
            return;
        }
        self.shared.emit(json!({
            "count": items.len(),
            "items": items,
            "timestamp": Utc::now().timestamp_millis(),
        }));
    }
}

impl Limiter for BatchLimiter {
    fn shared(&self) -> &LimiterShared {
        &self.shared
    }

    fn strategy(&self) -> Strategy {
        Strategy::Batch
    }

    fn options_value(&self) -> Value {
        self.options.to_value()
    }

    fn on_event(self: Arc<Self>, event: &BusEvent) {
        let Some(data) = self.shared.admit(event) else {
            return;
        };

        let full = {
            let mut state = self.state.lock().expect("batch state poisoned");
            state.queue.push(BatchItem {
                timestamp: Utc::now().timestamp_millis(),
                data,
            });

            if state.queue.len() >= self.options.max_size {
                // Size bound wins: cancel the interval timer and flush now.
                state.epoch += 1;
                if let Some(token) = state.interval_timer.take() {
                    token.cancel();
                }
                Some(std::mem::take(&mut state.queue))
            } else {
                if state.queue.len() == 1 {
                    state.epoch += 1;
                    let epoch = state.epoch;
                    let weak = Arc::downgrade(&self);
                    state.interval_timer =
                        Some(timer::schedule(self.options.max_interval, move || {
                            if let Some(limiter) = weak.upgrade() {
                                limiter.flush_due(epoch);
                            }
                        }));
                }
                None
            }
        };
        if let Some(items) = full {
            self.emit_batch(items);
        }
    }

    fn teardown(&self) {
        self.shared.detach();
        let items = {
            let mut state = self.state.lock().expect("batch state poisoned");
            state.epoch += 1;
            if let Some(token) = state.interval_timer.take() {
                token.cancel();
            }
            std::mem::take(&mut state.queue)
        };
        self.emit_batch(items);
    }
}
