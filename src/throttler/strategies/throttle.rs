use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::time::Instant;

use crate::bus::{BusEvent, EventBus, EventType};
use crate::throttler::limiter::{Limiter, LimiterShared};
use crate::throttler::options::{Strategy, ThrottleOptions};
use crate::throttler::timer::{self, TimerToken};

/// At most one emission per `interval`, always reflecting the most recent
/// payload available at emission time. `leading` emits on the first event of
/// a window; `trailing` emits the latest coalesced payload when the window
/// elapses.
pub(crate) struct ThrottleLimiter {
    shared: LimiterShared,
    options: ThrottleOptions,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    last_emit: Option<Instant>,
    /// Latest payload waiting on the trailing edge.
    latest: Option<Value>,
    trailing_timer: Option<TimerToken>,
    epoch: u64,
}

impl ThrottleLimiter {
    pub fn new(
        bus: Arc<EventBus>,
        source: EventType,
        target: EventType,
        options: ThrottleOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: LimiterShared::new(bus, source, target),
            options,
            state: Mutex::new(ThrottleState::default()),
        })
    }

    fn arm_trailing(self: &Arc<Self>, state: &mut ThrottleState, delay: std::time::Duration) {
        state.epoch += 1;
        let epoch = state.epoch;
        let weak = Arc::downgrade(self);
        // Replacing the token drops (and thereby aborts) the previous timer.
        state.trailing_timer = Some(timer::schedule(delay, move || {
            if let Some(limiter) = weak.upgrade() {
                limiter.trailing_fire(epoch);
            }
        }));
    }

    fn trailing_fire(&self, epoch: u64) {
        let pending = {
            let mut state = self.state.lock().expect("throttle state poisoned");
            if state.epoch != epoch {
                return;
            }
            state.trailing_timer = None;
            state.last_emit = Some(timer::now());
            state.latest.take()
        };
        if let Some(data) = pending {
            self.shared.emit(data);
        }
    }
}

impl Limiter for ThrottleLimiter {
    fn shared(&self) -> &LimiterShared {
        &self.shared
    }

    fn strategy(&self) -> Strategy {
        Strategy::Throttle
    }

    fn options_value(&self) -> Value {
        self.options.to_value()
    }

    fn on_event(self: Arc<Self>, event: &BusEvent) {
        let Some(data) = self.shared.admit(event) else {
            return;
        };

        let mut emit_now: Option<Value> = None;
        {
            let mut state = self.state.lock().expect("throttle state poisoned");
            let now = timer::now();
            let in_window = state
                .last_emit
                .is_some_and(|last| now.duration_since(last) < self.options.interval);

            if !in_window {
                // A trailing timer from an already-elapsed window is stale.
                if let Some(token) = state.trailing_timer.take() {
                    token.cancel();
                    state.epoch += 1;
                }
                if self.options.leading {
                    state.last_emit = Some(now);
                    emit_now = Some(data);
                } else if self.options.trailing {
                    state.latest = Some(data);
                    self.arm_trailing(&mut state, self.options.interval);
                } else {
                    self.shared.note_dropped();
                }
            } else if self.options.trailing {
                // Coalesce: move the payload, keep the window-anchored deadline.
                state.latest = Some(data);
                let elapsed = now.duration_since(state.last_emit.expect("in_window implies last_emit"));
                self.arm_trailing(&mut state, self.options.interval - elapsed);
            } else {
                self.shared.note_dropped();
            }
        }
        if let Some(data) = emit_now {
            self.shared.emit(data);
        }
    }

    fn teardown(&self) {
        self.shared.detach();
        let pending = {
            let mut state = self.state.lock().expect("throttle state poisoned");
            state.epoch += 1;
            if let Some(token) = state.trailing_timer.take() {
                token.cancel();
            }
            if let Some(latest) = state.latest.take() {
                // A trailing emission was due; deliver it now instead of losing it.
                Some(latest)
            } else {
                let stats = self.shared.stats();
                if stats.received > 0 && stats.emitted == 0 {
                    self.shared.last_data()
                } else {
                    None
                }
            }
        };
        if let Some(data) = pending {
            self.shared.emit(data);
        }
    }
}
