use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::bus::{BusEvent, EventBus, EventType};
use crate::throttler::limiter::{Limiter, LimiterShared};
use crate::throttler::options::{DebounceOptions, Strategy};
use crate::throttler::timer::{self, TimerToken};

/// Emits only after `delay` of inactivity (trailing), optionally also once
/// immediately on the first event of a quiet-separated burst (leading).
pub(crate) struct DebounceLimiter {
    shared: LimiterShared,
    options: DebounceOptions,
    state: Mutex<DebounceState>,
}

/// The single debounce timer plays one of two roles. Only an `Emit` timer
/// owes an emission at teardown; flushing a `Reset` timer would duplicate
/// the leading emission that already happened.
#[derive(Clone, Copy, PartialEq)]
enum TimerRole {
    /// Trailing edge: fire emits the latest payload.
    Emit,
    /// Leading gate: fire only reopens the gate after `delay` of silence.
    Reset,
}

#[derive(Default)]
struct DebounceState {
    /// Closed after a leading emission until `delay` of silence passes.
    gate_closed: bool,
    latest: Option<Value>,
    timer: Option<(TimerRole, TimerToken)>,
    epoch: u64,
}

impl DebounceLimiter {
    pub fn new(
        bus: Arc<EventBus>,
        source: EventType,
        target: EventType,
        options: DebounceOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: LimiterShared::new(bus, source, target),
            options,
            state: Mutex::new(DebounceState::default()),
        })
    }

    fn arm(self: &Arc<Self>, state: &mut DebounceState, role: TimerRole) {
        state.epoch += 1;
        let epoch = state.epoch;
        let weak = Arc::downgrade(self);
        state.timer = Some((
            role,
            timer::schedule(self.options.delay, move || {
                if let Some(limiter) = weak.upgrade() {
                    limiter.timer_fire(epoch, role);
                }
            }),
        ));
    }

    fn timer_fire(&self, epoch: u64, role: TimerRole) {
        let pending = {
            let mut state = self.state.lock().expect("debounce state poisoned");
            if state.epoch != epoch {
                return;
            }
            state.timer = None;
            // Either way the inactivity period has elapsed: the next event is
            // the first of a new burst.
            state.gate_closed = false;
            match role {
                TimerRole::Reset => None,
                TimerRole::Emit => state.latest.take(),
            }
        };
        if let Some(data) = pending {
            self.shared.emit(data);
        }
    }
}

impl Limiter for DebounceLimiter {
    fn shared(&self) -> &LimiterShared {
        &self.shared
    }

    fn strategy(&self) -> Strategy {
        Strategy::Debounce
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
            let mut state = self.state.lock().expect("debounce state poisoned");
            if let Some((_, token)) = state.timer.take() {
                token.cancel();
            }

            if self.options.leading && !state.gate_closed {
                state.gate_closed = true;
                self.arm(&mut state, TimerRole::Reset);
                emit_now = Some(data);
            } else if self.options.trailing {
                state.latest = Some(data);
                self.arm(&mut state, TimerRole::Emit);
            } else if self.options.leading {
                // Gate closed, no trailing edge: drop, keep the gate armed.
                self.shared.note_dropped();
                self.arm(&mut state, TimerRole::Reset);
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
            let mut state = self.state.lock().expect("debounce state poisoned");
            state.epoch += 1;
            match state.timer.take() {
                Some((TimerRole::Emit, token)) => {
                    token.cancel();
                    state.latest.take()
                }
                Some((TimerRole::Reset, token)) => {
                    token.cancel();
                    None
                }
                None => None,
            }
        };
        if let Some(data) = pending {
            self.shared.emit(data);
        }
    }
}
