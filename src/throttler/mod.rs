//! Rate-limiting layer in front of the event bus.
//!
//! Noisy source events (download-progress ticks, adapter log spam) are
//! re-published under a derived type at a controlled frequency so UI
//! consumers can subscribe without re-render storms:
//! - `throttle`: at most one emission per interval, leading/trailing edges
//! - `debounce`: emission after a quiet period, optional leading edge
//! - `batch`: bounded batch size and bounded batch latency
//! - `sample`: deterministic time-window or probabilistic admission
//!
//! # Architecture
//!
//! The [`ThrottlerController`] owns the limiter registry and answers the
//! `THROTTLER:*` control events. Each registered limiter subscribes
//! internally to its source event, runs its strategy state machine and
//! re-emits on the same bus under the target type. Raw and derived events
//! share the bus; consumers pick the stream they can afford.

mod controller;
mod limiter;
mod options;
mod strategies;
mod timer;

#[cfg(test)]
mod tests;

pub use controller::{
    LimiterDetail, RegisteredLimiter, RegistrationError, StatusTotals, ThrottlerController,
    ThrottlerStatus,
};
pub use limiter::{LastEvent, LimiterStats};
pub use options::{
    BatchOptions, DebounceOptions, SampleOptions, Strategy, ThrottleOptions, ThrottlerConfig,
};
