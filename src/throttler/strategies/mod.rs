//! The four per-limiter state machines. Each implements the `Limiter`
//! contract and is driven by events arriving through its internal bus
//! subscription.

mod batch;
mod debounce;
mod sample;
mod throttle;

pub(crate) use batch::BatchLimiter;
pub(crate) use debounce::DebounceLimiter;
pub(crate) use sample::SampleLimiter;
pub(crate) use throttle::ThrottleLimiter;
