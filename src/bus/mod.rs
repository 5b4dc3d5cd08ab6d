//! Event system every other module communicates through.
//!
//! The event bus provides:
//! - Publish-subscribe pattern with per-subscription options (once, filter)
//! - Synchronous or next-tick dispatch, ordered per publish
//! - A bounded event-history ring for debugging and late inspection
//! - Per-handler fault isolation, reported on the `core:error` channel
//!
//! # Architecture
//!
//! Producers (download adapters, UI commands) publish raw events; the
//! throttler re-publishes regulated derived events; consumers subscribe to
//! whichever of the two they can afford. Both flows share this one bus, so
//! the rate-limiting layer in [`crate::throttler`] is a filter stage
//! co-resident with the bus rather than a separate transport.

mod event;
mod event_bus;


pub use event::{BusEvent, EventType, PublishOptions, SubscribeOptions};
pub use event_bus::{EventBus, HandlerError, SubscriptionId};
