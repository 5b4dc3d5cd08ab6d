use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::bus::{BusEvent, EventBus, EventType, PublishOptions, SubscriptionId};

use super::options::Strategy;

/// Source tag stamped on every derived event the rate-limiting layer emits.
const EMIT_SOURCE: &str = "throttler";

/// Per-limiter counters, reported by `THROTTLER:GET_STATUS` and consulted by
/// teardown flushing.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<LastEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastEvent {
    /// Wall-clock arrival time, unix millis.
    pub timestamp: i64,
    pub data: Value,
}

/// State every strategy shares: the bus binding, pause flag, internal
/// subscription id and stats. Strategy-specific state lives behind each
/// strategy's own mutex.
pub(crate) struct LimiterShared {
    bus: Arc<EventBus>,
    pub source: EventType,
    pub target: EventType,
    paused: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    stats: Mutex<LimiterStats>,
}

impl LimiterShared {
    pub fn new(bus: Arc<EventBus>, source: EventType, target: EventType) -> Self {
        Self {
            bus,
            source,
            target,
            paused: AtomicBool::new(false),
            subscription: Mutex::new(None),
            stats: Mutex::new(LimiterStats::default()),
        }
    }

    /// Record an arrival. Returns the payload to process, or `None` when the
    /// limiter is paused (the arrival then counts as dropped; pause is a hard
    /// drop, never a buffer).
    pub fn admit(&self, event: &BusEvent) -> Option<Value> {
        let mut stats = self.stats.lock().expect("limiter stats poisoned");
        stats.received += 1;
        stats.last_event = Some(LastEvent {
            timestamp: Utc::now().timestamp_millis(),
            data: event.data.clone(),
        });
        if self.paused.load(Ordering::Relaxed) {
            stats.dropped += 1;
            return None;
        }
        Some(event.data.clone())
    }

    pub fn note_dropped(&self) {
        self.stats.lock().expect("limiter stats poisoned").dropped += 1;
    }

    /// Re-publish `data` under the derived target type.
    pub fn emit(&self, data: Value) {
        if !self.target.is_valid() {
            self.bus.report_error(
                "EVENT_EMIT_FAILED",
                format!("cannot emit derived event for {}: blank target type", self.source),
                json!({ "sourceEvent": self.source }),
            );
            return;
        }
        self.stats.lock().expect("limiter stats poisoned").emitted += 1;
        self.bus.publish_with(
            self.target.clone(),
            data,
            PublishOptions::from_source(EMIT_SOURCE),
        );
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LimiterStats {
        self.stats.lock().expect("limiter stats poisoned").clone()
    }

    pub fn last_data(&self) -> Option<Value> {
        self.stats
            .lock()
            .expect("limiter stats poisoned")
            .last_event
            .as_ref()
            .map(|last| last.data.clone())
    }

    pub fn record_subscription(&self, id: SubscriptionId) {
        *self.subscription.lock().expect("limiter subscription poisoned") = Some(id);
    }

    /// Remove the internal bus subscription; idempotent.
    pub fn detach(&self) {
        let id = self
            .subscription
            .lock()
            .expect("limiter subscription poisoned")
            .take();
        if let Some(id) = id {
            self.bus.unsubscribe(id);
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

/// One registered rate limiter: a strategy-specific state machine fed by an
/// internal bus subscription for its source event, re-publishing under its
/// target type.
pub(crate) trait Limiter: Send + Sync {
    fn shared(&self) -> &LimiterShared;
    fn strategy(&self) -> Strategy;
    /// Effective options, serialized for REGISTERED / STATUS payloads.
    fn options_value(&self) -> Value;
    fn on_event(self: Arc<Self>, event: &BusEvent);
    /// Unsubscribe, flush whatever the strategy still owes, cancel timers.
    fn teardown(&self);
}

/// Subscribe a limiter's handler for its source event. The closure holds a
/// weak reference so the bus never keeps a torn-down limiter alive.
pub(crate) fn attach_to_bus<L: Limiter + 'static>(limiter: &Arc<L>) {
    let weak = Arc::downgrade(limiter);
    let shared = limiter.shared();
    let id = shared.bus().subscribe(shared.source.clone(), move |event| {
        if let Some(limiter) = weak.upgrade() {
            limiter.on_event(event);
        }
        Ok(())
    });
    if let Some(id) = id {
        shared.record_subscription(id);
    }
}
