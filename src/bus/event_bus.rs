use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::event::{BusEvent, EventType, PublishOptions, SubscribeOptions};

const HISTORY_CAPACITY: usize = 1000;

pub type SubscriptionId = Uuid;

/// Failure surfaced by a subscriber callback. The bus isolates it, logs it,
/// and re-reports it as a `core:error` event; it never reaches the publisher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
    filter: Option<serde_json::Map<String, Value>>,
}

/// Snapshot entry taken at dispatch start. `once` subscriptions are claimed
/// (removed from the registry) at snapshot time, so a re-entrant publish of
/// the same type cannot fire them a second time.
struct DispatchTarget {
    id: SubscriptionId,
    handler: Handler,
}

struct Registry {
    subscriptions: HashMap<EventType, Vec<Subscription>>,
    history: VecDeque<BusEvent>,
    history_capacity: usize,
}

/// In-process publish/subscribe bus with bounded history, debug tracing and
/// per-handler fault isolation.
///
/// The registry lock is held only to mutate or snapshot — never across a
/// handler invocation — so handlers may freely re-enter `publish`,
/// `subscribe` and `unsubscribe`, including `sync` publishes.
pub struct EventBus {
    registry: Mutex<Registry>,
    seq: AtomicI64,
    debug: AtomicBool,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                subscriptions: HashMap::new(),
                history: VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY)),
                history_capacity: capacity,
            }),
            seq: AtomicI64::new(0),
            debug: AtomicBool::new(false),
        })
    }

    /// Register `handler` for `event_type`. Returns `None` (and reports a
    /// `core:error`) instead of failing loudly when the type is invalid.
    pub fn subscribe<F>(self: &Arc<Self>, event_type: EventType, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with(event_type, SubscribeOptions::default(), handler)
    }

    /// `subscribe` that fires at most once, then removes itself — even when
    /// the handler fails.
    pub fn once<F>(self: &Arc<Self>, event_type: EventType, handler: F) -> Option<SubscriptionId>
    where
        F: Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with(
            event_type,
            SubscribeOptions {
                once: true,
                filter: None,
            },
            handler,
        )
    }

    pub fn subscribe_with<F>(
        self: &Arc<Self>,
        event_type: EventType,
        options: SubscribeOptions,
        handler: F,
    ) -> Option<SubscriptionId>
    where
        F: Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if !event_type.is_valid() {
            tracing::warn!("subscribe refused: blank event type");
            self.report_error(
                "INVALID_EVENT_TYPE",
                "subscribe requires a non-blank event type",
                json!({ "operation": "subscribe" }),
            );
            return None;
        }

        let id = Uuid::new_v4();
        {
            let mut registry = self.registry.lock().expect("bus registry poisoned");
            registry
                .subscriptions
                .entry(event_type.clone())
                .or_default()
                .push(Subscription {
                    id,
                    handler: Arc::new(handler),
                    once: options.once,
                    filter: options.filter,
                });
        }
        self.trace("subscribe", &event_type, Some(id));
        Some(id)
    }

    /// Remove a subscription wherever it lives. Returns whether anything was
    /// removed; an event type whose subscriber list empties is pruned.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        let mut owner: Option<EventType> = None;
        for (event_type, subs) in registry.subscriptions.iter_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                owner = Some(event_type.clone());
                break;
            }
        }
        let Some(event_type) = owner else {
            return false;
        };
        if registry
            .subscriptions
            .get(&event_type)
            .is_some_and(|subs| subs.is_empty())
        {
            registry.subscriptions.remove(&event_type);
        }
        drop(registry);
        self.trace("unsubscribe", &event_type, Some(id));
        true
    }

    /// Publish with default options (asynchronous dispatch, no source tag).
    pub fn publish(self: &Arc<Self>, event_type: EventType, data: Value) -> bool {
        self.publish_with(event_type, data, PublishOptions::default())
    }

    /// Construct an envelope, append it to history and deliver it to a
    /// snapshot of the current subscribers for the type.
    ///
    /// Returns whether at least one subscriber was registered for the type.
    /// With `options.sync` handlers run inline in subscription order;
    /// otherwise they run, still in order for this one publish, on a spawned
    /// task (no ordering guarantee against other publishes).
    pub fn publish_with(
        self: &Arc<Self>,
        event_type: EventType,
        data: Value,
        options: PublishOptions,
    ) -> bool {
        if !event_type.is_valid() {
            tracing::warn!("publish refused: blank event type");
            self.report_error(
                "INVALID_EVENT_TYPE",
                "publish requires a non-blank event type",
                json!({ "operation": "publish" }),
            );
            return false;
        }

        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event_type,
            data,
            created_at: Utc::now().to_rfc3339(),
            source: options.source,
        };

        let (had_subscribers, targets) = {
            let mut registry = self.registry.lock().expect("bus registry poisoned");
            if registry.history.len() >= registry.history_capacity {
                registry.history.pop_front();
            }
            registry.history.push_back(event.clone());

            let mut targets: Vec<DispatchTarget> = Vec::new();
            let mut had_subscribers = false;
            let mut prune = false;
            if let Some(subs) = registry.subscriptions.get_mut(&event.event_type) {
                had_subscribers = !subs.is_empty();
                subs.retain(|sub| {
                    if !filter_matches(sub.filter.as_ref(), &event.data) {
                        return true;
                    }
                    targets.push(DispatchTarget {
                        id: sub.id,
                        handler: Arc::clone(&sub.handler),
                    });
                    !sub.once
                });
                prune = subs.is_empty();
            }
            if prune {
                registry.subscriptions.remove(&event.event_type);
            }
            (had_subscribers, targets)
        };

        self.trace("publish", &event.event_type, None);

        if options.sync {
            for target in &targets {
                self.deliver(&event, target);
            }
        } else if !targets.is_empty() {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                for target in &targets {
                    bus.deliver(&event, target);
                }
            });
        }

        had_subscribers
    }

    fn deliver(self: &Arc<Self>, event: &BusEvent, target: &DispatchTarget) {
        if let Err(error) = (target.handler)(event) {
            tracing::warn!(
                event = %event.event_type,
                subscription = %target.id,
                "event handler failed: {error}"
            );
            // Recursion guard: a failing core:error handler is logged only,
            // never re-reported through the bus.
            if event.event_type != EventType::CoreError {
                self.report_error(
                    "HANDLER_FAILED",
                    format!("handler failed for {}: {error}", event.event_type),
                    json!({
                        "eventType": event.event_type,
                        "subscriptionId": target.id.to_string(),
                    }),
                );
            }
        }
    }

    /// Report a swallowed failure as a `core:error` event. This is the
    /// application's only error channel; nothing in the bus throws.
    pub(crate) fn report_error(
        self: &Arc<Self>,
        code: &str,
        message: impl Into<String>,
        context: Value,
    ) {
        self.publish(
            EventType::CoreError,
            json!({
                "code": code,
                "message": message.into(),
                "context": context,
            }),
        );
    }

    /// Read-only snapshot of the history ring, oldest first.
    pub fn event_history(&self) -> Vec<BusEvent> {
        let registry = self.registry.lock().expect("bus registry poisoned");
        registry.history.iter().cloned().collect()
    }

    pub fn clear_event_history(&self) {
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        registry.history.clear();
    }

    /// When enabled, every subscribe/unsubscribe/publish additionally emits a
    /// structured trace record for external log sinks. Trace records are not
    /// bus events and do not appear in history.
    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self, event_type: &EventType) -> usize {
        let registry = self.registry.lock().expect("bus registry poisoned");
        registry
            .subscriptions
            .get(event_type)
            .map_or(0, |subs| subs.len())
    }

    fn trace(&self, op: &str, event_type: &EventType, id: Option<SubscriptionId>) {
        if !self.debug.load(Ordering::Relaxed) {
            return;
        }
        match id {
            Some(id) => tracing::debug!(
                target: "soundvault::bus",
                op,
                event = %event_type,
                subscription = %id,
                "bus operation"
            ),
            None => tracing::debug!(
                target: "soundvault::bus",
                op,
                event = %event_type,
                "bus operation"
            ),
        }
    }
}

fn filter_matches(filter: Option<&serde_json::Map<String, Value>>, data: &Value) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Some(object) = data.as_object() else {
        return filter.is_empty();
    };
    filter.iter().all(|(key, want)| object.get(key) == Some(want))
}
