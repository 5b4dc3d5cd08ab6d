use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::bus::{BusEvent, EventBus, EventType, SubscriptionId};

use super::limiter::{attach_to_bus, Limiter, LimiterStats};
use super::options::{
    BatchOptions, DebounceOptions, SampleOptions, Strategy, ThrottleOptions, ThrottlerConfig,
};
use super::strategies::{BatchLimiter, DebounceLimiter, SampleLimiter, ThrottleLimiter};

/// Registration failure. Reported on the bus as a non-critical `core:error`
/// with a stable code; registration is simply refused, nothing throws.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("sourceEvent is required and must be non-blank")]
    InvalidSourceEvent,
    #[error("targetEvent must be non-blank when supplied")]
    InvalidTargetEvent,
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("invalid {strategy} options: {message}")]
    InvalidOptions { strategy: Strategy, message: String },
    #[error("limiter limit reached for {source_event}: at most {max} per source event")]
    LimitReached { source_event: EventType, max: usize },
}

impl RegistrationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSourceEvent => "THROTTLER_INVALID_SOURCE",
            Self::InvalidTargetEvent => "THROTTLER_INVALID_TARGET",
            Self::UnknownStrategy(_) => "THROTTLER_UNKNOWN_STRATEGY",
            Self::InvalidOptions { .. } => "THROTTLER_INVALID_OPTIONS",
            Self::LimitReached { .. } => "THROTTLER_LIMIT_REACHED",
        }
    }
}

/// Echo of a successful registration; also the `THROTTLER:REGISTERED` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredLimiter {
    pub source_event: EventType,
    pub target_event: EventType,
    pub strategy: Strategy,
    pub options: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlerStatus {
    pub limiters: usize,
    pub paused: bool,
    pub totals: StatusTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<LimiterDetail>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTotals {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterDetail {
    pub source_event: EventType,
    pub target_event: EventType,
    pub strategy: Strategy,
    pub options: Value,
    pub paused: bool,
    pub stats: LimiterStats,
}

// ---------------------------------------------------------------------------
// Wire payloads for the bus-event control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    source_event: String,
    #[serde(default)]
    target_event: Option<String>,
    strategy: String,
    #[serde(default)]
    options: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UnregisterRequest {
    source_event: Option<String>,
    target_event: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StatusRequest {
    detailed: Option<bool>,
    request_id: Option<String>,
}

/// Owns the limiter registry and handles the `THROTTLER:*` control events.
///
/// Every operation is also a direct method; the event surface is a thin
/// parsing layer over those methods, so host modules and tests can drive the
/// controller either way.
pub struct ThrottlerController {
    bus: Arc<EventBus>,
    limiters: DashMap<EventType, Vec<Arc<dyn Limiter>>>,
    config: Mutex<ThrottlerConfig>,
    paused: AtomicBool,
    system_subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl ThrottlerController {
    /// Construct the controller and wire its system handlers (`THROTTLER:*`
    /// requests, `APP:READY`, `CONFIG:UPDATED`, `APP:SHUTTING_DOWN`).
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let controller = Arc::new(Self {
            bus,
            limiters: DashMap::new(),
            config: Mutex::new(ThrottlerConfig::default()),
            paused: AtomicBool::new(false),
            system_subscriptions: Mutex::new(Vec::new()),
        });
        controller.install_system_handlers();
        controller
    }

    fn install_system_handlers(self: &Arc<Self>) {
        let handlers: Vec<(EventType, fn(&Arc<Self>, &BusEvent))> = vec![
            (EventType::ThrottlerRegister, Self::on_register),
            (EventType::ThrottlerUnregister, Self::on_unregister),
            (EventType::ThrottlerPause, |c, _| c.pause()),
            (EventType::ThrottlerResume, |c, _| c.resume()),
            (EventType::ThrottlerGetStatus, Self::on_get_status),
            (EventType::AppReady, Self::on_app_ready),
            (EventType::ConfigUpdated, Self::on_config_updated),
            (EventType::AppShuttingDown, |c, _| c.shutdown()),
        ];

        let mut subscriptions = self
            .system_subscriptions
            .lock()
            .expect("controller subscriptions poisoned");
        for (event_type, handler) in handlers {
            let weak = Arc::downgrade(self);
            let id = self.bus.subscribe(event_type, move |event| {
                if let Some(controller) = weak.upgrade() {
                    handler(&controller, event);
                }
                Ok(())
            });
            if let Some(id) = id {
                subscriptions.push(id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Create (or replace) a limiter binding `source` to `target`. The
    /// replaced limiter, if any, is torn down first and announces its own
    /// `THROTTLER:UNREGISTERED` before the replacement's `REGISTERED`.
    pub fn register(
        &self,
        source: EventType,
        target: Option<EventType>,
        strategy: &str,
        options: Option<&Value>,
    ) -> Result<RegisteredLimiter, RegistrationError> {
        if !source.is_valid() {
            return Err(RegistrationError::InvalidSourceEvent);
        }
        if target.as_ref().is_some_and(|t| !t.is_valid()) {
            return Err(RegistrationError::InvalidTargetEvent);
        }
        let strategy = Strategy::parse(strategy)
            .ok_or_else(|| RegistrationError::UnknownStrategy(strategy.to_string()))?;
        let target = target.unwrap_or_else(|| source.throttled());
        let config = self
            .config
            .lock()
            .expect("throttler config poisoned")
            .clone();

        let replaced = {
            let mut entry = self.limiters.entry(source.clone()).or_default();
            entry
                .iter()
                .position(|limiter| limiter.shared().target == target)
                .map(|pos| entry.remove(pos))
        };
        if let Some(old) = replaced {
            self.teardown_limiter(&old);
        }

        let registered = {
            let mut entry = self.limiters.entry(source.clone()).or_default();
            if entry.len() >= config.max_limiters_per_event {
                drop(entry);
                self.limiters.remove_if(&source, |_, v| v.is_empty());
                return Err(RegistrationError::LimitReached {
                    source_event: source,
                    max: config.max_limiters_per_event,
                });
            }

            let limiter = match self.build_limiter(
                strategy,
                source.clone(),
                target.clone(),
                options,
                &config,
            ) {
                Ok(limiter) => limiter,
                Err(error) => {
                    drop(entry);
                    self.limiters.remove_if(&source, |_, v| v.is_empty());
                    return Err(error);
                }
            };
            limiter.shared().set_paused(self.paused.load(Ordering::Relaxed));

            let registered = RegisteredLimiter {
                source_event: source.clone(),
                target_event: target,
                strategy,
                options: limiter.options_value(),
            };
            entry.push(limiter);
            registered
        };

        tracing::info!(
            source = %registered.source_event,
            target = %registered.target_event,
            strategy = %registered.strategy,
            "limiter registered"
        );
        self.bus.publish(
            EventType::ThrottlerRegistered,
            serde_json::to_value(&registered).unwrap_or_else(|_| json!({})),
        );
        Ok(registered)
    }

    fn build_limiter(
        &self,
        strategy: Strategy,
        source: EventType,
        target: EventType,
        options: Option<&Value>,
        config: &ThrottlerConfig,
    ) -> Result<Arc<dyn Limiter>, RegistrationError> {
        let invalid = |message: String| RegistrationError::InvalidOptions { strategy, message };
        let bus = Arc::clone(&self.bus);
        let limiter: Arc<dyn Limiter> = match strategy {
            Strategy::Throttle => {
                let opts = ThrottleOptions::from_value(options, config).map_err(invalid)?;
                let limiter = ThrottleLimiter::new(bus, source, target, opts);
                attach_to_bus(&limiter);
                limiter
            }
            Strategy::Debounce => {
                let opts = DebounceOptions::from_value(options, config).map_err(invalid)?;
                let limiter = DebounceLimiter::new(bus, source, target, opts);
                attach_to_bus(&limiter);
                limiter
            }
            Strategy::Batch => {
                let opts = BatchOptions::from_value(options, config).map_err(invalid)?;
                let limiter = BatchLimiter::new(bus, source, target, opts);
                attach_to_bus(&limiter);
                limiter
            }
            Strategy::Sample => {
                let opts = SampleOptions::from_value(options, config).map_err(invalid)?;
                let limiter = SampleLimiter::new(bus, source, target, opts);
                attach_to_bus(&limiter);
                limiter
            }
        };
        Ok(limiter)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear down every limiter matching the given source/target filters
    /// (`None` matches all). Returns the `(source, target)` pairs removed.
    pub fn unregister(
        &self,
        source: Option<&EventType>,
        target: Option<&EventType>,
    ) -> Vec<(EventType, EventType)> {
        let keys: Vec<EventType> = match source {
            Some(source) => vec![source.clone()],
            None => self.limiters.iter().map(|entry| entry.key().clone()).collect(),
        };

        let mut removed = Vec::new();
        for key in keys {
            let mut extracted: Vec<Arc<dyn Limiter>> = Vec::new();
            if let Some(mut entry) = self.limiters.get_mut(&key) {
                entry.retain(|limiter| {
                    let matches = target.is_none_or(|t| &limiter.shared().target == t);
                    if matches {
                        extracted.push(Arc::clone(limiter));
                    }
                    !matches
                });
            }
            self.limiters.remove_if(&key, |_, v| v.is_empty());

            // Teardown of one limiter is best-effort and independent of the
            // rest; each announces its own UNREGISTERED.
            for limiter in extracted {
                self.teardown_limiter(&limiter);
                removed.push((
                    limiter.shared().source.clone(),
                    limiter.shared().target.clone(),
                ));
            }
        }
        removed
    }

    fn teardown_limiter(&self, limiter: &Arc<dyn Limiter>) {
        limiter.teardown();
        let shared = limiter.shared();
        tracing::info!(source = %shared.source, target = %shared.target, "limiter unregistered");
        self.bus.publish(
            EventType::ThrottlerUnregistered,
            json!({
                "sourceEvent": shared.source,
                "targetEvent": shared.target,
            }),
        );
    }

    /// Tear down all limiters and detach the controller's own handlers.
    pub fn shutdown(&self) {
        self.unregister(None, None);
        let ids: Vec<SubscriptionId> = self
            .system_subscriptions
            .lock()
            .expect("controller subscriptions poisoned")
            .drain(..)
            .collect();
        for id in ids {
            self.bus.unsubscribe(id);
        }
    }

    // -----------------------------------------------------------------------
    // Pause / resume / status
    // -----------------------------------------------------------------------

    /// While paused every limiter counts arrivals as dropped and performs no
    /// scheduling or emission. Resume does not replay what arrived meanwhile.
    pub fn pause(&self) {
        self.set_paused(true);
        self.bus.publish(EventType::ThrottlerPaused, json!({}));
    }

    pub fn resume(&self) {
        self.set_paused(false);
        self.bus.publish(EventType::ThrottlerResumed, json!({}));
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
        for entry in self.limiters.iter() {
            for limiter in entry.value() {
                limiter.shared().set_paused(paused);
            }
        }
    }

    pub fn status(&self, detailed: bool) -> ThrottlerStatus {
        let mut totals = StatusTotals::default();
        let mut details = Vec::new();
        let mut count = 0usize;

        for entry in self.limiters.iter() {
            for limiter in entry.value() {
                count += 1;
                let shared = limiter.shared();
                let stats = shared.stats();
                totals.received += stats.received;
                totals.emitted += stats.emitted;
                totals.dropped += stats.dropped;
                if detailed {
                    details.push(LimiterDetail {
                        source_event: shared.source.clone(),
                        target_event: shared.target.clone(),
                        strategy: limiter.strategy(),
                        options: limiter.options_value(),
                        paused: shared.is_paused(),
                        stats,
                    });
                }
            }
        }

        ThrottlerStatus {
            limiters: count,
            paused: self.paused.load(Ordering::Relaxed),
            totals,
            details: detailed.then_some(details),
        }
    }

    // -----------------------------------------------------------------------
    // Bus-event control surface
    // -----------------------------------------------------------------------

    fn on_register(self: &Arc<Self>, event: &BusEvent) {
        let request: RegisterRequest = match serde_json::from_value(event.data.clone()) {
            Ok(request) => request,
            Err(error) => {
                self.bus.report_error(
                    "THROTTLER_INVALID_REQUEST",
                    format!("malformed REGISTER payload: {error}"),
                    json!({ "payload": event.data }),
                );
                return;
            }
        };

        let source = EventType::from_name(&request.source_event);
        let target = request.target_event.as_deref().map(EventType::from_name);
        if let Err(error) = self.register(source, target, &request.strategy, request.options.as_ref())
        {
            self.bus.report_error(
                error.code(),
                error.to_string(),
                json!({ "sourceEvent": request.source_event }),
            );
        }
    }

    fn on_unregister(self: &Arc<Self>, event: &BusEvent) {
        let request: UnregisterRequest =
            serde_json::from_value(event.data.clone()).unwrap_or_default();
        let source = request.source_event.as_deref().map(EventType::from_name);
        let target = request.target_event.as_deref().map(EventType::from_name);
        self.unregister(source.as_ref(), target.as_ref());
    }

    fn on_get_status(self: &Arc<Self>, event: &BusEvent) {
        let request: StatusRequest = serde_json::from_value(event.data.clone()).unwrap_or_default();
        let status = self.status(request.detailed.unwrap_or(false));
        let mut payload = match serde_json::to_value(&status) {
            Ok(payload) => payload,
            Err(error) => {
                self.bus.report_error(
                    "EVENT_EMIT_FAILED",
                    format!("failed to serialize throttler status: {error}"),
                    json!({}),
                );
                return;
            }
        };
        if let (Some(object), Some(request_id)) = (payload.as_object_mut(), request.request_id) {
            object.insert("requestId".to_string(), json!(request_id));
        }
        self.bus.publish(EventType::ThrottlerStatus, payload);
    }

    fn on_app_ready(self: &Arc<Self>, _event: &BusEvent) {
        // Configuration pull: the config store answers with CONFIG:UPDATED.
        self.bus
            .publish(EventType::ConfigRequest, json!({ "section": "throttler" }));
    }

    fn on_config_updated(self: &Arc<Self>, event: &BusEvent) {
        self.config
            .lock()
            .expect("throttler config poisoned")
            .apply_update(&event.data);
    }
}
