//! Unit tests for the rate-limiting layer: strategy timing semantics,
//! registration rules, teardown flushing, pause/resume and status reporting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::bus::{BusEvent, EventBus, EventType, PublishOptions};

use super::{RegistrationError, ThrottlerController};

type Seen = Arc<Mutex<Vec<BusEvent>>>;

fn setup() -> (Arc<EventBus>, Arc<ThrottlerController>) {
    let bus = EventBus::new();
    let controller = ThrottlerController::new(Arc::clone(&bus));
    (bus, controller)
}

fn collect(bus: &Arc<EventBus>, event_type: EventType) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(event_type, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    })
    .expect("subscribe failed");
    seen
}

/// Publish a progress tick synchronously so the limiter handler runs inline.
fn tick(bus: &Arc<EventBus>, n: i64) {
    bus.publish_with(
        EventType::DownloadProgress,
        json!({ "percent": n }),
        PublishOptions::sync(),
    );
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn percents(seen: &Seen) -> Vec<i64> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|event| event.data["percent"].as_i64().unwrap())
        .collect()
}

// ====================================================================================
// THROTTLE (P4)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_throttle_leading_and_trailing_edges() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "throttle",
            Some(&json!({ "interval": 100 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 0); // t=0, leading edge
    sleep_ms(30).await;
    tick(&bus, 30);
    sleep_ms(30).await;
    tick(&bus, 60);
    sleep_ms(30).await;
    tick(&bus, 90);
    sleep_ms(15).await; // t=105: trailing edge fired at t=100 with latest data

    assert_eq!(percents(&derived), vec![0, 90]);

    sleep_ms(35).await; // t=140
    tick(&bus, 140); // new window anchored at t=100, trailing due t=200
    sleep_ms(61).await; // t=201

    assert_eq!(percents(&derived), vec![0, 90, 140]);
    assert_eq!(
        derived.lock().unwrap()[0].source.as_deref(),
        Some("throttler")
    );
}

#[tokio::test(start_paused = true)]
async fn test_throttle_without_trailing_drops_mid_window() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "throttle",
            Some(&json!({ "interval": 100, "trailing": false })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 0);
    sleep_ms(10).await;
    tick(&bus, 10);
    sleep_ms(10).await;
    tick(&bus, 20);
    sleep_ms(200).await;

    assert_eq!(percents(&derived), vec![0]);
    let status = controller.status(false);
    assert_eq!(status.totals.received, 3);
    assert_eq!(status.totals.emitted, 1);
    assert_eq!(status.totals.dropped, 2);
}

// ====================================================================================
// DEBOUNCE (P5)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_debounce_emits_once_after_the_burst() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "debounce",
            Some(&json!({ "delay": 50 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 0);
    sleep_ms(10).await;
    tick(&bus, 10);
    sleep_ms(10).await;
    tick(&bus, 20);
    sleep_ms(10).await;
    tick(&bus, 30); // t=30; timer due t=80

    sleep_ms(45).await; // t=75: still quiet time left
    assert!(percents(&derived).is_empty());

    sleep_ms(10).await; // t=85
    assert_eq!(percents(&derived), vec![30]);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_leading_edge_per_burst() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "debounce",
            Some(&json!({ "delay": 50, "leading": true })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 1); // leading emission
    sleep_ms(1).await;
    assert_eq!(percents(&derived), vec![1]);

    sleep_ms(9).await;
    tick(&bus, 2); // trailing due t=60
    sleep_ms(55).await;
    assert_eq!(percents(&derived), vec![1, 2]);

    sleep_ms(150).await;
    tick(&bus, 3); // quiet period passed: first of a new burst
    sleep_ms(1).await;
    assert_eq!(percents(&derived), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_leading_single_event_has_no_trailing_duplicate() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "debounce",
            Some(&json!({ "delay": 50, "leading": true })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 7);
    sleep_ms(200).await;

    assert_eq!(percents(&derived), vec![7]);
}

// ====================================================================================
// BATCH (P6)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_batch_flushes_on_size_or_interval() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "batch",
            Some(&json!({ "maxSize": 3, "maxInterval": 1000 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    // Size bound: three rapid events flush immediately.
    tick(&bus, 1);
    tick(&bus, 2);
    tick(&bus, 3);
    sleep_ms(1).await;
    {
        let derived = derived.lock().unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].data["count"], 3);
        let items = derived[0].data["items"].as_array().unwrap();
        let order: Vec<i64> = items
            .iter()
            .map(|item| item["data"]["percent"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    // Interval bound: two events followed by silence flush after 1000ms.
    tick(&bus, 4);
    tick(&bus, 5);
    sleep_ms(900).await;
    assert_eq!(derived.lock().unwrap().len(), 1, "interval not yet elapsed");
    sleep_ms(101).await;
    {
        let derived = derived.lock().unwrap();
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[1].data["count"], 2);
    }
}

// ====================================================================================
// SAMPLE
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_sample_time_window_is_deterministic() {
    let (bus, controller) = setup();
    // rate 0.1 => 10s windows, first 1s of each admits.
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "sample",
            Some(&json!({ "rate": 0.1 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    sleep_ms(500).await;
    tick(&bus, 1); // offset 500 -> admitted
    sleep_ms(1000).await;
    tick(&bus, 2); // offset 1500 -> dropped
    sleep_ms(9000).await;
    tick(&bus, 3); // offset 10500 -> admitted
    sleep_ms(1).await;

    assert_eq!(percents(&derived), vec![1, 3]);
    assert_eq!(controller.status(false).totals.dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sample_probabilistic_rate_one_admits_everything() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "sample",
            Some(&json!({ "rate": 1.0, "timeWindow": false })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    for n in 0..5 {
        tick(&bus, n);
    }
    sleep_ms(1).await;

    assert_eq!(percents(&derived), vec![0, 1, 2, 3, 4]);
}

// ====================================================================================
// TEARDOWN FLUSH (P7)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_unregister_flushes_pending_trailing_emission() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "throttle",
            Some(&json!({ "interval": 10000, "leading": false })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 42);
    controller.unregister(Some(&EventType::DownloadProgress), None);
    sleep_ms(1).await;

    assert_eq!(percents(&derived), vec![42]);

    // The cancelled trailing timer must not fire a duplicate later.
    sleep_ms(11000).await;
    assert_eq!(percents(&derived), vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_after_leading_emission_does_not_duplicate() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "throttle",
            Some(&json!({ "interval": 10000 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 42); // leading edge already emitted
    sleep_ms(1).await;
    controller.unregister(Some(&EventType::DownloadProgress), None);
    sleep_ms(1).await;

    assert_eq!(percents(&derived), vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_flushes_partial_batch_and_announces() {
    let (bus, controller) = setup();
    let unregistered = collect(&bus, EventType::ThrottlerUnregistered);
    controller
        .register(EventType::DownloadProgress, None, "batch", None)
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 1);
    tick(&bus, 2);
    controller.unregister(None, None);
    sleep_ms(1).await;

    let derived = derived.lock().unwrap();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].data["count"], 2);

    let unregistered = unregistered.lock().unwrap();
    assert_eq!(unregistered.len(), 1);
    assert_eq!(unregistered[0].data["sourceEvent"], "DOWNLOAD:PROGRESS");
    assert_eq!(
        unregistered[0].data["targetEvent"],
        "DOWNLOAD:PROGRESS_THROTTLED"
    );
}

// ====================================================================================
// PAUSE / RESUME (P8)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_drops_resume_processes_subsequent_events() {
    let (bus, controller) = setup();
    controller
        .register(
            EventType::DownloadProgress,
            None,
            "throttle",
            Some(&json!({ "interval": 100 })),
        )
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    controller.pause();
    for n in 0..5 {
        tick(&bus, n);
    }
    sleep_ms(200).await;

    assert!(percents(&derived).is_empty());
    let status = controller.status(false);
    assert_eq!(status.totals.received, 5);
    assert_eq!(status.totals.dropped, 5);
    assert!(status.paused);

    controller.resume();
    tick(&bus, 99); // leading edge of a fresh window
    sleep_ms(1).await;
    assert_eq!(percents(&derived), vec![99]);
}

// ====================================================================================
// REGISTRATION RULES (P9, replacement, validation)
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_limiter_cap_per_source_event() {
    let (bus, controller) = setup();
    let errors = collect(&bus, EventType::CoreError);

    for name in ["UI:A", "UI:B", "UI:C"] {
        controller
            .register(
                EventType::DownloadProgress,
                Some(EventType::Custom(name.to_string())),
                "throttle",
                None,
            )
            .unwrap();
    }

    let result = controller.register(
        EventType::DownloadProgress,
        Some(EventType::Custom("UI:D".to_string())),
        "throttle",
        None,
    );
    assert!(matches!(result, Err(RegistrationError::LimitReached { .. })));
    assert_eq!(controller.status(false).limiters, 3, "no partial state");

    // Same failure through the event surface reports a stable code.
    bus.publish_with(
        EventType::ThrottlerRegister,
        json!({ "sourceEvent": "DOWNLOAD:PROGRESS", "targetEvent": "UI:D", "strategy": "throttle" }),
        PublishOptions::sync(),
    );
    sleep_ms(1).await;
    let errors = errors.lock().unwrap();
    assert_eq!(errors.last().unwrap().data["code"], "THROTTLER_LIMIT_REACHED");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_strategy_is_refused_not_fatal() {
    let (bus, controller) = setup();
    let errors = collect(&bus, EventType::CoreError);

    let result = controller.register(EventType::DownloadProgress, None, "smooth", None);
    assert!(matches!(result, Err(RegistrationError::UnknownStrategy(_))));

    bus.publish_with(
        EventType::ThrottlerRegister,
        json!({ "sourceEvent": "DOWNLOAD:PROGRESS", "strategy": "smooth" }),
        PublishOptions::sync(),
    );
    sleep_ms(1).await;
    assert_eq!(
        errors.lock().unwrap().last().unwrap().data["code"],
        "THROTTLER_UNKNOWN_STRATEGY"
    );
    assert_eq!(controller.status(false).limiters, 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_sample_rate_is_refused() {
    let (_bus, controller) = setup();
    let result = controller.register(
        EventType::DownloadProgress,
        None,
        "sample",
        Some(&json!({ "rate": 1.5 })),
    );
    assert!(matches!(result, Err(RegistrationError::InvalidOptions { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_reregistering_same_pair_replaces_after_teardown() {
    let (bus, controller) = setup();
    let registered = collect(&bus, EventType::ThrottlerRegistered);
    let unregistered = collect(&bus, EventType::ThrottlerUnregistered);

    controller
        .register(EventType::DownloadProgress, None, "throttle", None)
        .unwrap();
    controller
        .register(EventType::DownloadProgress, None, "debounce", None)
        .unwrap();
    sleep_ms(1).await;

    assert_eq!(unregistered.lock().unwrap().len(), 1, "old limiter torn down");
    assert_eq!(registered.lock().unwrap().len(), 2);

    let status = controller.status(true);
    assert_eq!(status.limiters, 1);
    let details = status.details.unwrap();
    assert_eq!(details[0].strategy.name(), "debounce");
}

// ====================================================================================
// CONTROL SURFACE: STATUS, CONFIG, LIFECYCLE
// ====================================================================================

#[tokio::test(start_paused = true)]
async fn test_get_status_event_echoes_request_id() {
    let (bus, controller) = setup();
    controller
        .register(EventType::DownloadProgress, None, "throttle", None)
        .unwrap();
    let statuses = collect(&bus, EventType::ThrottlerStatus);

    bus.publish_with(
        EventType::ThrottlerGetStatus,
        json!({ "detailed": true, "requestId": "req-7" }),
        PublishOptions::sync(),
    );
    sleep_ms(1).await;

    let statuses = statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    let data = &statuses[0].data;
    assert_eq!(data["requestId"], "req-7");
    assert_eq!(data["limiters"], 1);
    assert_eq!(data["details"].as_array().unwrap().len(), 1);
    assert_eq!(data["details"][0]["strategy"], "throttle");
}

#[tokio::test(start_paused = true)]
async fn test_config_update_changes_defaults_for_new_limiters() {
    let (bus, controller) = setup();
    bus.publish_with(
        EventType::ConfigUpdated,
        json!({ "defaultThrottleInterval": 80, "maxLimitersPerEvent": 1 }),
        PublishOptions::sync(),
    );

    controller
        .register(EventType::DownloadProgress, None, "throttle", None)
        .unwrap();
    let status = controller.status(true);
    let details = status.details.unwrap();
    assert_eq!(details[0].options["interval"], 80);

    let result = controller.register(
        EventType::DownloadProgress,
        Some(EventType::Custom("UI:EXTRA".to_string())),
        "throttle",
        None,
    );
    assert!(matches!(result, Err(RegistrationError::LimitReached { max: 1, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_app_ready_pulls_configuration() {
    let (bus, _controller) = setup();
    let requests = collect(&bus, EventType::ConfigRequest);

    bus.publish_with(EventType::AppReady, json!({}), PublishOptions::sync());
    sleep_ms(1).await;

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].data["section"], "throttler");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_event_tears_everything_down() {
    let (bus, controller) = setup();
    controller
        .register(EventType::DownloadProgress, None, "batch", None)
        .unwrap();
    let derived = collect(&bus, EventType::DownloadProgress.throttled());

    tick(&bus, 1);
    tick(&bus, 2);
    bus.publish_with(EventType::AppShuttingDown, json!({}), PublishOptions::sync());
    sleep_ms(1).await;

    assert_eq!(derived.lock().unwrap().len(), 1, "partial batch flushed");
    assert_eq!(controller.status(false).limiters, 0);

    // System handlers are detached: further control events are ignored.
    bus.publish_with(
        EventType::ThrottlerRegister,
        json!({ "sourceEvent": "DOWNLOAD:PROGRESS", "strategy": "throttle" }),
        PublishOptions::sync(),
    );
    sleep_ms(1).await;
    assert_eq!(controller.status(false).limiters, 0);
}
