//! SoundVault backend event core.
//!
//! Every module of the application communicates through one central
//! publish/subscribe bus instead of direct references. This crate is that
//! bus plus the admission-control layer sitting in front of it:
//! - `bus`: in-process pub/sub with bounded history, debug tracing and
//!   per-handler fault isolation
//! - `throttler`: rate limiters (throttle, debounce, batch, sample) that
//!   re-publish noisy source events under derived types at a controlled
//!   frequency
//!
//! # Architecture
//!
//! Download adapters (yt-dlp, ffmpeg, the Tidal tooling), the token store,
//! filesystem workers and the UI are external collaborators: they publish
//! raw events and subscribe to raw or derived ones, nothing more. The bus
//! and the throttler controller are constructed once at process start and
//! handed (or injected) into every component; there is no ambient global.
//!
//! ```no_run
//! use soundvault::{EventBus, EventType, ThrottlerController};
//!
//! let bus = EventBus::new();
//! let throttler = ThrottlerController::new(bus.clone());
//! throttler
//!     .register(EventType::DownloadProgress, None, "throttle", None)
//!     .expect("valid registration");
//! ```

mod bus;
mod throttler;

pub use bus::{
    BusEvent, EventBus, EventType, HandlerError, PublishOptions, SubscribeOptions, SubscriptionId,
};
pub use throttler::{
    BatchOptions, DebounceOptions, LastEvent, LimiterDetail, LimiterStats, RegisteredLimiter,
    RegistrationError, SampleOptions, StatusTotals, Strategy, ThrottleOptions, ThrottlerConfig,
    ThrottlerController, ThrottlerStatus,
};

/// Initialize tracing for a host binary. `RUST_LOG` wins; the default keeps
/// the event core at debug and everything else at info.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soundvault=debug,info".parse().expect("valid env filter")),
        )
        .init();
}
