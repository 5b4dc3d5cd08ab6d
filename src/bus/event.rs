use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Event kinds known to the application, plus an escape hatch for
/// dynamically-composed names (derived throttled types, test-only types).
///
/// Wire names are kept exactly as the frontend and the download adapters
/// publish them, so `EventType::from_name(ty.name())` round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Error channel; every swallowed failure in the event core is reported here.
    CoreError,
    AppReady,
    AppShuttingDown,
    ConfigRequest,
    ConfigUpdated,
    DownloadProgress,
    DownloadStatus,
    DownloadError,
    ThrottlerRegister,
    ThrottlerRegistered,
    ThrottlerUnregister,
    ThrottlerUnregistered,
    ThrottlerPause,
    ThrottlerPaused,
    ThrottlerResume,
    ThrottlerResumed,
    ThrottlerGetStatus,
    ThrottlerStatus,
    Custom(String),
}

impl EventType {
    pub fn name(&self) -> &str {
        match self {
            Self::CoreError => "core:error",
            Self::AppReady => "APP:READY",
            Self::AppShuttingDown => "APP:SHUTTING_DOWN",
            Self::ConfigRequest => "CONFIG:REQUEST",
            Self::ConfigUpdated => "CONFIG:UPDATED",
            Self::DownloadProgress => "DOWNLOAD:PROGRESS",
            Self::DownloadStatus => "DOWNLOAD:STATUS",
            Self::DownloadError => "DOWNLOAD:ERROR",
            Self::ThrottlerRegister => "THROTTLER:REGISTER",
            Self::ThrottlerRegistered => "THROTTLER:REGISTERED",
            Self::ThrottlerUnregister => "THROTTLER:UNREGISTER",
            Self::ThrottlerUnregistered => "THROTTLER:UNREGISTERED",
            Self::ThrottlerPause => "THROTTLER:PAUSE",
            Self::ThrottlerPaused => "THROTTLER:PAUSED",
            Self::ThrottlerResume => "THROTTLER:RESUME",
            Self::ThrottlerResumed => "THROTTLER:RESUMED",
            Self::ThrottlerGetStatus => "THROTTLER:GET_STATUS",
            Self::ThrottlerStatus => "THROTTLER:STATUS",
            Self::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "core:error" => Self::CoreError,
            "APP:READY" => Self::AppReady,
            "APP:SHUTTING_DOWN" => Self::AppShuttingDown,
            "CONFIG:REQUEST" => Self::ConfigRequest,
            "CONFIG:UPDATED" => Self::ConfigUpdated,
            "DOWNLOAD:PROGRESS" => Self::DownloadProgress,
            "DOWNLOAD:STATUS" => Self::DownloadStatus,
            "DOWNLOAD:ERROR" => Self::DownloadError,
            "THROTTLER:REGISTER" => Self::ThrottlerRegister,
            "THROTTLER:REGISTERED" => Self::ThrottlerRegistered,
            "THROTTLER:UNREGISTER" => Self::ThrottlerUnregister,
            "THROTTLER:UNREGISTERED" => Self::ThrottlerUnregistered,
            "THROTTLER:PAUSE" => Self::ThrottlerPause,
            "THROTTLER:PAUSED" => Self::ThrottlerPaused,
            "THROTTLER:RESUME" => Self::ThrottlerResume,
            "THROTTLER:RESUMED" => Self::ThrottlerResumed,
            "THROTTLER:GET_STATUS" => Self::ThrottlerGetStatus,
            "THROTTLER:STATUS" => Self::ThrottlerStatus,
            other => Self::Custom(other.to_string()),
        }
    }

    /// A `Custom` name must be non-blank; every closed variant is valid.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Custom(name) => !name.trim().is_empty(),
            _ => true,
        }
    }

    /// Default derived type for a rate-limited re-publication of `self`.
    pub fn throttled(&self) -> EventType {
        EventType::Custom(format!("{}_THROTTLED", self.name()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// One published occurrence. Immutable after `publish`; handlers only ever
/// see it by shared reference, so no subscriber can affect another's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    pub event_type: EventType,
    pub data: Value,
    pub seq: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first matching dispatch.
    pub once: bool,
    /// Deliver only events whose payload contains all of these top-level fields.
    pub filter: Option<serde_json::Map<String, Value>>,
}

impl SubscribeOptions {
    pub fn filtered(filter: serde_json::Map<String, Value>) -> Self {
        Self {
            once: false,
            filter: Some(filter),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Run handlers inline, in subscription order, before `publish` returns.
    pub sync: bool,
    /// Tag identifying the publisher (adapter name, "ui", "throttler", ...).
    pub source: Option<String>,
}

impl PublishOptions {
    pub fn sync() -> Self {
        Self {
            sync: true,
            source: None,
        }
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            sync: false,
            source: Some(source.into()),
        }
    }
}
