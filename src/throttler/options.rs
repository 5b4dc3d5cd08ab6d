use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(300);
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(1000);
const DEFAULT_SAMPLE_RATE: f64 = 0.1;
const DEFAULT_MAX_LIMITERS_PER_EVENT: usize = 3;

/// Rate-limiting strategy selector. Wire names are lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Throttle,
    Debounce,
    Batch,
    Sample,
}

impl Strategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "throttle" => Some(Self::Throttle),
            "debounce" => Some(Self::Debounce),
            "batch" => Some(Self::Batch),
            "sample" => Some(Self::Sample),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Throttle => "throttle",
            Self::Debounce => "debounce",
            Self::Batch => "batch",
            Self::Sample => "sample",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tunable defaults, adjusted at runtime by `CONFIG:UPDATED` events.
/// Changes apply to limiters registered afterwards.
#[derive(Debug, Clone)]
pub struct ThrottlerConfig {
    pub default_throttle_interval: Duration,
    pub default_debounce_delay: Duration,
    pub default_batch_size: usize,
    pub default_batch_interval: Duration,
    pub default_sample_rate: f64,
    pub max_limiters_per_event: usize,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            default_throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            default_debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            default_batch_size: DEFAULT_BATCH_SIZE,
            default_batch_interval: DEFAULT_BATCH_INTERVAL,
            default_sample_rate: DEFAULT_SAMPLE_RATE,
            max_limiters_per_event: DEFAULT_MAX_LIMITERS_PER_EVENT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigUpdate {
    default_throttle_interval: Option<u64>,
    default_debounce_delay: Option<u64>,
    default_batch_size: Option<usize>,
    default_batch_interval: Option<u64>,
    default_sample_rate: Option<f64>,
    max_limiters_per_event: Option<usize>,
}

impl ThrottlerConfig {
    /// Merge the fields present in a `CONFIG:UPDATED` payload. Unknown and
    /// malformed fields are ignored; the payload may carry unrelated sections.
    pub fn apply_update(&mut self, data: &Value) {
        let update: ConfigUpdate = match serde_json::from_value(data.clone()) {
            Ok(update) => update,
            Err(error) => {
                tracing::warn!("ignoring malformed CONFIG:UPDATED payload: {error}");
                return;
            }
        };
        if let Some(ms) = update.default_throttle_interval {
            self.default_throttle_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = update.default_debounce_delay {
            self.default_debounce_delay = Duration::from_millis(ms);
        }
        if let Some(size) = update.default_batch_size {
            self.default_batch_size = size.max(1);
        }
        if let Some(ms) = update.default_batch_interval {
            self.default_batch_interval = Duration::from_millis(ms);
        }
        if let Some(rate) = update.default_sample_rate {
            if rate > 0.0 && rate <= 1.0 {
                self.default_sample_rate = rate;
            }
        }
        if let Some(max) = update.max_limiters_per_event {
            self.max_limiters_per_event = max.max(1);
        }
    }
}

fn parse_overrides<T>(options: Option<&Value>) -> Result<T, String>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match options {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Per-strategy options: defaults from ThrottlerConfig, overridden field by
// field from the registration payload.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ThrottleOptions {
    pub interval: Duration,
    pub leading: bool,
    pub trailing: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ThrottleOverrides {
    interval: Option<u64>,
    leading: Option<bool>,
    trailing: Option<bool>,
}

impl ThrottleOptions {
    pub fn from_value(options: Option<&Value>, config: &ThrottlerConfig) -> Result<Self, String> {
        let overrides: ThrottleOverrides = parse_overrides(options)?;
        Ok(Self {
            interval: overrides
                .interval
                .map(Duration::from_millis)
                .unwrap_or(config.default_throttle_interval),
            leading: overrides.leading.unwrap_or(true),
            trailing: overrides.trailing.unwrap_or(true),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "interval": self.interval.as_millis() as u64,
            "leading": self.leading,
            "trailing": self.trailing,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DebounceOptions {
    pub delay: Duration,
    pub leading: bool,
    pub trailing: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DebounceOverrides {
    delay: Option<u64>,
    leading: Option<bool>,
    trailing: Option<bool>,
}

impl DebounceOptions {
    pub fn from_value(options: Option<&Value>, config: &ThrottlerConfig) -> Result<Self, String> {
        let overrides: DebounceOverrides = parse_overrides(options)?;
        Ok(Self {
            delay: overrides
                .delay
                .map(Duration::from_millis)
                .unwrap_or(config.default_debounce_delay),
            leading: overrides.leading.unwrap_or(false),
            trailing: overrides.trailing.unwrap_or(true),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "delay": self.delay.as_millis() as u64,
            "leading": self.leading,
            "trailing": self.trailing,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_size: usize,
    pub max_interval: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BatchOverrides {
    max_size: Option<usize>,
    max_interval: Option<u64>,
}

impl BatchOptions {
    pub fn from_value(options: Option<&Value>, config: &ThrottlerConfig) -> Result<Self, String> {
        let overrides: BatchOverrides = parse_overrides(options)?;
        let max_size = overrides.max_size.unwrap_or(config.default_batch_size);
        if max_size == 0 {
            return Err("maxSize must be at least 1".to_string());
        }
        Ok(Self {
            max_size,
            max_interval: overrides
                .max_interval
                .map(Duration::from_millis)
                .unwrap_or(config.default_batch_interval),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "maxSize": self.max_size,
            "maxInterval": self.max_interval.as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub rate: f64,
    pub time_window: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SampleOverrides {
    rate: Option<f64>,
    time_window: Option<bool>,
}

impl SampleOptions {
    pub fn from_value(options: Option<&Value>, config: &ThrottlerConfig) -> Result<Self, String> {
        let overrides: SampleOverrides = parse_overrides(options)?;
        let rate = overrides.rate.unwrap_or(config.default_sample_rate);
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(format!("rate must be in (0, 1], got {rate}"));
        }
        Ok(Self {
            rate,
            time_window: overrides.time_window.unwrap_or(true),
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            "rate": self.rate,
            "timeWindow": self.time_window,
        })
    }
}
