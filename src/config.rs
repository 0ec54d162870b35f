//! Task configuration and scheduler construction options.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use typed_builder::TypedBuilder;

pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_execution_type() -> String {
    "agent".to_string()
}

/// Per-task execution options, embedded in [`crate::model::ScheduledTask`] and persisted as a
/// JSON blob by the Store. Durations round-trip as integer nanoseconds; unset fields
/// deserialize to the defaults below rather than failing.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskConfig {
    /// Max wall-clock time for a single execution attempt. Default 5 minutes.
    #[serde(with = "duration_nanos", default = "default_timeout")]
    #[builder(default = default_timeout())]
    pub timeout: Duration,

    /// Additional attempts after a `failed` outcome. Default 0 (no retries).
    #[serde(default)]
    #[builder(default = 0)]
    pub max_retries: i32,

    /// Delay from failure to the retry's `scheduled_at`. Default 30 seconds.
    #[serde(with = "duration_nanos", default = "default_retry_delay")]
    #[builder(default = default_retry_delay())]
    pub retry_delay: Duration,

    /// If false, a due fire is skipped while any execution of the task is still running.
    #[serde(default)]
    #[builder(default = false)]
    pub allow_overlap: bool,

    /// Selects an entry in the executor router. Recognised values: `agent`, `message`.
    #[serde(default = "default_execution_type")]
    #[builder(default = default_execution_type())]
    pub execution_type: String,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub channel: Option<String>,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub channel_id: Option<String>,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub session_id: Option<String>,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub system_prompt: Option<String>,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub model: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: 0,
            retry_delay: default_retry_delay(),
            allow_overlap: false,
            execution_type: default_execution_type(),
            channel: None,
            channel_id: None,
            session_id: None,
            system_prompt: None,
            model: None,
        }
    }
}

impl TaskConfig {
    /// `serde_json::from_slice` but treats a missing/empty body as the zero-value config rather
    /// than an error, matching the round-trip law `Unmarshal(nil) == zero value`.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_slice::<Option<Self>>(bytes)? {
            Some(cfg) => Ok(cfg),
            None => Ok(Self::default()),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Tuning knobs for one worker's [`crate::scheduler::Scheduler`] instance. Any zero or negative
/// numeric defaults per field below; `worker_id` defaults to a freshly generated identifier.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SchedulerConfig {
    #[builder(default = default_worker_id())]
    pub worker_id: String,

    /// Poll Loop tick cadence. Default 10s.
    #[builder(default = Duration::from_secs(10))]
    pub poll_interval: Duration,

    /// Poll Loop batch size. Default 100.
    #[builder(default = 100)]
    pub poll_batch_limit: i64,

    /// Claim Loop tick cadence. Default 1s.
    #[builder(default = Duration::from_secs(1))]
    pub acquire_interval: Duration,

    /// Lease duration granted on a successful claim. Default 10 minutes.
    #[builder(default = Duration::from_secs(10 * 60))]
    pub lock_duration: Duration,

    /// Max concurrently in-flight executions per worker. Default 5.
    #[builder(default = 5)]
    pub max_concurrency: usize,

    /// Reaper tick cadence. Default 1 minute.
    #[builder(default = Duration::from_secs(60))]
    pub cleanup_interval: Duration,

    /// A `running` execution older than this (by `started_at`) is reclaimed by the Reaper.
    /// Default 30 minutes.
    #[builder(default = Duration::from_secs(30 * 60))]
    pub stale_timeout: Duration,
}

impl SchedulerConfig {
    /// Applies the documented defaults to any zero/negative field: any zero or negative
    /// numeric value is replaced with its default. Useful for configs built by hand rather
    /// than through the builder (e.g. deserialized from an external source).
    pub fn normalized(mut self) -> Self {
        let default = Self::builder().build();
        if self.worker_id.trim().is_empty() {
            self.worker_id = default.worker_id;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = default.poll_interval;
        }
        if self.poll_batch_limit <= 0 {
            self.poll_batch_limit = default.poll_batch_limit;
        }
        if self.acquire_interval.is_zero() {
            self.acquire_interval = default.acquire_interval;
        }
        if self.lock_duration.is_zero() {
            self.lock_duration = default.lock_duration;
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = default.max_concurrency;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = default.cleanup_interval;
        }
        if self.stale_timeout.is_zero() {
            self.stale_timeout = default.stale_timeout;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = TaskConfig::builder()
            .max_retries(3)
            .allow_overlap(true)
            .execution_type("message")
            .channel("sms")
            .build();
        let bytes = cfg.to_json_bytes().unwrap();
        let back = TaskConfig::from_json_bytes(&bytes).unwrap();
        assert_eq!(back.max_retries, 3);
        assert!(back.allow_overlap);
        assert_eq!(back.execution_type, "message");
        assert_eq!(back.channel.as_deref(), Some("sms"));
    }

    #[test]
    fn empty_bytes_produce_zero_value_config() {
        let cfg = TaskConfig::from_json_bytes(&[]).unwrap();
        assert_eq!(cfg.max_retries, 0);
        assert!(!cfg.allow_overlap);
        assert_eq!(cfg.execution_type, "agent");
    }

    #[test]
    fn null_json_produces_zero_value_config() {
        let cfg = TaskConfig::from_json_bytes(b"null").unwrap();
        assert_eq!(cfg.max_retries, 0);
    }

    #[test]
    fn durations_serialize_as_integer_nanos() {
        let cfg = TaskConfig::default();
        let value: serde_json::Value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(value["timeout"], serde_json::json!(300_000_000_000u64));
        assert_eq!(value["retry_delay"], serde_json::json!(30_000_000_000u64));
    }

    #[test]
    fn scheduler_config_normalizes_non_positive_fields() {
        let cfg = SchedulerConfig::builder()
            .max_concurrency(0usize)
            .poll_batch_limit(-1i64)
            .build()
            .normalized();
        assert_eq!(cfg.max_concurrency, 5);
        assert_eq!(cfg.poll_batch_limit, 100);
    }
}
