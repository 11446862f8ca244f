use std::time::Duration;

use rand::Rng;

/// Bounded retry policy for worker selection.
///
/// Backoff grows exponentially from `initial_backoff_ms` and is capped at
/// `max_backoff_ms`. Up to `jitter` of the delay is randomised away so that
/// dispatches racing for the same elastic worker do not poll in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of selection attempts before a job fails
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
    /// Fraction of the delay (0.0..=1.0) that may be randomised away
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately. Used by tests and one-shot runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(u64::from(self.multiplier).saturating_pow(exp))
            .min(self.max_backoff_ms);
        if base == 0 || self.jitter <= 0.0 {
            return Duration::from_millis(base);
        }
        let spread = (base as f64 * self.jitter.min(1.0)) as u64;
        let cut = rand::thread_rng().gen_range(0..=spread);
        Duration::from_millis(base - cut)
    }
}

/// Endpoint of an object store reachable with path-style GETs.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Base URL, e.g. "https://oss-cn-hangzhou.aliyuncs.com"
    pub endpoint: String,
    pub bucket: String,
}

impl ObjectStoreConfig {
    pub fn object_url(&self, object_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            object_name.trim_start_matches('/')
        )
    }
}

/// Configuration for artifact transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Transfers running longer than this fail with a transfer error
    pub timeout_ms: u64,
    /// Remote for SCP transfers ("user@host"). Without one, SCP paths are
    /// copied from the local filesystem.
    pub scp_remote: Option<String>,
    pub oss: Option<ObjectStoreConfig>,
    pub s3: Option<ObjectStoreConfig>,
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10 * 60 * 1000,
            scp_remote: None,
            oss: None,
            s3: None,
        }
    }
}

/// Elastic worker provisioning.
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    /// When false, dispatch never provisions new workers.
    pub enabled: bool,
    /// Workers not ready within this window become unreachable
    pub provisioning_timeout_ms: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provisioning_timeout_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// Workers without a heartbeat for this long are not selectable
    pub heartbeat_staleness_ms: u64,
    /// Interval of the maintenance loop (provisioning expiry, retention sweep)
    pub maintenance_interval_ms: u64,
    /// Active files older than this are soft-deleted by the retention sweep.
    /// `None` disables the sweep.
    pub file_retention_secs: Option<u64>,
    pub retry: RetryPolicy,
    pub transfer: TransferConfig,
    pub elastic: ElasticConfig,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness_ms: 30_000,
            maintenance_interval_ms: 10_000,
            file_retention_secs: Some(7 * 24 * 60 * 60),
            retry: RetryPolicy::default(),
            transfer: TransferConfig::default(),
            elastic: ElasticConfig::default(),
        }
    }
}

impl PlaneConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_elastic(mut self, provisioning_timeout_ms: u64) -> Self {
        self.elastic = ElasticConfig {
            enabled: true,
            provisioning_timeout_ms,
        };
        self
    }

    pub fn with_heartbeat_staleness_ms(mut self, staleness_ms: u64) -> Self {
        self.heartbeat_staleness_ms = staleness_ms;
        self
    }

    pub fn heartbeat_staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_staleness_ms as i64)
    }

    pub fn provisioning_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.elastic.provisioning_timeout_ms as i64)
    }

    pub fn file_retention(&self) -> Option<chrono::Duration> {
        self.file_retention_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}
