use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune scan orchestration behaviour.
///
/// All fields carry defaults so hosts can override a single value without
/// supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogScanConfig {
    /// Drivers that must never start a scan. Names are matched exactly.
    pub disabled_drivers: Vec<String>,
    /// Terminal index scans kept per driver after a scan completes. Older
    /// ones are deleted.
    pub old_index_scans_to_keep: usize,
    /// How many of the newest index scans are inspected when looking for an
    /// already running scan.
    pub latest_scans_to_check: usize,
    /// Name of the cursor that gates bucket-range scans. Bucket-range scans
    /// are rejected while this cursor trails any driver in the closure.
    pub bucketed_package_cursor: Option<String>,
    /// Start lease tuning.
    pub lease: StartLeaseConfig,
    /// Leaf message processing policy.
    pub leaf: LeafRetryConfig,
    /// Index message processing policy.
    pub index: IndexRetryConfig,
    /// Message delay bands shared by every processor.
    pub backoff: BackoffConfig,
    /// Fan-out recovery tuning for stalled expansions.
    pub fan_out: FanOutConfig,
    /// Queue consumer tuning.
    pub worker: WorkerConfig,
}

impl Default for CatalogScanConfig {
    fn default() -> Self {
        Self {
            disabled_drivers: Vec::new(),
            old_index_scans_to_keep: 9,
            latest_scans_to_check: 20,
            bucketed_package_cursor: None,
            lease: StartLeaseConfig::default(),
            leaf: LeafRetryConfig::default(),
            index: IndexRetryConfig::default(),
            backoff: BackoffConfig::default(),
            fan_out: FanOutConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl CatalogScanConfig {
    pub fn is_disabled(&self, driver: &str) -> bool {
        self.disabled_drivers.iter().any(|name| name == driver)
    }
}

/// Lease used to serialise scan starts for a single driver.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StartLeaseConfig {
    /// How long the start lease is held before another worker may take it
    /// (seconds).
    pub start_lease_duration_secs: u64,
}

impl Default for StartLeaseConfig {
    fn default() -> Self {
        Self {
            start_lease_duration_secs: 60,
        }
    }
}

impl StartLeaseConfig {
    pub fn start_lease_duration(&self) -> Duration {
        Duration::from_secs(self.start_lease_duration_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafRetryConfig {
    /// Attempt ceiling; a leaf beyond it is moved to the poison queue.
    pub max_attempts: u32,
    /// Fixed reschedule delay after an optimistic-concurrency conflict or a
    /// driver deferral (seconds).
    pub try_again_later_secs: u64,
    /// Upper bound for waiting out a leaf's backoff window (seconds).
    pub max_wait_secs: u64,
    /// Slack added to the remaining backoff to absorb clock skew (seconds).
    pub clock_skew_secs: u64,
}

impl Default for LeafRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            try_again_later_secs: 60,
            max_wait_secs: 5 * 60,
            clock_skew_secs: 5,
        }
    }
}

impl LeafRetryConfig {
    pub fn try_again_later(&self) -> Duration {
        Duration::from_secs(self.try_again_later_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexRetryConfig {
    /// Redeliveries tolerated for a message whose index scan record is not
    /// visible yet.
    pub missing_scan_max_attempts: u32,
    /// Attempt count added after losing an etag race, pushing the retry far
    /// into the delay bands.
    pub conflict_attempt_penalty: u32,
    /// Time spent in `Working` without completion before unstarted child
    /// work is enqueued again (seconds).
    pub fan_out_recovery_after_secs: u64,
}

impl Default for IndexRetryConfig {
    fn default() -> Self {
        Self {
            missing_scan_max_attempts: 10,
            conflict_attempt_penalty: 60,
            fan_out_recovery_after_secs: 10 * 60,
        }
    }
}

impl IndexRetryConfig {
    pub fn fan_out_recovery_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.fan_out_recovery_after_secs).unwrap_or(i64::MAX),
        )
    }
}

/// Delay policy shared by every processor.
///
/// Leaf retries use randomised bands: attempt 1 waits somewhere below
/// `first_attempt_max_ms`, attempt `n` waits within
/// `[(n-1)*increment, n*increment)`. Index and page messages that requeue
/// themselves wait `min(attempt * requeue_factor, requeue_max)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub first_attempt_max_ms: u64,
    pub increment_ms: u64,
    /// Seconds of delay added per attempt when an index message requeues.
    pub requeue_factor_secs: u64,
    /// Ceiling for the index requeue delay (seconds).
    pub requeue_max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_attempt_max_ms: 60_000,
            increment_ms: 120_000,
            requeue_factor_secs: 1,
            requeue_max_secs: 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum page or leaf scans re-enqueued per recovery pass.
    pub requeue_take: usize,
    /// Leaf scans read and enqueued per chunk when an index scan fans out.
    pub enqueue_take: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            requeue_take: 1_000,
            enqueue_take: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent consumer loops started by the worker.
    pub parallelism: usize,
    /// Messages taken per dequeue. Leaf messages in one dequeue are
    /// processed as a batch.
    pub batch_size: usize,
    /// Sleep between polls of an empty queue (milliseconds).
    pub idle_poll_ms: u64,
    /// Index and page deliveries beyond this count are dead-lettered.
    pub max_dequeue_count: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            batch_size: 32,
            idle_poll_ms: 50,
            max_dequeue_count: 16,
        }
    }
}

impl WorkerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
