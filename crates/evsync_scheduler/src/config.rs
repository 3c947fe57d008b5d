//! Configuration for the sync scheduler.

use crate::backoff::BackoffPolicy;
use crate::power::{PowerStateProvider, StandbyBucket};
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Background repeat interval of each standby bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyIntervals {
    /// `Exempted`, also used for unknown buckets.
    pub exempted: Duration,
    /// `Active`.
    pub active: Duration,
    /// `WorkingSet`.
    pub working_set: Duration,
    /// `Frequent`.
    pub frequent: Duration,
    /// `Rare`.
    pub rare: Duration,
    /// `Restricted`.
    pub restricted: Duration,
}

impl StandbyIntervals {
    /// Returns the interval of `bucket`.
    pub fn get(&self, bucket: StandbyBucket) -> Duration {
        match bucket {
            StandbyBucket::Exempted => self.exempted,
            StandbyBucket::Active => self.active,
            StandbyBucket::WorkingSet => self.working_set,
            StandbyBucket::Frequent => self.frequent,
            StandbyBucket::Rare => self.rare,
            StandbyBucket::Restricted => self.restricted,
        }
    }

    /// Sets the interval of `bucket`.
    pub fn with(mut self, bucket: StandbyBucket, interval: Duration) -> Self {
        let slot = match bucket {
            StandbyBucket::Exempted => &mut self.exempted,
            StandbyBucket::Active => &mut self.active,
            StandbyBucket::WorkingSet => &mut self.working_set,
            StandbyBucket::Frequent => &mut self.frequent,
            StandbyBucket::Rare => &mut self.rare,
            StandbyBucket::Restricted => &mut self.restricted,
        };
        *slot = interval;
        self
    }
}

impl Default for StandbyIntervals {
    fn default() -> Self {
        Self {
            exempted: Duration::from_secs(30 * MINUTE),
            active: Duration::from_secs(30 * MINUTE),
            working_set: Duration::from_secs(2 * HOUR),
            frequent: Duration::from_secs(8 * HOUR),
            rare: Duration::from_secs(24 * HOUR),
            restricted: Duration::from_secs(72 * HOUR),
        }
    }
}

/// Conditions a job needs before it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobConstraints {
    /// Wait while the battery is low.
    pub requires_battery_not_low: bool,
    /// Wait while storage is low.
    pub requires_storage_not_low: bool,
}

impl JobConstraints {
    /// Returns true if `power` allows running now.
    pub fn is_satisfied(&self, power: &dyn PowerStateProvider) -> bool {
        !(self.requires_battery_not_low && power.is_battery_low())
            && !(self.requires_storage_not_low && power.is_storage_low())
    }
}

/// Configuration for the sync scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Backoff after retryable failures.
    pub backoff: BackoffPolicy,
    /// Repeat interval while the app is in the foreground.
    pub repeat_interval_foreground: Duration,
    /// Background repeat interval when standby buckets are ignored.
    pub repeat_interval_background_flat: Duration,
    /// Background repeat interval per standby bucket.
    pub standby_intervals: StandbyIntervals,
    /// Whether the background interval depends on the standby bucket.
    pub standby_aware: bool,
    /// Delay before the first run of a newly enqueued job.
    pub initial_delay: Duration,
    /// Run conditions.
    pub constraints: JobConstraints,
    /// Consecutive retries after which each further retry is logged as a
    /// warning.
    pub max_retries_before_warning: u32,
}

impl SchedulerConfig {
    /// Creates a new scheduler configuration with default values.
    pub fn new() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            repeat_interval_foreground: Duration::from_secs(5 * MINUTE),
            repeat_interval_background_flat: Duration::from_secs(30 * MINUTE),
            standby_intervals: StandbyIntervals::default(),
            standby_aware: true,
            initial_delay: Duration::ZERO,
            constraints: JobConstraints::default(),
            max_retries_before_warning: 5,
        }
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the foreground repeat interval.
    pub fn with_foreground_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval_foreground = interval;
        self
    }

    /// Sets the flat background repeat interval.
    pub fn with_background_flat_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval_background_flat = interval;
        self
    }

    /// Sets the per-bucket intervals.
    pub fn with_standby_intervals(mut self, intervals: StandbyIntervals) -> Self {
        self.standby_intervals = intervals;
        self
    }

    /// Enables or disables standby-bucket awareness.
    pub fn with_standby_aware(mut self, aware: bool) -> Self {
        self.standby_aware = aware;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the run constraints.
    pub fn with_constraints(mut self, constraints: JobConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sets the retry warning threshold.
    pub fn with_max_retries_before_warning(mut self, retries: u32) -> Self {
        self.max_retries_before_warning = retries;
        self
    }

    /// Returns the background interval of `bucket`.
    pub fn background_interval(&self, bucket: StandbyBucket) -> Duration {
        if self.standby_aware {
            self.standby_intervals.get(bucket)
        } else {
            self.repeat_interval_background_flat
        }
    }

    /// Returns the repeat interval for the current power state.
    pub fn repeat_interval(&self, power: &dyn PowerStateProvider) -> Duration {
        if power.is_foreground() {
            self.repeat_interval_foreground
        } else {
            self.background_interval(power.standby_bucket())
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
