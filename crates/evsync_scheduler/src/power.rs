//! Host power state.
//!
//! Foreground state, standby buckets and battery/storage conditions come from
//! the host OS. The scheduler only sees them through [`PowerStateProvider`].

use parking_lot::RwLock;
use std::fmt;

/// OS-assigned app activity tier, from most to least active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StandbyBucket {
    /// Exempt from restrictions.
    Exempted,
    /// Currently in use.
    Active,
    /// Used regularly.
    WorkingSet,
    /// Used often, not daily.
    Frequent,
    /// Rarely used.
    Rare,
    /// Restricted by the OS.
    Restricted,
}

impl StandbyBucket {
    /// All buckets, most active first.
    pub const ALL: [StandbyBucket; 6] = [
        StandbyBucket::Exempted,
        StandbyBucket::Active,
        StandbyBucket::WorkingSet,
        StandbyBucket::Frequent,
        StandbyBucket::Rare,
        StandbyBucket::Restricted,
    ];

    /// Returns the raw value the OS reports for this bucket.
    pub fn raw(&self) -> i32 {
        match self {
            StandbyBucket::Exempted => 5,
            StandbyBucket::Active => 10,
            StandbyBucket::WorkingSet => 20,
            StandbyBucket::Frequent => 30,
            StandbyBucket::Rare => 40,
            StandbyBucket::Restricted => 45,
        }
    }

    /// Maps a raw OS value to the lowest bucket whose raw value is at least
    /// `raw`. Unknown and non-positive values map to `Exempted`; values past
    /// `Restricted` map to `Restricted`.
    pub fn from_raw(raw: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|bucket| raw <= bucket.raw())
            .unwrap_or(StandbyBucket::Restricted)
    }

    /// Returns the bucket name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StandbyBucket::Exempted => "exempted",
            StandbyBucket::Active => "active",
            StandbyBucket::WorkingSet => "working_set",
            StandbyBucket::Frequent => "frequent",
            StandbyBucket::Rare => "rare",
            StandbyBucket::Restricted => "restricted",
        }
    }
}

impl fmt::Display for StandbyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read access to the host's power state.
pub trait PowerStateProvider: Send + Sync {
    /// Returns true while the app is in the foreground.
    fn is_foreground(&self) -> bool;

    /// Returns the current standby bucket.
    fn standby_bucket(&self) -> StandbyBucket;

    /// Returns true if the battery is low.
    fn is_battery_low(&self) -> bool {
        false
    }

    /// Returns true if storage is low.
    fn is_storage_low(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
struct PowerState {
    foreground: bool,
    bucket: StandbyBucket,
    battery_low: bool,
    storage_low: bool,
}

/// A settable [`PowerStateProvider`] for tests and tools.
///
/// Starts backgrounded in the `Active` bucket with battery and storage fine.
#[derive(Debug)]
pub struct StaticPowerState {
    state: RwLock<PowerState>,
}

impl StaticPowerState {
    /// Creates a backgrounded, active power state.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PowerState {
                foreground: false,
                bucket: StandbyBucket::Active,
                battery_low: false,
                storage_low: false,
            }),
        }
    }

    /// Creates a foregrounded power state.
    pub fn foreground() -> Self {
        let state = Self::new();
        state.set_foreground(true);
        state
    }

    /// Sets the foreground state.
    pub fn set_foreground(&self, foreground: bool) {
        self.state.write().foreground = foreground;
    }

    /// Sets the standby bucket.
    pub fn set_bucket(&self, bucket: StandbyBucket) {
        self.state.write().bucket = bucket;
    }

    /// Sets the low-battery flag.
    pub fn set_battery_low(&self, low: bool) {
        self.state.write().battery_low = low;
    }

    /// Sets the low-storage flag.
    pub fn set_storage_low(&self, low: bool) {
        self.state.write().storage_low = low;
    }
}

impl Default for StaticPowerState {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerStateProvider for StaticPowerState {
    fn is_foreground(&self) -> bool {
        self.state.read().foreground
    }

    fn standby_bucket(&self) -> StandbyBucket {
        self.state.read().bucket
    }

    fn is_battery_low(&self) -> bool {
        self.state.read().battery_low
    }

    fn is_storage_low(&self) -> bool {
        self.state.read().storage_low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_values_map_to_lowest_bucket_at_or_above() {
        assert_eq!(StandbyBucket::from_raw(0), StandbyBucket::Exempted);
        assert_eq!(StandbyBucket::from_raw(-1), StandbyBucket::Exempted);
        assert_eq!(StandbyBucket::from_raw(5), StandbyBucket::Exempted);
        assert_eq!(StandbyBucket::from_raw(6), StandbyBucket::Active);
        assert_eq!(StandbyBucket::from_raw(10), StandbyBucket::Active);
        assert_eq!(StandbyBucket::from_raw(20), StandbyBucket::WorkingSet);
        assert_eq!(StandbyBucket::from_raw(25), StandbyBucket::Frequent);
        assert_eq!(StandbyBucket::from_raw(40), StandbyBucket::Rare);
        assert_eq!(StandbyBucket::from_raw(45), StandbyBucket::Restricted);
        assert_eq!(StandbyBucket::from_raw(50), StandbyBucket::Restricted);
    }

    #[test]
    fn raw_round_trips() {
        for bucket in StandbyBucket::ALL {
            assert_eq!(StandbyBucket::from_raw(bucket.raw()), bucket);
        }
    }

    #[test]
    fn static_state_setters() {
        let power = StaticPowerState::new();
        assert!(!power.is_foreground());
        power.set_bucket(StandbyBucket::Rare);
        power.set_battery_low(true);
        assert_eq!(power.standby_bucket(), StandbyBucket::Rare);
        assert!(power.is_battery_low());
        assert!(!power.is_storage_low());
        assert!(StaticPowerState::foreground().is_foreground());
    }
}
