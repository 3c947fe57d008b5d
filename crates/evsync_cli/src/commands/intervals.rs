//! Intervals command implementation.

use evsync_scheduler::{SchedulerConfig, StandbyBucket, StaticPowerState};
use serde::Serialize;

/// Resolved repeat interval of one standby bucket.
#[derive(Debug, Serialize)]
pub struct IntervalRow {
    /// Bucket name.
    pub bucket: String,
    /// Raw OS value of the bucket.
    pub raw: i32,
    /// Repeat interval in seconds.
    pub seconds: u64,
}

/// Resolves the repeat interval of every bucket with the default config.
pub fn resolve(foreground: bool, flat: bool) -> Vec<IntervalRow> {
    let config = SchedulerConfig::default().with_standby_aware(!flat);
    let power = StaticPowerState::new();
    power.set_foreground(foreground);

    StandbyBucket::ALL
        .iter()
        .map(|bucket| {
            power.set_bucket(*bucket);
            IntervalRow {
                bucket: bucket.to_string(),
                raw: bucket.raw(),
                seconds: config.repeat_interval(&power).as_secs(),
            }
        })
        .collect()
}

/// Runs the intervals command.
pub fn run(foreground: bool, flat: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rows = resolve(foreground, flat);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            println!("{:<12} {:>4} {:>10}", "bucket", "raw", "seconds");
            for row in &rows {
                println!("{:<12} {:>4} {:>10}", row.bucket, row.raw, row.seconds);
            }
        }
    }

    Ok(())
}
