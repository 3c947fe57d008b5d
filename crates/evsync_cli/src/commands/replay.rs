//! Replay command implementation.

use evsync_engine::{EngineConfig, ProcessResult};
use evsync_testkit::{ReplayFixture, ReplayReport};
use serde::Serialize;
use std::path::Path;

/// Summary of a replayed fixture.
#[derive(Debug, Serialize)]
pub struct ReplaySummary {
    /// Stream key.
    pub stream: String,
    /// One line per `process()` run.
    pub runs: Vec<String>,
    /// One line per listener call, in call order.
    pub calls: Vec<String>,
    /// Final checkpoint.
    pub checkpoint: Option<String>,
    /// Rows per listener table.
    pub tables: Vec<TableSize>,
}

/// Row count of one listener table.
#[derive(Debug, Serialize)]
pub struct TableSize {
    /// Listener name.
    pub listener: String,
    /// Number of rows.
    pub rows: usize,
}

fn describe(result: &ProcessResult) -> String {
    match result {
        ProcessResult::Skipped(reason) => format!("skipped ({:?})", reason),
        ProcessResult::BaselineEstablished { event_id } => format!("baseline at {}", event_id),
        ProcessResult::Synced {
            pages,
            events,
            checkpoint,
            more_pending,
        } => format!(
            "synced {} events in {} pages up to {}{}",
            events,
            pages,
            checkpoint,
            if *more_pending { " (more pending)" } else { "" }
        ),
        ProcessResult::Reset => "reset".to_string(),
        ProcessResult::Failed(err) => format!("failed: {}", err),
    }
}

/// Builds the summary of a finished replay.
pub fn summarize(fixture: &ReplayFixture, report: &ReplayReport) -> ReplaySummary {
    ReplaySummary {
        stream: fixture.stream.key(),
        runs: report.results.iter().map(describe).collect(),
        calls: report.log.calls().iter().map(ToString::to_string).collect(),
        checkpoint: report.checkpoint.as_ref().map(ToString::to_string),
        tables: fixture
            .listeners
            .iter()
            .map(|listener| TableSize {
                listener: listener.name.clone(),
                rows: report.store.len(&listener.name),
            })
            .collect(),
    }
}

/// Replays `fixture` and returns its summary.
pub fn replay(
    fixture: &ReplayFixture,
    max_pages: Option<u32>,
) -> Result<ReplaySummary, Box<dyn std::error::Error>> {
    let mut config = EngineConfig::default();
    if let Some(pages) = max_pages {
        config = config.with_max_pages_per_run(pages);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(fixture.run(config))?;
    Ok(summarize(fixture, &report))
}

/// Runs the replay command.
pub fn run(
    path: &Path,
    max_pages: Option<u32>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let fixture = ReplayFixture::load(path)
        .map_err(|e| format!("Failed to load fixture {:?}: {}", path, e))?;
    let summary = replay(&fixture, max_pages)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => print_text_output(&summary),
    }

    Ok(())
}

fn print_text_output(summary: &ReplaySummary) {
    println!("Stream: {}", summary.stream);
    println!();
    println!("Runs:");
    for (i, run) in summary.runs.iter().enumerate() {
        println!("  {}. {}", i + 1, run);
    }
    println!();
    println!("Listener calls:");
    for call in &summary.calls {
        println!("  {}", call);
    }
    println!();
    println!(
        "Checkpoint: {}",
        summary.checkpoint.as_deref().unwrap_or("(none)")
    );
    for table in &summary.tables {
        println!("  {:<16} {} rows", table.listener, table.rows);
    }
}
