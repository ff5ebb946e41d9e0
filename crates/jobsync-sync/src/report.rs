use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobsync_core::{RunStatus, SyncReport};
use tokio::fs;

pub const REPORT_FILE_NAME: &str = "sync_report.json";
pub const SUMMARY_FILE_NAME: &str = "summary.md";

/// Write `<reports_root>/<run_id>/{sync_report.json,summary.md}` and return the run directory.
pub async fn write_report(reports_root: &Path, report: &SyncReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    fs::write(run_dir.join(REPORT_FILE_NAME), json)
        .await
        .with_context(|| format!("writing {REPORT_FILE_NAME}"))?;
    fs::write(run_dir.join(SUMMARY_FILE_NAME), render_summary_markdown(report))
        .await
        .with_context(|| format!("writing {SUMMARY_FILE_NAME}"))?;

    Ok(run_dir)
}

pub fn render_summary_markdown(report: &SyncReport) -> String {
    let status = match report.status {
        RunStatus::Completed => "completed",
        RunStatus::CompletedWithFailures => "completed with failures",
        RunStatus::Cancelled => "cancelled",
    };
    let counts = &report.counts;
    let mut out = format!(
        "# Job Order Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n\n\
         ## Counts\n- Listed: {}\n- Fetched: {}\n- Inserted: {}\n- Updated: {}\n- Unchanged: {}\n- Failed: {}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        status,
        counts.listed,
        counts.fetched,
        counts.inserted,
        counts.updated,
        counts.unchanged,
        counts.failed,
    );
    if !report.failures.is_empty() {
        out.push_str("\n## Failures\n");
        for failure in &report.failures {
            out.push_str(&format!("- {}: {}\n", failure.external_id, failure.reason));
        }
    }
    out
}

/// Most recent report under `reports_root` by start time, if any run has written one.
pub fn latest_report(reports_root: &Path) -> Result<Option<SyncReport>> {
    if !reports_root.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<SyncReport> = None;
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join(REPORT_FILE_NAME);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let report: SyncReport = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if latest
            .as_ref()
            .map_or(true, |current| report.started_at > current.started_at)
        {
            latest = Some(report);
        }
    }
    Ok(latest)
}
