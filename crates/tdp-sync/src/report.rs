use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tdp_core::RunSummary;
use tokio::fs;

pub fn summary_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        format!("# {} run `{}`", summary.pipeline, summary.run_token),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Verdict: {}", summary.verdict.as_str()),
        format!("- Started: {}", summary.started_at),
        format!(
            "- Finished: {}",
            summary
                .finished_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!(
            "- Items: {} attempted, {} succeeded, {} failed, {} abandoned",
            summary.attempted,
            summary.succeeded,
            summary.failed.len(),
            summary.abandoned.len()
        ),
        format!("- Records staged: {}", summary.records_staged),
    ];
    if summary.cancelled {
        lines.push("- Cancelled before all items resolved".to_string());
    }
    if let Some(load) = &summary.load {
        lines.push(format!(
            "- Load `{}`: {} inserted, {} updated, {} unchanged, {} total rows ({} attempt(s))",
            load.table, load.inserted, load.updated, load.unchanged, load.total_rows, load.attempts
        ));
    }
    if let Some(err) = &summary.fatal_error {
        lines.push(format!("- Fatal: {err}"));
    }

    if !summary.failed.is_empty() {
        lines.push(String::new());
        lines.push("## Failed items".to_string());
        lines.extend(
            summary
                .failed
                .iter()
                .map(|f| format!("- {}: {}", f.source_item_id, f.reason)),
        );
    }
    if !summary.abandoned.is_empty() {
        lines.push(String::new());
        lines.push("## Abandoned items".to_string());
        lines.extend(summary.abandoned.iter().map(|id| format!("- {id}")));
    }
    if !summary.defaulted_fields.is_empty() {
        lines.push(String::new());
        lines.push("## Defaulted fields".to_string());
        lines.extend(
            summary
                .defaulted_fields
                .iter()
                .map(|(field, count)| format!("- {field}: {count}")),
        );
    }
    if !summary.degraded.is_empty() {
        lines.push(String::new());
        lines.push("## Degraded".to_string());
        lines.extend(
            summary
                .degraded
                .iter()
                .map(|d| format!("- {}: {}", d.source_item_id, d.reason)),
        );
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `run_summary.json` and `summary.md` under `{reports_root}/{run_token}/`.
pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(&summary.run_token);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("summary.md"), summary_markdown(summary))
        .await
        .context("writing summary.md")?;
    Ok(dir)
}

/// Markdown digest of the `runs` most recent run reports, newest first.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| path.join("run_summary.json").is_file())
        .collect::<Vec<_>>();
    // Run tokens start with a UTC timestamp, so names sort chronologically.
    dirs.sort();
    dirs.reverse();

    let mut lines = vec!["# Recent pipeline runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.join("run_summary.json");
        let raw = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let summary: RunSummary = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## `{}` ({})", summary.run_token, summary.pipeline));
        lines.push(format!("- verdict: {}", summary.verdict.as_str()));
        lines.push(format!(
            "- items: {}/{} succeeded",
            summary.succeeded, summary.attempted
        ));
        if let Some(load) = &summary.load {
            lines.push(format!(
                "- load: {} inserted, {} updated, {} unchanged",
                load.inserted, load.updated, load.unchanged
            ));
        }
        if let Some(err) = &summary.fatal_error {
            lines.push(format!("- fatal: {err}"));
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
