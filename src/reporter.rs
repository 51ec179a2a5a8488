//! 报告输出
//!
//! Sinks observe a run as it happens: target phase changes, every recorded
//! result, and the final summary. The scheduler holds a list of them and
//! never formats anything for humans itself.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregator::{RunSummary, TestResult, TestStatus};
use crate::scheduler::TargetPhase;

pub trait ReportSink: Send + Sync {
    fn on_target_phase(&self, _target: &str, _phase: TargetPhase) {}

    fn on_result(&self, _result: &TestResult) {}

    fn on_summary(&self, summary: &RunSummary) -> Result<()>;
}

/// Reports through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn on_target_phase(&self, target: &str, phase: TargetPhase) {
        info!("[{target}] {phase}");
    }

    fn on_result(&self, result: &TestResult) {
        let line = format!(
            "[{}] {}: {} ({:?})",
            result.target, result.test, result.status, result.elapsed
        );
        match (result.status, &result.message) {
            (TestStatus::Passed, _) | (_, None) => info!("{line}"),
            (TestStatus::Skipped, Some(reason)) => warn!("{line}: {reason}"),
            (TestStatus::Failed, Some(message)) => error!("{line}\n{message}"),
        }
    }

    fn on_summary(&self, summary: &RunSummary) -> Result<()> {
        info!(
            "Run finished in {}s: {summary}",
            (summary.finished - summary.started).num_seconds()
        );
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create report directory: {}", dir.display()))?;
    }
    Ok(())
}

/// Writes the whole [`RunSummary`] as pretty JSON.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonReportSink {
    fn on_summary(&self, summary: &RunSummary) -> Result<()> {
        create_parent(&self.path)?;
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Unable to write report: {}", self.path.display()))?;
        info!("JSON report written to {}", self.path.display());
        Ok(())
    }
}

/// Markdown summary: one table per target.
#[derive(Debug, Clone)]
pub struct MarkdownReportSink {
    path: PathBuf,
}

impl MarkdownReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn render(summary: &RunSummary) -> String {
        let mut markdown = String::new();
        markdown.push_str("# 测试结果总结\n\n");
        let _ = writeln!(
            markdown,
            "{} ({})\n",
            summary,
            summary.started.format("%Y-%m-%d %H:%M:%S")
        );

        let mut targets: Vec<&str> = Vec::new();
        for result in &summary.results {
            if !targets.contains(&result.target.as_str()) {
                targets.push(&result.target);
            }
        }
        for target in targets {
            let _ = writeln!(markdown, "## {target}\n");
            markdown.push_str("| Test | Result | Time | Details |\n|---|---|---|---|\n");
            for result in summary.results.iter().filter(|r| r.target == target) {
                let details = result
                    .message
                    .as_deref()
                    .and_then(|m| m.lines().next())
                    .unwrap_or("")
                    .replace('|', "\\|");
                let _ = writeln!(
                    markdown,
                    "| {} | {} | {} | {} |",
                    result.test,
                    result.status,
                    humantime_serde::re::humantime::format_duration(result.elapsed),
                    details
                );
            }
            markdown.push('\n');
        }
        markdown
    }
}

impl ReportSink for MarkdownReportSink {
    fn on_summary(&self, summary: &RunSummary) -> Result<()> {
        create_parent(&self.path)?;
        fs::write(&self.path, Self::render(summary))
            .with_context(|| format!("Unable to write report: {}", self.path.display()))?;
        info!("Markdown report written to {}", self.path.display());
        Ok(())
    }
}
