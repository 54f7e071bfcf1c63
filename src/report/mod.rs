//! Ecosystem testing report: aggregates comparison records per mode and
//! renders them as markdown, plain text or JSON.

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::compare::{ComparisonRecord, Verdict};
use crate::dataset::Mode;
use crate::error::HarnessError;
use crate::runner::RunParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Text,
    Json,
}

/// Results of one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeReport {
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<RunParameters>,
    pub total: usize,
    pub identical: usize,
    pub differs: usize,
    pub failed: usize,
    pub base_successes: usize,
    pub fixed: Vec<String>,
    pub regressed: Vec<String>,
    pub records: Vec<ComparisonRecord>,
}

impl ModeReport {
    pub fn new(
        mode: Mode,
        parameters: Option<RunParameters>,
        mut records: Vec<ComparisonRecord>,
    ) -> Self {
        records.sort_by(|a, b| a.task.cmp(&b.task));
        let count = |verdict: Verdict| records.iter().filter(|r| r.verdict == verdict).count();
        let tasks_where = |pred: fn(&ComparisonRecord) -> bool| {
            records
                .iter()
                .filter(|r| pred(r))
                .map(|r| r.task.clone())
                .collect::<Vec<_>>()
        };

        Self {
            mode,
            total: records.len(),
            identical: count(Verdict::Identical),
            differs: count(Verdict::Differs),
            failed: count(Verdict::Failed),
            base_successes: records.iter().filter(|r| !r.base_failed).count(),
            fixed: tasks_where(ComparisonRecord::fixed_in_branch),
            regressed: tasks_where(ComparisonRecord::regressed_in_branch),
            parameters,
            records,
        }
    }

    /// Differing and failed records, in task order.
    pub fn notable(&self) -> impl Iterator<Item = &ComparisonRecord> + '_ {
        self.records
            .iter()
            .filter(|r| r.verdict != Verdict::Identical)
    }

    fn base_success_rate(&self) -> f64 {
        percent(self.base_successes, self.total)
    }

    fn dataset_description(&self) -> &'static str {
        match self.mode {
            Mode::Compile | Mode::Lock => "the top 15k PyPI packages",
            Mode::PyprojectToml | Mode::Sync => {
                "the `pyproject.toml` of the top 5k Python GitHub repositories"
            }
        }
    }

    fn command_description(&self) -> String {
        let command = match self.mode {
            Mode::Compile => "pip compile",
            Mode::Lock | Mode::PyprojectToml => "lock",
            Mode::Sync => "sync",
        };
        let mut description = format!("`{}`", command);
        if let Some(parameters) = &self.parameters {
            let _ = write!(description, " with Python {}", parameters.python);
            if parameters.latest {
                description.push_str(", pinned to the latest versions");
            }
            if parameters.allow_build {
                description.push_str(", building from source");
            }
            if parameters.isolated {
                description.push_str(", network isolated");
            } else if parameters.offline {
                description.push_str(", offline");
            }
        }
        description
    }
}

/// The document a full run produces: one section per mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: String,
    pub sections: Vec<ModeReport>,
    #[serde(skip)]
    max_diff_lines: usize,
}

impl Report {
    pub fn new(max_diff_lines: usize) -> Self {
        Self {
            generated_at: chrono::Utc::now().to_rfc3339(),
            sections: Vec::new(),
            max_diff_lines,
        }
    }

    pub fn push(&mut self, section: ModeReport) {
        self.sections.push(section);
    }

    pub fn render(&self, format: ReportFormat) -> Result<String> {
        Ok(match format {
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Text => self.to_text(),
            ReportFormat::Json => serde_json::to_string_pretty(self)?,
        })
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("## Ecosystem testing report\n\n");
        md.push_str(&format!("_Generated {}_\n", self.generated_at));

        for section in &self.sections {
            md.push_str(&format!("\n### {}\n\n", section.mode));
            md.push_str(&format!(
                "Dataset: {}. Command: {}.\n\n",
                section.dataset_description(),
                section.command_description()
            ));

            md.push_str("| Total | Identical | Differs | Failed | Base success |\n");
            md.push_str("|-------|-----------|---------|--------|--------------|\n");
            md.push_str(&format!(
                "| {} | {} | {} | {} | {}/{} ({:.0}%) |\n\n",
                section.total,
                section.identical,
                section.differs,
                section.failed,
                section.base_successes,
                section.total,
                section.base_success_rate()
            ));

            if !section.fixed.is_empty() {
                md.push_str(&format!(
                    "**Fixed in branch:** {}\n\n",
                    code_list(&section.fixed)
                ));
            }
            if !section.regressed.is_empty() {
                md.push_str(&format!(
                    "**Regressed in branch:** {}\n\n",
                    code_list(&section.regressed)
                ));
            }

            for record in section.notable() {
                md.push_str(&format!(
                    "<details>\n<summary><code>{}</code> ({})</summary>\n\n",
                    escape_html(&record.task),
                    record.verdict
                ));
                match &record.failure {
                    Some(reason) => md.push_str(&format!("{}\n\n", reason)),
                    None => {
                        md.push_str("```diff\n");
                        md.push_str(&excerpt(&record.diff(), self.max_diff_lines));
                        md.push_str("```\n\n");
                    }
                }
                md.push_str("</details>\n\n");
            }
        }
        md
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str("Ecosystem testing report\n");
        for section in &self.sections {
            text.push_str(&format!(
                "\n[{}] {} tasks: {} identical, {} differ, {} failed; base {}/{} ({:.0}%)\n",
                section.mode,
                section.total,
                section.identical,
                section.differs,
                section.failed,
                section.base_successes,
                section.total,
                section.base_success_rate()
            ));
            for task in &section.fixed {
                text.push_str(&format!("  fixed in branch: {}\n", task));
            }
            for task in &section.regressed {
                text.push_str(&format!("  regressed in branch: {}\n", task));
            }
            for record in section.notable() {
                match &record.failure {
                    Some(reason) => {
                        text.push_str(&format!("\n{} (failed): {}\n", record.task, reason))
                    }
                    None => {
                        text.push_str(&format!("\n{} (differs):\n", record.task));
                        text.push_str(&excerpt(&record.diff(), self.max_diff_lines));
                    }
                }
            }
        }
        text
    }

    /// Writes the rendered report. Any failure is fatal for the run.
    pub fn write(&self, path: &Path, format: ReportFormat) -> Result<()> {
        let rendered = self.render(format)?;
        fs::write(path, rendered).map_err(|source| HarnessError::ReportWrite {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Colored summary followed by the plain text report with its diff
    /// excerpts, for runs that write no report file.
    pub fn print_full(&self) {
        self.print_summary();
        println!("\n{}", self.to_text());
    }

    /// Print colorized summary to terminal.
    pub fn print_summary(&self) {
        println!("\n{}", "═".repeat(64).dimmed());
        println!("{}", "Ecosystem testing report".green().bold());
        println!("{}", "═".repeat(64).dimmed());

        for section in &self.sections {
            println!("\n  {} {}", "Mode:".bold(), section.mode);
            println!(
                "  {:12} {:>8} {:>8} {:>8} {:>8}",
                "", "Total", "Same", "Differs", "Failed"
            );
            println!("  {}", "─".repeat(48));
            println!(
                "  {:12} {:>8} {:>8} {:>8} {:>8}",
                "tasks",
                section.total,
                section.identical,
                section.differs,
                section.failed
            );
            println!(
                "  {} base succeeded on {}/{} ({:.0}%)",
                "·".dimmed(),
                section.base_successes,
                section.total,
                section.base_success_rate()
            );
            for task in &section.fixed {
                println!("  {} fixed in branch: {}", "✓".green(), task);
            }
            for task in &section.regressed {
                println!("  {} regressed in branch: {}", "✗".red(), task);
            }
            for record in section.notable() {
                let marker = match record.verdict {
                    Verdict::Failed => "✗".red(),
                    _ => "~".yellow(),
                };
                match &record.failure {
                    Some(reason) => println!("  {} {}: {}", marker, record.task, reason),
                    None => println!("  {} {}: differs", marker, record.task),
                }
            }
        }
    }
}

/// Fails early when the report could not be written at the end of a run.
pub fn preflight(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(HarnessError::ReportWrite {
            path: path.to_path_buf(),
            source: std::io::Error::other("path is a directory"),
        }
        .into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| HarnessError::ReportWrite {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// First `max_lines` lines of `text`, with a marker counting the rest.
pub fn excerpt(text: &str, max_lines: usize) -> String {
    let total = text.lines().count();
    let mut out = String::new();
    for line in text.lines().take(max_lines) {
        out.push_str(line);
        out.push('\n');
    }
    if total > max_lines {
        out.push_str(&format!("… {} more lines\n", total - max_lines));
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn code_list(tasks: &[String]) -> String {
    tasks
        .iter()
        .map(|t| format!("`{}`", t))
        .collect::<Vec<_>>()
        .join(", ")
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
