//! End-to-end run: dataset, both binaries, comparison, report.

use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::compare;
use crate::config::DataPaths;
use crate::dataset::fetch::ensure_manifests;
use crate::dataset::{Dataset, DatasetOptions, Mode};
use crate::error::HarnessError;
use crate::report::{self, ModeReport, Report, ReportFormat};
use crate::runner::{
    mode_output, prepare_output, run_all, CancelFlag, RunOptions, RunParameters, RunResults,
    Side, SideSpec,
};

const SLOWEST_SHOWN: usize = 5;

/// Options for a comparison run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub base_bin: PathBuf,
    pub branch_bin: PathBuf,
    pub paths: DataPaths,
    /// Artifact roots; each mode gets a subdirectory
    pub base_output: PathBuf,
    pub branch_output: PathBuf,
    pub modes: Vec<Mode>,
    pub limit: Option<usize>,
    pub latest: bool,
    pub exclude: Vec<String>,
    pub run: RunOptions,
    pub jobs: usize,
    /// Keep existing artifacts and only run what is missing
    pub resume: bool,
    /// Compare existing artifacts without running anything
    pub only_report: bool,
    pub stats: bool,
    pub report: Option<PathBuf>,
    pub format: ReportFormat,
    pub max_diff_lines: usize,
    pub raw_base_url: String,
}

impl PipelineOptions {
    /// Defaults rooted at `paths`, with artifacts in its `base/` and `branch/`.
    pub fn new(base_bin: PathBuf, branch_bin: PathBuf, paths: DataPaths) -> Self {
        let run = RunOptions {
            cache_dir: paths.cache(),
            ..RunOptions::default()
        };
        Self {
            base_bin,
            branch_bin,
            base_output: paths.base_output(),
            branch_output: paths.branch_output(),
            paths,
            modes: Mode::DEFAULT_RUN.to_vec(),
            limit: None,
            latest: false,
            exclude: Vec::new(),
            run,
            jobs: 1,
            resume: false,
            only_report: false,
            stats: false,
            report: None,
            format: ReportFormat::Markdown,
            max_diff_lines: 500,
            raw_base_url: "https://raw.githubusercontent.com".to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.modes.is_empty() {
            return Err(HarnessError::Config("no modes selected".to_string()).into());
        }
        if same_directory(&self.base_output, &self.branch_output) {
            return Err(HarnessError::Config(format!(
                "base and branch would both write to {}",
                self.base_output.display()
            ))
            .into());
        }
        if self.latest {
            if let Some(mode) = self.modes.iter().find(|m| m.uses_manifests()) {
                return Err(HarnessError::Config(format!(
                    "--latest cannot be combined with {} mode",
                    mode
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Whether two paths name the same directory, resolving symlinks and
/// relative components where the paths exist.
fn same_directory(a: &Path, b: &Path) -> bool {
    let resolve = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    a == b || resolve(a) == resolve(b)
}

/// Runs every selected mode and produces the combined report.
///
/// Per-task failures end up in the report; only setup problems, a report
/// that cannot be written, or cancellation return `Err`.
pub fn run(options: &PipelineOptions, cancel: &CancelFlag) -> Result<Report> {
    options.validate()?;
    if let Some(path) = &options.report {
        report::preflight(path)?;
    }

    if !options.only_report && options.modes.iter().any(|m| m.uses_manifests()) {
        let fetched = ensure_manifests(
            &options.paths.pyproject_repositories(),
            &options.paths.pyproject_tomls(),
            &options.raw_base_url,
            options.run.offline || options.run.isolated,
        )?;
        if let Some(summary) = fetched {
            tracing::debug!(?summary, "fetched manifests");
        }
    }

    let mut report = Report::new(options.max_diff_lines);
    for &mode in &options.modes {
        println!("\n{} Mode {}", "▶".cyan(), mode.as_str().white().bold());

        let declared = if options.only_report {
            None
        } else {
            Some(run_mode(options, mode, cancel)?)
        };

        let section = compare_mode(
            &options.base_output,
            &options.branch_output,
            mode,
            declared,
        )?;
        println!(
            "  {} {} identical, {} differ, {} failed",
            "✓".green(),
            section.identical,
            section.differs,
            section.failed
        );
        report.push(section);
    }

    match &options.report {
        Some(path) => {
            report.write(path, options.format)?;
            println!("\n{} Report written to {}", "✓".green(), path.display());
            report.print_summary();
        }
        None => report.print_full(),
    }
    Ok(report)
}

/// Runs both binaries on the mode's dataset; returns the declared task ids.
fn run_mode(options: &PipelineOptions, mode: Mode, cancel: &CancelFlag) -> Result<Vec<String>> {
    let dataset = Dataset::load(
        &options.paths,
        &DatasetOptions {
            mode: Some(mode),
            input: None,
            limit: options.limit,
            latest: options.latest,
            allow_build: options.run.allow_build,
            exclude: options.exclude.clone(),
        },
    )?;
    print_skips(&dataset);
    let ids = dataset.ids();

    let sides = [
        (Side::Base, &options.base_bin, &options.base_output),
        (Side::Branch, &options.branch_bin, &options.branch_output),
    ]
    .map(|(side, binary, root)| SideSpec {
        side,
        binary: binary.clone(),
        output: mode_output(root, mode),
    });

    for spec in &sides {
        let parameters = RunParameters::new(mode, options.latest, &spec.binary, &options.run);
        prepare_output(&spec.output, &parameters, &ids, options.resume)?;
    }

    println!(
        "  Running {} tasks against {} and {}",
        dataset.len(),
        options.base_bin.display(),
        options.branch_bin.display()
    );
    let results = run_all(
        dataset.tasks(),
        &sides,
        &options.run,
        options.jobs,
        options.resume,
        cancel,
    )?;
    if results.reused > 0 {
        println!("  {} Reused {} existing results", "·".dimmed(), results.reused);
    }
    for side in [Side::Base, Side::Branch] {
        print_side_stats(&results, side, options.stats);
    }
    Ok(ids)
}

/// Compares the artifacts of one mode under the two side roots.
///
/// Without an explicit task list, the declarations recorded next to the
/// artifacts are used.
pub fn compare_mode(
    base_root: &Path,
    branch_root: &Path,
    mode: Mode,
    declared: Option<Vec<String>>,
) -> Result<ModeReport> {
    let base_dir = mode_output(base_root, mode);
    let branch_dir = mode_output(branch_root, mode);
    if declared.is_none() && !base_dir.is_dir() && !branch_dir.is_dir() {
        return Err(HarnessError::data_unavailable(&base_dir, "no artifacts for this mode").into());
    }
    let declared = match declared {
        Some(ids) => ids,
        None => compare::declared_tasks(&base_dir, &branch_dir)?,
    };
    let records = compare::compare_dirs(&base_dir, &branch_dir, mode, &declared);
    let parameters = RunParameters::read(&base_dir).ok();
    Ok(ModeReport::new(mode, parameters, records))
}

/// Options for running a single binary
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub binary: PathBuf,
    /// Artifact root; the mode gets a subdirectory
    pub output: PathBuf,
    pub dataset: DatasetOptions,
    pub run: RunOptions,
    pub jobs: usize,
    pub resume: bool,
}

/// Runs a single binary over a mode's dataset, without comparing.
pub fn resolve(
    paths: &DataPaths,
    options: &ResolveOptions,
    cancel: &CancelFlag,
) -> Result<RunResults> {
    let dataset = Dataset::load(paths, &options.dataset)?;
    print_skips(&dataset);

    let spec = SideSpec {
        side: Side::Base,
        binary: options.binary.clone(),
        output: mode_output(&options.output, dataset.mode),
    };
    let parameters = RunParameters::new(
        dataset.mode,
        options.dataset.latest,
        &options.binary,
        &options.run,
    );
    prepare_output(&spec.output, &parameters, &dataset.ids(), options.resume)?;

    println!(
        "  Running {} tasks against {}",
        dataset.len(),
        options.binary.display()
    );
    run_all(
        dataset.tasks(),
        std::slice::from_ref(&spec),
        &options.run,
        options.jobs,
        options.resume,
        cancel,
    )
}

fn print_skips(dataset: &Dataset) {
    let skipped = &dataset.skipped;
    let reasons = [
        (skipped.no_project, "without a [project] table"),
        (skipped.dynamic_dependencies, "with dynamic dependencies"),
        (skipped.invalid, "that are not valid TOML"),
        (skipped.missing_version, "without a known latest version"),
        (skipped.excluded, "excluded by configuration"),
    ];
    for (count, reason) in reasons {
        if count > 0 {
            println!("  {} Skipped {} tasks {}", "!".yellow(), count, reason);
        }
    }
}

pub fn print_side_stats(results: &RunResults, side: Side, stats: bool) {
    let total = results.total(side);
    if total == 0 {
        return;
    }
    let successes = results.success_count(side);
    println!(
        "  {} {}: {}/{} succeeded ({:.0}%)",
        "✓".green(),
        side,
        successes,
        total,
        successes as f64 / total as f64 * 100.0
    );
    if stats {
        for result in results.slowest(side, SLOWEST_SHOWN) {
            println!(
                "      {:>8.2}s  {}",
                result.duration_secs,
                result.task.dimmed()
            );
        }
    }
}
