use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, DataPaths};
use crate::dataset::fetch::{fetch_all, read_repositories};
use crate::dataset::{DatasetOptions, Mode};
use crate::error::HarnessError;
use crate::pipeline::{self, PipelineOptions, ResolveOptions};
use crate::report::{self, Report, ReportFormat};
use crate::runner::{CancelFlag, RunOptions, Side};

#[derive(Parser)]
#[command(
    name = "ecotest",
    about = "Ecosystem testing - compare two resolver builds across popular packages and projects",
    version,
    author
)]
pub struct Cli {
    /// Show debug logging (overridden by ECOTEST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run both binaries over the datasets and write a comparison report
    Run(RunArgs),

    /// Run a single binary over one mode's dataset
    Resolve(ResolveArgs),

    /// Compare artifacts of two earlier runs without rerunning anything
    Report {
        /// Directory holding the configuration (default: $ECOTEST_ROOT or cwd)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Artifact directory of the base binary
        base: PathBuf,

        /// Artifact directory of the branch binary
        branch: PathBuf,

        /// Mode whose artifacts are compared
        #[arg(long, value_enum)]
        mode: Mode,

        /// Output format
        #[arg(long, value_enum, default_value = "markdown")]
        format: ReportFormat,

        /// Write the report here instead of printing a summary
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download the pyproject.toml files of popular GitHub repositories
    Fetch {
        /// Directory holding data/ and pyproject_tomls/ (default: $ECOTEST_ROOT or cwd)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Repository table (org/repo and git ref per row)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Directory the manifests are written to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Flags shared by everything that invokes a resolver.
#[derive(Args, Debug, Clone)]
pub struct ResolverArgs {
    /// Directory holding data/, pyproject_tomls/ and the artifacts (default: $ECOTEST_ROOT or cwd)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Resolver cache directory
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Only run the first N tasks of each mode
    #[arg(long)]
    pub limit: Option<usize>,

    /// Pin every package to its latest known version
    #[arg(long)]
    pub latest: bool,

    /// Python version for resolution
    #[arg(long)]
    pub python: Option<String>,

    /// Pass --offline to the resolver
    #[arg(long)]
    pub offline: bool,

    /// Offline, and hide index and proxy settings from the environment
    #[arg(long)]
    pub isolated: bool,

    /// Allow building source distributions (runs arbitrary code)
    #[arg(long)]
    pub allow_build: bool,

    /// Confirm that arbitrary code may run on this machine
    #[arg(long)]
    pub i_am_in_docker: bool,

    /// Concurrent resolver processes (default: twice the CPU count)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Kill an invocation after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep existing artifacts and only run missing tasks
    #[arg(long)]
    pub resume: bool,

    /// Print the slowest successful tasks
    #[arg(long)]
    pub stats: bool,
}

impl ResolverArgs {
    fn check_build_permission(&self) -> Result<()> {
        if self.allow_build && !self.i_am_in_docker {
            return Err(HarnessError::Config(
                "--allow-build runs arbitrary code from the internet; \
                 pass --i-am-in-docker to confirm this runs in a sandbox"
                    .to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn run_options(&self, paths: &DataPaths, config: &Config) -> RunOptions {
        RunOptions {
            python: self.python.clone().unwrap_or_else(|| config.python.clone()),
            cache_dir: self.cache.clone().unwrap_or_else(|| paths.cache()),
            offline: self.offline,
            isolated: self.isolated,
            allow_build: self.allow_build,
            timeout: self
                .timeout
                .or(config.timeout_secs)
                .map(Duration::from_secs),
        }
    }

    fn jobs(&self, config: &Config) -> usize {
        self.jobs.filter(|&n| n > 0).unwrap_or_else(|| config.effective_jobs())
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// The reference resolver binary
    pub base_bin: PathBuf,

    /// The resolver binary under test
    pub branch_bin: PathBuf,

    /// Artifact directory for the base binary
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Artifact directory for the branch binary
    #[arg(long)]
    pub branch: Option<PathBuf>,

    /// Write the report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "markdown")]
    pub format: ReportFormat,

    /// Modes to run (default: compile, lock, pyproject-toml)
    #[arg(long, value_enum)]
    pub mode: Vec<Mode>,

    /// Compare existing artifacts without running the binaries
    #[arg(long)]
    pub only_report: bool,

    #[command(flatten)]
    pub resolver: ResolverArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// Mode to run
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Resolver binary
    #[arg(long = "bin")]
    pub binary: PathBuf,

    /// Artifact directory
    #[arg(short, long)]
    pub output: PathBuf,

    /// Package table or manifest directory (default: the bundled dataset for the mode)
    #[arg(long)]
    pub input: Option<PathBuf>,

    #[command(flatten)]
    pub resolver: ResolverArgs,
}

pub fn run(args: RunArgs, cancel: &CancelFlag) -> Result<Report> {
    args.resolver.check_build_permission()?;
    let paths = DataPaths::resolve(args.resolver.root.as_deref())?;
    let config = Config::load_from_dir(&paths.root)?;

    let mut options = PipelineOptions::new(args.base_bin, args.branch_bin, paths.clone());
    if let Some(base) = args.base {
        options.base_output = base;
    }
    if let Some(branch) = args.branch {
        options.branch_output = branch;
    }
    if !args.mode.is_empty() {
        options.modes = dedup_modes(args.mode);
    }
    options.limit = args.resolver.limit;
    options.latest = args.resolver.latest;
    options.exclude = config.exclude.clone();
    options.run = args.resolver.run_options(&paths, &config);
    options.jobs = args.resolver.jobs(&config);
    options.resume = args.resolver.resume;
    options.only_report = args.only_report;
    options.stats = args.resolver.stats;
    options.report = args.report;
    options.format = args.format;
    options.max_diff_lines = config.max_diff_lines;
    options.raw_base_url = config.raw_base_url.clone();

    tracing::debug!(?options, "starting run");
    pipeline::run(&options, cancel)
}

pub fn resolve(args: ResolveArgs, cancel: &CancelFlag) -> Result<()> {
    args.resolver.check_build_permission()?;
    let paths = DataPaths::resolve(args.resolver.root.as_deref())?;
    let config = Config::load_from_dir(&paths.root)?;

    let options = ResolveOptions {
        binary: args.binary,
        output: args.output,
        dataset: DatasetOptions {
            mode: Some(args.mode),
            input: args.input,
            limit: args.resolver.limit,
            latest: args.resolver.latest,
            allow_build: args.resolver.allow_build,
            exclude: config.exclude.clone(),
        },
        run: args.resolver.run_options(&paths, &config),
        jobs: args.resolver.jobs(&config),
        resume: args.resolver.resume,
    };

    let results = pipeline::resolve(&paths, &options, cancel)?;
    pipeline::print_side_stats(&results, Side::Base, args.resolver.stats);
    Ok(())
}

pub fn report(
    root: Option<&Path>,
    base: &Path,
    branch: &Path,
    mode: Mode,
    format: ReportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let paths = DataPaths::resolve(root)?;
    let config = Config::load_from_dir(&paths.root)?;
    let section = pipeline::compare_mode(base, branch, mode, None)?;
    let mut document = Report::new(config.max_diff_lines);
    document.push(section);

    match output {
        Some(path) => {
            report::preflight(path)?;
            document.write(path, format)?;
            println!("{} Report written to {}", "✓".green(), path.display());
        }
        None if format == ReportFormat::Text => document.print_full(),
        None => println!("{}", document.render(format)?),
    }
    Ok(())
}

pub fn fetch(root: Option<&Path>, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let paths = DataPaths::resolve(root)?;
    let config = Config::load_from_dir(&paths.root)?;
    let input = input.unwrap_or_else(|| paths.pyproject_repositories());
    let output = output.unwrap_or_else(|| paths.pyproject_tomls());

    if output.exists() {
        println!(
            "{} {} already exists, remove it to fetch again",
            "!".yellow(),
            output.display()
        );
        return Ok(());
    }

    let repositories = read_repositories(&input)?;
    println!(
        "Fetching {} manifests into {}",
        repositories.len(),
        output.display()
    );
    fetch_all(&repositories, &output, &config.raw_base_url)?;
    Ok(())
}

pub fn completions(shell: Shell) {
    clap_complete::generate(
        shell,
        &mut Cli::command(),
        "ecotest",
        &mut std::io::stdout(),
    );
}

/// Selected modes in first-seen order, each once.
fn dedup_modes(modes: Vec<Mode>) -> Vec<Mode> {
    let mut unique = Vec::with_capacity(modes.len());
    for mode in modes {
        if !unique.contains(&mode) {
            unique.push(mode);
        }
    }
    unique
}
