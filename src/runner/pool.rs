//! Bounded parallel execution of (task, side) invocations.
//!
//! The worker count is the only concurrency limit: each worker blocks on one
//! child process at a time. Every invocation writes into its own task
//! directory, so workers share nothing but the cancellation flag.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{invoke, task_dir, InvocationResult, RunOptions, Side};
use crate::dataset::{Mode, Task};
use crate::error::HarnessError;

/// Set once by an interrupt; in-flight children are killed when they see it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag raised by Ctrl+C. Can only be installed once per process.
    pub fn install_ctrlc() -> Result<Self> {
        let flag = Self::new();
        let handler_flag = flag.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted, stopping resolver processes...");
            handler_flag.cancel();
        })
        .context("Failed to install Ctrl+C handler")?;
        Ok(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One binary under test and where its artifacts for a mode go.
#[derive(Debug, Clone)]
pub struct SideSpec {
    pub side: Side,
    pub binary: PathBuf,
    pub output: PathBuf,
}

/// Results keyed by side, then task id.
#[derive(Debug, Clone, Default)]
pub struct RunResults {
    by_side: BTreeMap<Side, BTreeMap<String, InvocationResult>>,
    pub reused: usize,
}

impl RunResults {
    fn insert(&mut self, result: InvocationResult) {
        self.by_side
            .entry(result.side)
            .or_default()
            .insert(result.task.clone(), result);
    }

    pub fn get(&self, side: Side, task: &str) -> Option<&InvocationResult> {
        self.by_side.get(&side)?.get(task)
    }

    pub fn side(&self, side: Side) -> impl Iterator<Item = &InvocationResult> + '_ {
        self.by_side.get(&side).into_iter().flat_map(|m| m.values())
    }

    pub fn total(&self, side: Side) -> usize {
        self.side(side).count()
    }

    pub fn success_count(&self, side: Side) -> usize {
        self.side(side).filter(|r| r.success()).count()
    }

    /// Slowest successful invocations first.
    pub fn slowest(&self, side: Side, n: usize) -> Vec<&InvocationResult> {
        let mut successes: Vec<_> = self.side(side).filter(|r| r.success()).collect();
        successes.sort_by(|a, b| b.duration_secs.total_cmp(&a.duration_secs));
        successes.truncate(n);
        successes
    }
}

struct Job<'a> {
    task: &'a Task,
    side: &'a SideSpec,
}

/// Runs every task against every side with at most `jobs` concurrent
/// subprocesses. Completion order is arbitrary; results are keyed by task.
///
/// With `resume`, a task whose artifacts already exist is not rerun.
pub fn run_all(
    tasks: &[Task],
    sides: &[SideSpec],
    options: &RunOptions,
    jobs: usize,
    resume: bool,
    cancel: &CancelFlag,
) -> Result<RunResults> {
    let mut results = RunResults::default();
    let mut pending = Vec::new();
    for side in sides {
        for task in tasks {
            if resume {
                if let Some(previous) = InvocationResult::load(&task_dir(&side.output, &task.id)) {
                    tracing::debug!(task = %task.id, side = %side.side, "reusing artifacts");
                    results.insert(previous);
                    results.reused += 1;
                    continue;
                }
            }
            pending.push(Job { task, side });
        }
    }

    let progress = ProgressBar::new(pending.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .context("Failed to build worker pool")?;

    let outcomes: Vec<Result<Option<InvocationResult>>> = pool.install(|| {
        pending
            .par_iter()
            .map(|job| {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let result = run_job(job, options, cancel)?;
                progress.set_message(format!("{} ({})", job.task.id, job.side.side));
                progress.inc(1);
                Ok(Some(result))
            })
            .collect()
    });
    progress.finish_and_clear();

    if cancel.is_cancelled() {
        return Err(HarnessError::Cancelled.into());
    }

    for outcome in outcomes {
        if let Some(result) = outcome? {
            results.insert(result);
        }
    }
    Ok(results)
}

fn run_job(job: &Job<'_>, options: &RunOptions, cancel: &CancelFlag) -> Result<InvocationResult> {
    let result = invoke(
        job.task,
        job.side.side,
        &job.side.binary,
        &job.side.output,
        options,
        cancel,
    )?;
    if let Some(reason) = result.failure_description() {
        tracing::debug!(task = %job.task.id, side = %job.side.side, %reason, "invocation failed");
    }
    Ok(result)
}

/// Output directory of one side for one mode.
pub fn mode_output(root: &Path, mode: Mode) -> PathBuf {
    root.join(mode.as_str())
}
