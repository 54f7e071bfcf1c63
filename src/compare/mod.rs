//! Aligns the artifacts of the two binaries by task id and classifies each
//! declared task as identical, differing, or failed.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use crate::dataset::Mode;
use crate::runner::{read_declared_tasks, task_dir, InvocationResult, Side};

/// Execution times fluctuate between runs and would drown real differences.
static TIME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.)?\d+ms|\d+\.\d+s").expect("valid time pattern"));

const TIME_PLACEHOLDER: &str = "[TIME]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Identical,
    Differs,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Identical => "identical",
            Verdict::Differs => "differs",
            Verdict::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureReason {
    /// No captured output for these sides
    MissingArtifact { missing: Vec<Side> },
    /// At least one side ran but did not succeed; `None` for a side that did
    InvocationFailed {
        base: Option<String>,
        branch: Option<String>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::MissingArtifact { missing } => {
                let sides: Vec<_> = missing.iter().map(|s| s.as_str()).collect();
                write!(f, "missing artifact for {}", sides.join(" and "))
            }
            FailureReason::InvocationFailed { base, branch } => {
                let mut parts = Vec::new();
                if let Some(reason) = base {
                    parts.push(format!("base: {}", reason));
                }
                if let Some(reason) = branch {
                    parts.push(format!("branch: {}", reason));
                }
                write!(f, "invocation failed ({})", parts.join("; "))
            }
        }
    }
}

/// The comparator's finding for one declared task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub task: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Unified diff of the resolution artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_diff: Option<String>,
    /// Unified diff of the (redacted) log output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_diff: Option<String>,
    pub base_failed: bool,
    pub branch_failed: bool,
}

impl ComparisonRecord {
    fn failed(task: &str, reason: FailureReason, base_failed: bool, branch_failed: bool) -> Self {
        Self {
            task: task.to_string(),
            verdict: Verdict::Failed,
            failure: Some(reason),
            resolution_diff: None,
            stderr_diff: None,
            base_failed,
            branch_failed,
        }
    }

    /// All diff text for the record, resolution first.
    pub fn diff(&self) -> String {
        let mut text = String::new();
        for diff in [&self.resolution_diff, &self.stderr_diff].into_iter().flatten() {
            text.push_str(diff);
            if !diff.ends_with('\n') {
                text.push('\n');
            }
        }
        text
    }

    /// Base could not resolve this task, branch could.
    pub fn fixed_in_branch(&self) -> bool {
        matches!(self.failure, Some(FailureReason::InvocationFailed { .. }))
            && self.base_failed
            && !self.branch_failed
    }

    /// Base resolved this task, branch could not.
    pub fn regressed_in_branch(&self) -> bool {
        matches!(self.failure, Some(FailureReason::InvocationFailed { .. }))
            && !self.base_failed
            && self.branch_failed
    }
}

/// Canonical text for comparison: LF line endings, no trailing whitespace,
/// no trailing blank lines.
pub fn normalize(text: &str) -> String {
    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r').trim_end())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut normalized = lines.join("\n");
    normalized.push('\n');
    normalized
}

/// Normalized log output with execution times replaced by a placeholder.
pub fn normalize_log(text: &str) -> String {
    let redacted = TIME_PATTERN.replace_all(text, TIME_PLACEHOLDER);
    normalize(&redacted)
}

/// Unified diff between two normalized texts; `None` when they are equal.
///
/// `context` of `None` shows the whole file around each change.
pub fn unified_diff(base: &str, branch: &str, context: Option<usize>) -> Option<String> {
    if base == branch {
        return None;
    }
    let radius = context.unwrap_or_else(|| base.lines().count().max(branch.lines().count()));
    let diff = TextDiff::from_lines(base, branch)
        .unified_diff()
        .context_radius(radius)
        .header("base", "branch")
        .to_string();
    Some(diff)
}

/// Lines of context around a change; the full resolution for `compile`,
/// whose output is a short flat list.
fn context_for(mode: Mode) -> Option<usize> {
    match mode {
        Mode::Compile => None,
        Mode::Lock | Mode::PyprojectToml | Mode::Sync => Some(3),
    }
}

struct SideArtifacts {
    result: InvocationResult,
    resolution: Option<String>,
}

fn load_side(output_dir: &Path, task: &str, mode: Mode) -> Option<SideArtifacts> {
    let dir = task_dir(output_dir, task);
    let result = InvocationResult::load(&dir)?;
    let resolution = match mode {
        Mode::Compile => Some(result.stdout.clone()),
        _ => fs::read_to_string(dir.join(mode.resolution_file())).ok(),
    };
    Some(SideArtifacts { result, resolution })
}

/// Tasks declared by either side, falling back to the task directories
/// present when a side has no task list.
pub fn declared_tasks(base_dir: &Path, branch_dir: &Path) -> Result<Vec<String>> {
    let mut declared = BTreeSet::new();
    for dir in [base_dir, branch_dir] {
        match read_declared_tasks(dir) {
            Some(ids) => declared.extend(ids),
            None if dir.is_dir() => {
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        declared.insert(entry.file_name().to_string_lossy().to_string());
                    }
                }
            }
            None => {}
        }
    }
    Ok(declared.into_iter().collect())
}

/// One record per declared task, sorted by task id.
pub fn compare_dirs(
    base_dir: &Path,
    branch_dir: &Path,
    mode: Mode,
    declared: &[String],
) -> Vec<ComparisonRecord> {
    let mut tasks: Vec<&String> = declared.iter().collect();
    tasks.sort();
    tasks.dedup();

    tasks
        .into_iter()
        .map(|task| compare_task(base_dir, branch_dir, mode, task))
        .collect()
}

pub fn compare_task(
    base_dir: &Path,
    branch_dir: &Path,
    mode: Mode,
    task: &str,
) -> ComparisonRecord {
    let base = load_side(base_dir, task, mode);
    let branch = load_side(branch_dir, task, mode);

    let (base, branch) = match (base, branch) {
        (Some(base), Some(branch)) => (base, branch),
        (base, branch) => {
            let mut missing = Vec::new();
            if base.is_none() {
                missing.push(Side::Base);
            }
            if branch.is_none() {
                missing.push(Side::Branch);
            }
            let base_failed = base.as_ref().is_none_or(|b| !b.result.success());
            let branch_failed = branch.as_ref().is_none_or(|b| !b.result.success());
            return ComparisonRecord::failed(
                task,
                FailureReason::MissingArtifact { missing },
                base_failed,
                branch_failed,
            );
        }
    };

    let base_failure = base.result.failure_description();
    let branch_failure = branch.result.failure_description();
    if base_failure.is_some() || branch_failure.is_some() {
        let base_failed = base_failure.is_some();
        let branch_failed = branch_failure.is_some();
        return ComparisonRecord::failed(
            task,
            FailureReason::InvocationFailed {
                base: base_failure,
                branch: branch_failure,
            },
            base_failed,
            branch_failed,
        );
    }

    // A successful run that left no resolution behind has nothing to compare
    let (base_resolution, branch_resolution) = match (base.resolution, branch.resolution) {
        (Some(base), Some(branch)) => (normalize(&base), normalize(&branch)),
        (base, branch) => {
            let mut missing = Vec::new();
            if base.is_none() {
                missing.push(Side::Base);
            }
            if branch.is_none() {
                missing.push(Side::Branch);
            }
            return ComparisonRecord::failed(
                task,
                FailureReason::MissingArtifact { missing },
                false,
                false,
            );
        }
    };

    let context = context_for(mode);
    let resolution_diff = unified_diff(&base_resolution, &branch_resolution, context);
    let stderr_diff = unified_diff(
        &normalize_log(&base.result.stderr),
        &normalize_log(&branch.result.stderr),
        context,
    );

    let verdict = if resolution_diff.is_none() && stderr_diff.is_none() {
        Verdict::Identical
    } else {
        Verdict::Differs
    };

    ComparisonRecord {
        task: task.to_string(),
        verdict,
        failure: None,
        resolution_diff,
        stderr_diff,
        base_failed: false,
        branch_failed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{STDERR_FILE, STDOUT_FILE, SUMMARY_FILE};
    use tempfile::TempDir;

    fn write_artifact(
        output: &Path,
        task: &str,
        side: Side,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) {
        let dir = task_dir(output, task);
        fs::create_dir_all(&dir).unwrap();
        let result = InvocationResult {
            task: task.to_string(),
            side,
            exit_code: Some(exit_code),
            duration_secs: 0.5,
            timed_out: false,
            spawn_error: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        fs::write(dir.join(SUMMARY_FILE), serde_json::to_string(&result).unwrap()).unwrap();
        fs::write(dir.join(STDOUT_FILE), stdout).unwrap();
        fs::write(dir.join(STDERR_FILE), stderr).unwrap();
    }

    struct Fixture {
        _tmp: TempDir,
        base: std::path::PathBuf,
        branch: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base");
        let branch = tmp.path().join("branch");
        Fixture {
            _tmp: tmp,
            base,
            branch,
        }
    }

    #[test]
    fn normalization_ignores_formatting_noise() {
        assert_eq!(normalize("a  \r\nb\t\n\n\n"), "a\nb\n");
        assert_eq!(normalize("a\nb"), "a\nb\n");
        assert_eq!(normalize("\n\n"), "");
        assert_eq!(normalize("  indented\n"), "  indented\n");
    }

    #[test]
    fn log_times_are_redacted() {
        assert_eq!(
            normalize_log("Resolved 3 packages in 12ms\nPrepared in 1.25s\nWaited 0.5ms\n"),
            "Resolved 3 packages in [TIME]\nPrepared in [TIME]\nWaited [TIME]\n"
        );
    }

    #[test]
    fn identical_artifacts_have_no_diff() {
        let f = fixture();
        write_artifact(&f.base, "attrs", Side::Base, 0, "attrs==1.0\n", "Resolved in 5ms\n");
        write_artifact(
            &f.branch,
            "attrs",
            Side::Branch,
            0,
            "attrs==1.0  \n",
            "Resolved in 9ms\n",
        );

        let record = compare_task(&f.base, &f.branch, Mode::Compile, "attrs");
        assert_eq!(record.verdict, Verdict::Identical);
        assert!(record.diff().is_empty());
        assert!(record.failure.is_none());
    }

    #[test]
    fn differing_line_is_isolated() {
        let f = fixture();
        write_artifact(&f.base, "pkg", Side::Base, 0, "a==1\nb==1\nc==1\n", "");
        write_artifact(&f.branch, "pkg", Side::Branch, 0, "a==1\nb==2\nc==1\n", "");

        let record = compare_task(&f.base, &f.branch, Mode::Compile, "pkg");
        assert_eq!(record.verdict, Verdict::Differs);
        let diff = record.resolution_diff.unwrap();
        let changed: Vec<_> = diff
            .lines()
            .filter(|l| l.starts_with(['-', '+']))
            .filter(|l| !l.starts_with("---") && !l.starts_with("+++"))
            .collect();
        assert_eq!(changed, vec!["-b==1", "+b==2"]);
        assert!(diff.contains("--- base"));
        assert!(diff.contains("+++ branch"));
        assert!(record.stderr_diff.is_none());
    }

    #[test]
    fn missing_side_is_a_failure_naming_the_side() {
        let f = fixture();
        write_artifact(&f.base, "pkg", Side::Base, 0, "a==1\n", "");

        let record = compare_task(&f.base, &f.branch, Mode::Compile, "pkg");
        assert_eq!(record.verdict, Verdict::Failed);
        assert_eq!(
            record.failure,
            Some(FailureReason::MissingArtifact {
                missing: vec![Side::Branch]
            })
        );
        assert_eq!(
            record.failure.unwrap().to_string(),
            "missing artifact for branch"
        );
    }

    #[test]
    fn undeclared_artifacts_do_not_hide_declared_tasks() {
        let f = fixture();
        let declared = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        write_artifact(&f.base, "a", Side::Base, 0, "x\n", "");
        write_artifact(&f.branch, "a", Side::Branch, 0, "x\n", "");

        let records = compare_dirs(&f.base, &f.branch, Mode::Compile, &declared);
        let tasks: Vec<_> = records.iter().map(|r| r.task.as_str()).collect();
        assert_eq!(tasks, vec!["a", "b", "c"]);
        assert_eq!(records[0].verdict, Verdict::Identical);
        assert_eq!(
            records[1].failure,
            Some(FailureReason::MissingArtifact {
                missing: vec![Side::Base, Side::Branch]
            })
        );
    }

    #[test]
    fn failed_invocations_are_classified() {
        let f = fixture();
        write_artifact(&f.base, "fixed", Side::Base, 1, "", "error\n");
        write_artifact(&f.branch, "fixed", Side::Branch, 0, "a==1\n", "");
        write_artifact(&f.base, "broken", Side::Base, 0, "a==1\n", "");
        write_artifact(&f.branch, "broken", Side::Branch, 2, "", "error\n");

        let fixed = compare_task(&f.base, &f.branch, Mode::Compile, "fixed");
        assert_eq!(fixed.verdict, Verdict::Failed);
        assert!(fixed.fixed_in_branch());
        assert!(!fixed.regressed_in_branch());
        assert_eq!(
            fixed.failure.as_ref().unwrap().to_string(),
            "invocation failed (base: exit code 1)"
        );

        let broken = compare_task(&f.base, &f.branch, Mode::Compile, "broken");
        assert!(broken.regressed_in_branch());
    }

    #[test]
    fn lock_modes_compare_the_lockfile() {
        let f = fixture();
        write_artifact(&f.base, "pkg", Side::Base, 0, "", "");
        write_artifact(&f.branch, "pkg", Side::Branch, 0, "", "");
        fs::write(task_dir(&f.base, "pkg").join("uv.lock"), "version = 1\n").unwrap();

        let record = compare_task(&f.base, &f.branch, Mode::Lock, "pkg");
        assert_eq!(
            record.failure,
            Some(FailureReason::MissingArtifact {
                missing: vec![Side::Branch]
            })
        );

        fs::write(task_dir(&f.branch, "pkg").join("uv.lock"), "version = 1\n").unwrap();
        let record = compare_task(&f.base, &f.branch, Mode::Lock, "pkg");
        assert_eq!(record.verdict, Verdict::Identical);
    }

    #[test]
    fn declared_tasks_fall_back_to_directories() {
        let f = fixture();
        write_artifact(&f.base, "a", Side::Base, 0, "", "");
        write_artifact(&f.branch, "b", Side::Branch, 0, "", "");
        assert_eq!(declared_tasks(&f.base, &f.branch).unwrap(), vec!["a", "b"]);
    }
}
