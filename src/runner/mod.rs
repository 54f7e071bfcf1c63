//! Runs one task against one resolver binary and persists what it printed.
//!
//! A failing resolver is not an error here: its exit status is recorded like
//! any other outcome. Only harness-side I/O problems surface as `Err`.

pub mod pool;

pub use pool::{mode_output, run_all, CancelFlag, RunResults, SideSpec};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::dataset::{Mode, Task};
use crate::error::HarnessError;

pub const SUMMARY_FILE: &str = "summary.json";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const PARAMETERS_FILE: &str = "parameters.json";
pub const TASKS_FILE: &str = "tasks.json";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Which of the two binaries under test produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Base,
    Branch,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Base => "base",
            Side::Branch => "branch",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags shared by every invocation of a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub python: String,
    pub cache_dir: PathBuf,
    pub offline: bool,
    /// Offline, and blind to index/proxy overrides from the environment
    pub isolated: bool,
    /// Let the resolver build source distributions, i.e. run arbitrary code
    pub allow_build: bool,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            python: "3.13".to_string(),
            cache_dir: PathBuf::from("cache"),
            offline: false,
            isolated: false,
            allow_build: false,
            timeout: None,
        }
    }
}

/// Outcome of one binary on one task, persisted as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub task: String,
    pub side: Side,
    /// `None` when the process never started or was killed by a signal
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human-readable account of a failed invocation.
    pub fn failure_description(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let description = if let Some(error) = &self.spawn_error {
            format!("could not start: {}", error)
        } else if self.timed_out {
            format!("timed out after {:.1}s", self.duration_secs)
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            }
        };
        Some(description)
    }

    /// Reads a previously persisted result, including captured output.
    pub fn load(task_dir: &Path) -> Option<Self> {
        let content = fs::read_to_string(task_dir.join(SUMMARY_FILE)).ok()?;
        let mut result: InvocationResult = serde_json::from_str(&content).ok()?;
        result.stdout = fs::read_to_string(task_dir.join(STDOUT_FILE)).unwrap_or_default();
        result.stderr = fs::read_to_string(task_dir.join(STDERR_FILE)).unwrap_or_default();
        Some(result)
    }

    fn persist(&self, task_dir: &Path) -> Result<()> {
        fs::write(task_dir.join(STDOUT_FILE), &self.stdout)?;
        fs::write(task_dir.join(STDERR_FILE), &self.stderr)?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(task_dir.join(SUMMARY_FILE), json)
            .with_context(|| format!("Failed to write summary in {}", task_dir.display()))?;
        Ok(())
    }
}

/// The settings an output directory was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub mode: Mode,
    pub python: String,
    pub latest: bool,
    pub allow_build: bool,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl RunParameters {
    pub fn new(mode: Mode, latest: bool, binary: &Path, options: &RunOptions) -> Self {
        Self {
            mode,
            python: options.python.clone(),
            latest,
            allow_build: options.allow_build,
            offline: options.offline,
            isolated: options.isolated,
            binary: Some(binary.to_path_buf()),
            started_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn read(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(PARAMETERS_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn write(&self, output_dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(output_dir.join(PARAMETERS_FILE), json)?;
        Ok(())
    }

    /// Same resolver inputs, ignoring when and with which binary.
    pub fn same_settings(&self, other: &Self) -> bool {
        self.mode == other.mode
            && self.python == other.python
            && self.latest == other.latest
            && self.allow_build == other.allow_build
            && self.offline == other.offline
            && self.isolated == other.isolated
    }
}

/// Prepares `output_dir` for a run: wiped unless resuming, stamped with the
/// run parameters and the declared task ids.
pub fn prepare_output(
    output_dir: &Path,
    parameters: &RunParameters,
    task_ids: &[String],
    resume: bool,
) -> Result<()> {
    if output_dir.exists() {
        if resume {
            if let Ok(previous) = RunParameters::read(output_dir) {
                if !previous.same_settings(parameters) {
                    return Err(HarnessError::Config(format!(
                        "cannot resume {}: it was produced with different settings",
                        output_dir.display()
                    ))
                    .into());
                }
            }
        } else {
            fs::remove_dir_all(output_dir)
                .with_context(|| format!("Failed to clear {}", output_dir.display()))?;
        }
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    fs::write(output_dir.join(".gitignore"), "*\n")?;
    parameters.write(output_dir)?;
    fs::write(
        output_dir.join(TASKS_FILE),
        serde_json::to_string_pretty(task_ids)?,
    )?;
    Ok(())
}

/// Reads the task ids declared for an output directory, if recorded.
pub fn read_declared_tasks(output_dir: &Path) -> Option<Vec<String>> {
    let content = fs::read_to_string(output_dir.join(TASKS_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

/// Deterministic, file-system safe directory for a task's artifacts.
pub fn task_dir(output_dir: &Path, task_id: &str) -> PathBuf {
    output_dir.join(sanitize_task_id(task_id))
}

pub fn sanitize_task_id(task_id: &str) -> String {
    let mut name: String = task_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if name.starts_with('.') || name.is_empty() {
        name.insert(0, '_');
    }
    name
}

/// Resolver arguments for a mode, excluding the binary itself.
pub fn command_args(mode: Mode, options: &RunOptions) -> Vec<OsString> {
    let mut shared: Vec<OsString> = vec![
        "--cache-dir".into(),
        options.cache_dir.clone().into_os_string(),
        "--color".into(),
        "never".into(),
        "--no-python-downloads".into(),
    ];
    if !options.allow_build {
        shared.push("--no-build".into());
    }
    if options.offline || options.isolated {
        shared.push("--offline".into());
    }

    let mut args: Vec<OsString> = Vec::new();
    match mode {
        Mode::Compile => {
            args.extend(["pip", "compile", "-", "-p"].map(OsString::from));
            args.push(options.python.clone().into());
            // Platform independent output is more reproducible
            args.extend(["--universal", "--no-header", "--no-annotate"].map(OsString::from));
            args.extend(shared);
        }
        Mode::Lock | Mode::PyprojectToml => {
            args.push("lock".into());
            args.extend(shared);
        }
        Mode::Sync => {
            args.push("sync".into());
            args.extend(shared);
            args.push("--preview".into());
            if !options.allow_build {
                args.push("--no-install-project".into());
            }
        }
    }
    args
}

/// The `pyproject.toml` a task's directory needs, if any.
pub fn task_manifest(task: &Task, python: &str) -> Result<Option<String>> {
    match task.mode {
        Mode::Compile => Ok(None),
        Mode::Lock => {
            let mut project = toml::Table::new();
            project.insert("name".to_string(), "testing".into());
            project.insert("version".to_string(), "0.1.0".into());
            project.insert("requires-python".to_string(), format!(">={}", python).into());
            project.insert(
                "dependencies".to_string(),
                toml::Value::Array(vec![task.specification.as_str().into()]),
            );
            let mut document = toml::Table::new();
            document.insert("project".to_string(), project.into());
            let text = toml::to_string(&document).context("Failed to serialize manifest")?;
            Ok(Some(text))
        }
        Mode::PyprojectToml | Mode::Sync => Ok(Some(task.specification.clone())),
    }
}

/// Runs `binary` on `task`, writing artifacts under `output_dir`.
pub fn invoke(
    task: &Task,
    side: Side,
    binary: &Path,
    output_dir: &Path,
    options: &RunOptions,
    cancel: &CancelFlag,
) -> Result<InvocationResult> {
    let dir = task_dir(output_dir, &task.id);
    if dir.exists() {
        fs::remove_dir_all(&dir).with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    if let Some(manifest) = task_manifest(task, &options.python)? {
        fs::write(dir.join("pyproject.toml"), manifest)?;
    }

    let mut command = Command::new(binary);
    command
        .args(command_args(task.mode, options))
        .current_dir(&dir)
        .env_remove("VIRTUAL_ENV")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut command);
    if options.isolated {
        for (key, _) in std::env::vars_os() {
            if is_network_override(&key) {
                command.env_remove(&key);
            }
        }
    }

    tracing::debug!(task = %task.id, %side, ?command, "invoking");

    let start = Instant::now();
    let mut result = InvocationResult {
        task: task.id.clone(),
        side,
        exit_code: None,
        duration_secs: 0.0,
        timed_out: false,
        spawn_error: None,
        stdout: String::new(),
        stderr: String::new(),
    };

    match command.spawn() {
        Ok(child) => {
            let stdin = match task.mode {
                Mode::Compile => Some(format!("{}\n", task.specification)),
                _ => None,
            };
            let captured = wait_with_output(child, stdin.as_deref(), options.timeout, cancel)?;
            result.exit_code = captured.status.and_then(|s| s.code());
            result.timed_out = captured.timed_out;
            result.stdout = String::from_utf8_lossy(&captured.stdout).into_owned();
            result.stderr = String::from_utf8_lossy(&captured.stderr).into_owned();
        }
        Err(e) => {
            result.spawn_error = Some(format!("{}: {}", binary.display(), e));
        }
    }
    result.duration_secs = start.elapsed().as_secs_f64();

    if task.mode == Mode::Sync {
        let venv = dir.join(".venv");
        if venv.exists() {
            fs::remove_dir_all(&venv)
                .with_context(|| format!("Failed to remove {}", venv.display()))?;
        }
    }

    result.persist(&dir)?;
    Ok(result)
}

/// Puts the resolver in a fresh process group so it can be killed together
/// with everything it spawned.
#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kills the child and, on unix, its whole process group. Grandchildren
/// inherit the output pipes, so the drain threads only see EOF once they
/// are gone too.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child is not reaped yet, so its pid still names the group
        let pgid = child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

fn is_network_override(key: &std::ffi::OsStr) -> bool {
    let key = key.to_string_lossy().to_ascii_uppercase();
    key.starts_with("UV_")
        || key.starts_with("PIP_")
        || matches!(key.as_str(), "HTTP_PROXY" | "HTTPS_PROXY" | "ALL_PROXY")
}

struct Captured {
    status: Option<ExitStatus>,
    timed_out: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Feeds stdin, drains both pipes concurrently so a chatty child never blocks
/// on a full pipe, and kills the child on timeout or cancellation.
fn wait_with_output(
    mut child: Child,
    stdin: Option<&str>,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
) -> Result<Captured> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdin_pipe = child.stdin.take();

    std::thread::scope(|scope| {
        let stdout = scope.spawn(move || drain(stdout_pipe));
        let stderr = scope.spawn(move || drain(stderr_pipe));

        if let Some(mut pipe) = stdin_pipe {
            if let Some(input) = stdin {
                match pipe.write_all(input.as_bytes()) {
                    // The child exited without reading its input
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e).context("Failed to write to child stdin"),
                    Ok(()) => {}
                }
            }
        }

        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait().context("Failed to poll child")? {
                break Some(status);
            }
            let expired = timeout.is_some_and(|t| start.elapsed() >= t);
            if expired || cancel.is_cancelled() {
                timed_out = expired;
                kill_process_tree(&mut child);
                child.wait().context("Failed to reap child")?;
                break None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        Ok(Captured {
            status,
            timed_out,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    })
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args_as_strings(mode: Mode, options: &RunOptions) -> Vec<String> {
        command_args(mode, options)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn task(id: &str, mode: Mode) -> Task {
        Task {
            id: id.to_string(),
            mode,
            specification: id.to_string(),
        }
    }

    #[test]
    fn compile_args_are_universal_and_forbid_builds() {
        let args = args_as_strings(Mode::Compile, &RunOptions::default());
        assert_eq!(&args[..5], &["pip", "compile", "-", "-p", "3.13"]);
        assert!(args.contains(&"--universal".to_string()));
        assert!(args.contains(&"--no-build".to_string()));
        assert!(!args.contains(&"--offline".to_string()));
    }

    #[test]
    fn allow_build_drops_no_build() {
        let options = RunOptions {
            allow_build: true,
            ..RunOptions::default()
        };
        let args = args_as_strings(Mode::Sync, &options);
        assert_eq!(args[0], "sync");
        assert!(!args.contains(&"--no-build".to_string()));
        assert!(!args.contains(&"--no-install-project".to_string()));
        assert!(args.contains(&"--preview".to_string()));
    }

    #[test]
    fn sync_without_builds_skips_project_install() {
        let args = args_as_strings(Mode::Sync, &RunOptions::default());
        assert!(args.contains(&"--no-install-project".to_string()));
    }

    #[test]
    fn isolated_implies_offline() {
        let options = RunOptions {
            isolated: true,
            ..RunOptions::default()
        };
        let args = args_as_strings(Mode::Lock, &options);
        assert_eq!(args[0], "lock");
        assert!(args.contains(&"--offline".to_string()));
    }

    #[test]
    fn lock_manifest_depends_on_the_requirement() {
        let manifest = task_manifest(&task("attrs", Mode::Lock), "3.12")
            .unwrap()
            .unwrap();
        let table: toml::Table = manifest.parse().unwrap();
        let project = table["project"].as_table().unwrap();
        assert_eq!(project["requires-python"].as_str(), Some(">=3.12"));
        assert_eq!(project["dependencies"].as_array().unwrap()[0].as_str(), Some("attrs"));
        assert!(task_manifest(&task("attrs", Mode::Compile), "3.12")
            .unwrap()
            .is_none());
    }

    #[test]
    fn lock_manifest_escapes_markers_and_backslashes() {
        let requirement = r#"pywin32 ; sys_platform == "win32" and python_version != "3.\9""#;
        let manifest = task_manifest(&task(requirement, Mode::Lock), "3.12")
            .unwrap()
            .unwrap();
        let table: toml::Table = manifest.parse().unwrap();
        let dependencies = table["project"]["dependencies"].as_array().unwrap();
        assert_eq!(dependencies[0].as_str(), Some(requirement));
    }

    #[test]
    fn network_overrides_are_recognized() {
        use std::ffi::OsStr;
        assert!(is_network_override(OsStr::new("UV_INDEX_URL")));
        assert!(is_network_override(OsStr::new("PIP_EXTRA_INDEX_URL")));
        assert!(is_network_override(OsStr::new("https_proxy")));
        assert!(!is_network_override(OsStr::new("PATH")));
        assert!(!is_network_override(OsStr::new("NO_PROXY_LIST")));
    }

    #[test]
    fn task_ids_map_to_safe_names() {
        assert_eq!(sanitize_task_id("numpy"), "numpy");
        assert_eq!(sanitize_task_id("org/repo"), "org_repo");
        assert_eq!(sanitize_task_id(".hidden"), "_.hidden");
        assert_eq!(sanitize_task_id(""), "_");
        let out = Path::new("/out");
        assert_eq!(task_dir(out, "a/b"), task_dir(out, "a/b"));
    }

    #[test]
    fn missing_binary_is_recorded_not_raised() {
        let tmp = TempDir::new().unwrap();
        let result = invoke(
            &task("attrs", Mode::Compile),
            Side::Base,
            &tmp.path().join("does-not-exist"),
            tmp.path(),
            &RunOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(!result.success());
        assert!(result.spawn_error.is_some());
        assert!(result
            .failure_description()
            .unwrap()
            .starts_with("could not start"));
        let reloaded = InvocationResult::load(&tmp.path().join("attrs")).unwrap();
        assert_eq!(reloaded.exit_code, None);
        assert_eq!(reloaded.side, Side::Base);
    }

    #[test]
    fn prepare_output_records_parameters_and_tasks() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("compile");
        let parameters = RunParameters::new(
            Mode::Compile,
            false,
            Path::new("/bin/uv"),
            &RunOptions::default(),
        );
        fs::create_dir_all(out.join("stale")).unwrap();

        prepare_output(&out, &parameters, &["a".to_string()], false).unwrap();
        assert!(!out.join("stale").exists());
        assert_eq!(read_declared_tasks(&out), Some(vec!["a".to_string()]));
        assert!(RunParameters::read(&out).unwrap().same_settings(&parameters));
    }

    #[test]
    fn resume_keeps_artifacts_but_rejects_changed_settings() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("lock");
        let options = RunOptions::default();
        let parameters = RunParameters::new(Mode::Lock, false, Path::new("uv"), &options);
        prepare_output(&out, &parameters, &[], false).unwrap();
        fs::create_dir_all(out.join("kept")).unwrap();

        prepare_output(&out, &parameters, &[], true).unwrap();
        assert!(out.join("kept").exists());

        let other = RunParameters {
            python: "3.9".to_string(),
            ..parameters
        };
        let err = prepare_output(&out, &other, &[], true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn captures_output_and_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("fake-resolver");
        fs::write(
            &script,
            "#!/bin/sh\nread requirement\necho \"$requirement==1.0\"\necho resolved >&2\nexit 3\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let out = tmp.path().join("out");
        let result = invoke(
            &task("attrs", Mode::Compile),
            Side::Branch,
            &script,
            &out,
            &RunOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, "attrs==1.0\n");
        assert_eq!(result.stderr, "resolved\n");
        assert_eq!(
            result.failure_description().as_deref(),
            Some("exit code 3")
        );
        assert_eq!(
            fs::read_to_string(out.join("attrs").join(STDOUT_FILE)).unwrap(),
            "attrs==1.0\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_child() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("slow-resolver");
        fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let options = RunOptions {
            timeout: Some(Duration::from_millis(200)),
            ..RunOptions::default()
        };
        let result = invoke(
            &task("attrs", Mode::Lock),
            Side::Base,
            &script,
            tmp.path(),
            &options,
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(result.timed_out);
        assert!(!result.success());
        assert!(result.duration_secs < 10.0);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("wrapper-resolver");
        // No exec: the shell forks `sleep`, which inherits stdout and stderr
        fs::write(&script, "#!/bin/sh\necho started\nsleep 30\necho done\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let options = RunOptions {
            timeout: Some(Duration::from_millis(200)),
            ..RunOptions::default()
        };
        let start = Instant::now();
        let result = invoke(
            &task("attrs", Mode::Lock),
            Side::Base,
            &script,
            tmp.path(),
            &options,
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(result.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.stdout, "started\n");
    }

    #[cfg(unix)]
    #[test]
    fn isolated_children_do_not_see_index_overrides() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("env-resolver");
        fs::write(
            &script,
            "#!/bin/sh\necho \"index=$UV_INDEX_URL proxy=$HTTPS_PROXY\"\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        std::env::set_var("UV_INDEX_URL", "https://mirror.invalid/simple");
        std::env::set_var("HTTPS_PROXY", "http://proxy.invalid:3128");

        let run = |isolated: bool, out: &str| {
            let options = RunOptions {
                isolated,
                ..RunOptions::default()
            };
            invoke(
                &task("attrs", Mode::Lock),
                Side::Branch,
                &script,
                &tmp.path().join(out),
                &options,
                &CancelFlag::new(),
            )
            .unwrap()
        };

        let inherited = run(false, "open");
        assert_eq!(
            inherited.stdout,
            "index=https://mirror.invalid/simple proxy=http://proxy.invalid:3128\n"
        );
        let isolated = run(true, "isolated");
        assert_eq!(isolated.stdout, "index= proxy=\n");
    }
}
