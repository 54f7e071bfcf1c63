use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".ecotestrc.json";
pub const ROOT_ENV: &str = "ECOTEST_ROOT";

/// Packages that are slow or never resolve. Running them only burns time.
const DEFAULT_EXCLUDES: &[&str] = &[
    // 5000 releases, no solution
    "nucliadb",
    // Many non-small versions
    "tf-models-nightly",
    "mtmtrain",
    "llm-dialog-manager",
    "python-must",
    // Slow and no solution
    "edx-enterprise",
    "kcli",
    "emmet-api",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Python version passed to the resolver
    #[serde(default = "default_python")]
    pub python: String,

    /// Concurrent subprocesses (0 = twice the available CPUs)
    #[serde(default)]
    pub jobs: usize,

    /// Per-invocation timeout in seconds (none = wait forever)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Task ids that are never run
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    /// Longest diff excerpt inlined into a report
    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: usize,

    /// Base URL for raw GitHub file downloads
    #[serde(default = "default_raw_base_url")]
    pub raw_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python: default_python(),
            jobs: 0,
            timeout_secs: None,
            exclude: default_excludes(),
            max_diff_lines: default_max_diff_lines(),
            raw_base_url: default_raw_base_url(),
        }
    }
}

impl Config {
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Worker count, resolving `0` to twice the available parallelism.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            return self.jobs;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }
}

/// Where the bundled tables, fetched manifests and the resolver cache live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--root`, then `$ECOTEST_ROOT`, then the current directory.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(root) = explicit {
            return Ok(Self::new(root));
        }
        if let Some(root) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(root));
        }
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Self::new(cwd))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn top_pypi(&self) -> PathBuf {
        self.data_dir().join("top-15k-pypi.csv")
    }

    pub fn top_pypi_latest_versions(&self) -> PathBuf {
        self.data_dir().join("top-15k-pypi-latest-version.csv")
    }

    pub fn pyproject_repositories(&self) -> PathBuf {
        self.data_dir().join("top5k-pyproject-toml-2025-gh-stars.csv")
    }

    pub fn pyproject_tomls(&self) -> PathBuf {
        self.root.join("pyproject_tomls")
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn base_output(&self) -> PathBuf {
        self.root.join("base")
    }

    pub fn branch_output(&self) -> PathBuf {
        self.root.join("branch")
    }
}

fn default_python() -> String {
    "3.13".to_string()
}

fn default_excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

fn default_max_diff_lines() -> usize {
    500
}

fn default_raw_base_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}
