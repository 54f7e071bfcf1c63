//! Dataset provider: turns bundled tables and fetched manifests into an
//! ordered, deduplicated list of resolution tasks.

pub mod fetch;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DataPaths;
use crate::error::HarnessError;

/// Which resolver sub-command a task exercises.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// `pip compile` with the requirement on stdin
    Compile,
    /// `lock` of a generated project depending on a single requirement
    Lock,
    /// `lock` of a real-world `pyproject.toml`
    PyprojectToml,
    /// `sync` of a real-world `pyproject.toml`
    Sync,
}

impl Mode {
    /// Modes a full run covers when none are selected.
    pub const DEFAULT_RUN: [Mode; 3] = [Mode::Compile, Mode::Lock, Mode::PyprojectToml];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Compile => "compile",
            Mode::Lock => "lock",
            Mode::PyprojectToml => "pyproject-toml",
            Mode::Sync => "sync",
        }
    }

    /// Whether tasks come from a directory of `pyproject.toml` files.
    pub fn uses_manifests(self) -> bool {
        matches!(self, Mode::PyprojectToml | Mode::Sync)
    }

    /// The file holding the resolution the two binaries are compared on.
    pub fn resolution_file(self) -> &'static str {
        match self {
            Mode::Compile => "stdout.txt",
            Mode::Lock | Mode::PyprojectToml | Mode::Sync => "uv.lock",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolution scenario, run once against each binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Package name or manifest file stem
    pub id: String,
    pub mode: Mode,
    /// A requirement (`name` or `name==version`) for the package-list modes,
    /// the preprocessed manifest text for the manifest modes
    pub specification: String,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    pub mode: Option<Mode>,
    /// Overrides the default table or manifest directory for the mode
    pub input: Option<PathBuf>,
    pub limit: Option<usize>,
    /// Pin every package to its latest known version
    pub latest: bool,
    /// Keep manifests with dynamic dependencies (they need a build)
    pub allow_build: bool,
    pub exclude: Vec<String>,
}

/// Why manifests were left out of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub no_project: usize,
    pub dynamic_dependencies: usize,
    pub invalid: usize,
    pub missing_version: usize,
    pub excluded: usize,
}

/// A finite, restartable task sequence.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub mode: Mode,
    pub source: PathBuf,
    tasks: Vec<Task>,
    pub skipped: SkipCounts,
}

impl Dataset {
    pub fn load(paths: &DataPaths, options: &DatasetOptions) -> Result<Self> {
        let mode = options.mode.unwrap_or(Mode::Compile);
        if options.latest && mode.uses_manifests() {
            return Err(HarnessError::Config(format!(
                "latest versions are not supported in {} mode",
                mode
            ))
            .into());
        }

        let source = match &options.input {
            Some(input) => input.clone(),
            None if mode.uses_manifests() => paths.pyproject_tomls(),
            None => paths.top_pypi(),
        };

        let mut skipped = SkipCounts::default();
        let candidates = if mode.uses_manifests() {
            load_manifests(&source, options.allow_build, &mut skipped)?
        } else {
            let latest = if options.latest {
                Some(read_latest_versions(&paths.top_pypi_latest_versions())?)
            } else {
                None
            };
            load_requirements(&source, latest.as_ref(), &mut skipped)?
        };

        let exclude: HashSet<&str> = options.exclude.iter().map(String::as_str).collect();
        let mut tasks = Vec::new();
        for (id, specification) in candidates {
            if exclude.contains(id.as_str()) {
                skipped.excluded += 1;
                continue;
            }
            if options.limit.is_some_and(|limit| tasks.len() >= limit) {
                break;
            }
            tasks.push(Task {
                id,
                mode,
                specification,
            });
        }

        if tasks.is_empty() && options.limit != Some(0) {
            return Err(HarnessError::data_unavailable(&source, "no tasks in dataset").into());
        }

        tracing::debug!(
            mode = %mode,
            source = %source.display(),
            tasks = tasks.len(),
            "loaded dataset"
        );

        Ok(Self {
            mode,
            source,
            tasks,
            skipped,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.iter()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct PackageRow {
    project: String,
}

#[derive(Debug, Deserialize)]
struct LatestVersionRow {
    package_name: String,
    latest_version: String,
}

fn open_table(path: &Path) -> Result<csv::Reader<fs::File>> {
    if !path.is_file() {
        return Err(HarnessError::data_unavailable(path, "file not found").into());
    }
    csv::Reader::from_path(path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Package names keyed and thereby sorted and deduplicated by name.
fn load_requirements(
    path: &Path,
    latest: Option<&HashMap<String, String>>,
    skipped: &mut SkipCounts,
) -> Result<BTreeMap<String, String>> {
    let mut reader = open_table(path)?;
    let mut names = BTreeMap::new();
    for row in reader.deserialize::<PackageRow>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        let name = row.project.trim().to_string();
        if !name.is_empty() {
            names.insert(name, ());
        }
    }

    let mut requirements = BTreeMap::new();
    for name in names.into_keys() {
        let specification = match latest {
            Some(versions) => match versions.get(&name) {
                Some(version) => format!("{}=={}", name, version),
                None => {
                    tracing::warn!(package = %name, "no latest version known, skipping");
                    skipped.missing_version += 1;
                    continue;
                }
            },
            None => name.clone(),
        };
        requirements.insert(name, specification);
    }
    Ok(requirements)
}

fn read_latest_versions(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = open_table(path)?;
    let mut versions = HashMap::new();
    for row in reader.deserialize::<LatestVersionRow>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        versions.insert(row.package_name, row.latest_version);
    }
    Ok(versions)
}

fn load_manifests(
    dir: &Path,
    allow_build: bool,
    skipped: &mut SkipCounts,
) -> Result<BTreeMap<String, String>> {
    if !dir.is_dir() {
        return Err(HarnessError::data_unavailable(dir, "manifest directory not found").into());
    }

    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }
        if let Some(stem) = path.file_stem() {
            files.insert(stem.to_string_lossy().to_string(), path);
        }
    }

    let mut manifests = BTreeMap::new();
    for (id, path) in files {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match prepare_manifest(&content, allow_build) {
            Ok(PreparedManifest::Ready(text)) => {
                manifests.insert(id, text);
            }
            Ok(PreparedManifest::NoProject) => skipped.no_project += 1,
            Ok(PreparedManifest::DynamicDependencies) => skipped.dynamic_dependencies += 1,
            Err(e) => {
                tracing::debug!(manifest = %path.display(), error = %e, "unparseable manifest");
                skipped.invalid += 1;
            }
        }
    }
    Ok(manifests)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedManifest {
    Ready(String),
    NoProject,
    DynamicDependencies,
}

/// Makes a real-world manifest lockable on its own.
///
/// A dynamic version is replaced by a static one; nothing usually depends
/// back on the project itself, so any version works. Dynamic dependencies
/// can only be discovered by building, so those manifests are dropped unless
/// building is allowed.
pub fn prepare_manifest(content: &str, allow_build: bool) -> Result<PreparedManifest> {
    let mut document: toml::Table = content.parse().context("Invalid TOML")?;
    let Some(project) = document.get_mut("project").and_then(|p| p.as_table_mut()) else {
        return Ok(PreparedManifest::NoProject);
    };

    let mut pin_version = false;
    if let Some(dynamic) = project.get_mut("dynamic").and_then(|d| d.as_array_mut()) {
        if !dynamic.is_empty() {
            let has_dynamic_deps = dynamic.iter().any(|v| v.as_str() == Some("dependencies"));
            if has_dynamic_deps && !allow_build {
                return Ok(PreparedManifest::DynamicDependencies);
            }
            dynamic.retain(|v| v.as_str() != Some("version"));
            pin_version = true;
        }
    }
    if pin_version {
        project.insert(
            "version".to_string(),
            toml::Value::String("1.0.0".to_string()),
        );
    }

    let text = toml::to_string(&document).context("Failed to serialize manifest")?;
    Ok(PreparedManifest::Ready(text))
}
