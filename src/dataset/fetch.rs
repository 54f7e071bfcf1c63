//! Downloads the `pyproject.toml` of popular GitHub repositories into the
//! manifest directory. Runs once; later runs reuse what is on disk.

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessError;

const MAX_CONCURRENT_REQUESTS: usize = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub org: String,
    pub repo: String,
    pub git_ref: String,
}

impl Repository {
    /// File name the manifest is cached under, unique per `org/repo`.
    pub fn file_name(&self) -> String {
        format!("{}__{}.toml", self.org, self.repo)
    }

    pub fn manifest_url(&self, raw_base: &str) -> String {
        format!(
            "{}/{}/{}/{}/pyproject.toml",
            raw_base.trim_end_matches('/'),
            self.org,
            self.repo,
            self.git_ref
        )
    }

    /// The popularity data predates many `master` → `main` renames.
    pub fn main_branch_url(&self, raw_base: &str) -> String {
        format!(
            "{}/{}/{}/refs/heads/main/pyproject.toml",
            raw_base.trim_end_matches('/'),
            self.org,
            self.repo
        )
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryRow {
    repo_name: String,
    #[serde(rename = "ref")]
    git_ref: String,
}

/// Reads `repo_name,ref` rows, keeping the first row per repository.
pub fn read_repositories(path: &Path) -> Result<Vec<Repository>> {
    if !path.is_file() {
        return Err(HarnessError::data_unavailable(path, "file not found").into());
    }
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut repositories = Vec::new();
    for row in reader.deserialize::<RepositoryRow>() {
        let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
        let Some((org, repo)) = row.repo_name.split_once('/') else {
            tracing::warn!(repo_name = %row.repo_name, "not an org/repo pair, skipping");
            continue;
        };
        if !seen.insert(row.repo_name.clone()) {
            continue;
        }
        repositories.push(Repository {
            org: org.to_string(),
            repo: repo.to_string(),
            git_ref: row.git_ref,
        });
    }
    Ok(repositories)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
}

enum FetchOutcome {
    Fetched,
    NotFound,
    Failed(String),
}

/// Fetches the manifests unless `output` already exists.
///
/// Downloads land in a sibling staging directory that is renamed into place
/// once complete, so an interrupted fetch is never mistaken for a cache.
pub fn ensure_manifests(
    repositories_csv: &Path,
    output: &Path,
    raw_base: &str,
    offline: bool,
) -> Result<Option<FetchSummary>> {
    if output.is_dir() {
        tracing::debug!(dir = %output.display(), "reusing cached manifests");
        return Ok(None);
    }
    if offline {
        return Err(HarnessError::data_unavailable(
            output,
            "manifests are not cached and fetching is disabled offline",
        )
        .into());
    }

    let repositories = read_repositories(repositories_csv)?;
    let summary = fetch_all(&repositories, output, raw_base)?;
    Ok(Some(summary))
}

pub fn fetch_all(
    repositories: &[Repository],
    output: &Path,
    raw_base: &str,
) -> Result<FetchSummary> {
    let staging = staging_dir(output);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("Failed to clear {}", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;
    fs::write(staging.join(".gitignore"), "*\n")?;

    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;

    let progress = ProgressBar::new(repositories.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("Invalid progress template")?,
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(MAX_CONCURRENT_REQUESTS)
        .build()
        .context("Failed to build fetch thread pool")?;

    let outcomes: Vec<Result<FetchOutcome>> = pool.install(|| {
        repositories
            .par_iter()
            .map(|repository| {
                let outcome = fetch_one(&client, repository, raw_base, &staging);
                progress.inc(1);
                outcome
            })
            .collect()
    });
    progress.finish_and_clear();

    let mut summary = FetchSummary::default();
    for (repository, outcome) in repositories.iter().zip(outcomes) {
        match outcome? {
            FetchOutcome::Fetched => summary.fetched += 1,
            FetchOutcome::NotFound => {
                println!(
                    "  {} Not found: https://github.com/{}/{}",
                    "!".yellow(),
                    repository.org,
                    repository.repo
                );
                summary.not_found += 1;
            }
            FetchOutcome::Failed(error) => {
                println!(
                    "  {} Error for https://github.com/{}/{}: {}",
                    "✗".red(),
                    repository.org,
                    repository.repo,
                    error
                );
                summary.failed += 1;
            }
        }
    }

    fs::rename(&staging, output).with_context(|| {
        format!(
            "Failed to move {} to {}",
            staging.display(),
            output.display()
        )
    })?;

    println!(
        "{} Fetched {}/{} manifests",
        "✓".green(),
        summary.fetched,
        repositories.len()
    );
    Ok(summary)
}

fn fetch_one(
    client: &Client,
    repository: &Repository,
    raw_base: &str,
    output: &Path,
) -> Result<FetchOutcome> {
    let body = match get_text(client, &repository.manifest_url(raw_base)) {
        Ok(body) => body,
        Err(first) => match get_text(client, &repository.main_branch_url(raw_base)) {
            Ok(body) => body,
            // Report the error of the recorded ref, not of the fallback
            Err(_) if first.status() == Some(StatusCode::NOT_FOUND) => {
                return Ok(FetchOutcome::NotFound)
            }
            Err(_) => return Ok(FetchOutcome::Failed(first.to_string())),
        },
    };

    let path = output.join(repository.file_name());
    fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(FetchOutcome::Fetched)
}

fn get_text(client: &Client, url: &str) -> reqwest::Result<String> {
    tracing::debug!(%url, "GET");
    client.get(url).send()?.error_for_status()?.text()
}

fn staging_dir(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifests".to_string());
    output.with_file_name(format!(".{}.partial", name))
}
