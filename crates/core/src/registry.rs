// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Repository allowlist: a persistent alias → path registry.
//!
//! Only registered repositories can be targeted by `run_task`. The registry
//! is a single JSON file keyed by alias, loaded lazily on first access and
//! held in memory; writes are serialized by the internal mutex and persisted
//! atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::fsio;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Repo '{0}' not registered")]
    UnknownRepo(String),

    #[error("Not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("Failed to canonicalize {path}: {source}")]
    BadPath { path: PathBuf, source: std::io::Error },

    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One registered repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    pub path: PathBuf,
    pub added: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile(HashMap<String, RepoEntry>);

/// Persistent allowlist of repositories, keyed by alias.
pub struct RepoRegistry {
    file_path: PathBuf,
    inner: Mutex<Option<HashMap<String, RepoEntry>>>,
}

impl RepoRegistry {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path, inner: Mutex::new(None) }
    }

    /// Register a repository. Returns the alias chosen for it.
    ///
    /// The path is canonicalized and must contain a `.git` entry. When no
    /// alias is given the directory basename is used; a collision with a
    /// different path appends `-2`, `-3`, … until unique. Re-registering the
    /// same path under the same alias just refreshes its timestamp.
    pub fn allow(&self, path: &Path, alias: Option<&str>) -> Result<String, RegistryError> {
        let path = path
            .canonicalize()
            .map_err(|source| RegistryError::BadPath { path: path.to_path_buf(), source })?;
        if !path.join(".git").exists() {
            return Err(RegistryError::NotAGitRepo(path));
        }

        let mut guard = self.inner.lock();
        let repos = load(&mut guard, &self.file_path)?;

        let base = match alias {
            Some(a) => a.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "repo".to_string()),
        };

        let mut chosen = base.clone();
        let mut counter = 2;
        loop {
            let same_path = match repos.get(&chosen) {
                None => break,
                Some(entry) => entry.path == path,
            };
            if same_path {
                // Already registered under this alias; refresh the timestamp.
                if let Some(entry) = repos.get_mut(&chosen) {
                    entry.added = Utc::now();
                }
                persist(repos, &self.file_path)?;
                return Ok(chosen);
            }
            chosen = format!("{base}-{counter}");
            counter += 1;
        }

        repos.insert(chosen.clone(), RepoEntry { path: path.clone(), added: Utc::now() });
        persist(repos, &self.file_path)?;
        info!(alias = %chosen, path = %path.display(), "registered repo");
        Ok(chosen)
    }

    /// Resolve an alias to its canonical path.
    pub fn resolve(&self, alias: &str) -> Result<PathBuf, RegistryError> {
        let mut guard = self.inner.lock();
        let repos = load(&mut guard, &self.file_path)?;
        repos
            .get(alias)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| RegistryError::UnknownRepo(alias.to_string()))
    }

    /// All registered repos in insertion order (oldest first).
    pub fn list(&self) -> Result<Vec<(String, RepoEntry)>, RegistryError> {
        let mut guard = self.inner.lock();
        let repos = load(&mut guard, &self.file_path)?;
        let mut entries: Vec<_> = repos.iter().map(|(a, e)| (a.clone(), e.clone())).collect();
        entries.sort_by(|a, b| a.1.added.cmp(&b.1.added).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    /// Remove an alias. Removing an absent alias is a no-op success.
    pub fn remove(&self, alias: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.lock();
        let repos = load(&mut guard, &self.file_path)?;
        if repos.remove(alias).is_some() {
            persist(repos, &self.file_path)?;
            info!(alias, "removed repo from registry");
        }
        Ok(())
    }
}

fn load<'a>(
    guard: &'a mut Option<HashMap<String, RepoEntry>>,
    file_path: &Path,
) -> Result<&'a mut HashMap<String, RepoEntry>, RegistryError> {
    if guard.is_none() {
        let loaded: RegistryFile = fsio::read_json_opt(file_path)?.unwrap_or_default();
        *guard = Some(loaded.0);
    }
    Ok(guard.as_mut().expect("just populated"))
}

fn persist(repos: &HashMap<String, RepoEntry>, file_path: &Path) -> Result<(), RegistryError> {
    fsio::write_json_atomic(file_path, repos)?;
    Ok(())
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
