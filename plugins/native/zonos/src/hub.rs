// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Remote model retrieval.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// The hub client could not be created.
    #[error("Hub client error: {0}")]
    Client(String),

    #[error("Failed to fetch '{filename}' from '{repo_id}': {reason}")]
    Fetch { repo_id: String, filename: String, reason: String },
}

/// Resolves a file of a named model repository to a local path.
pub trait ModelSource: Send + Sync {
    /// # Errors
    ///
    /// Returns [`HubError::Fetch`] if the file cannot be retrieved.
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, HubError>;
}

/// Hugging Face Hub, with the `hf-hub` crate's own cache.
pub struct HfHubSource {
    api: Api,
}

impl HfHubSource {
    /// Uses `cache_dir` when given, otherwise the `hf-hub` default (`HF_HOME`).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Client`] if the client cannot be built.
    pub fn new(cache_dir: Option<&Path>) -> Result<Self, HubError> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder.build().map_err(|e| HubError::Client(e.to_string()))?;
        Ok(Self { api })
    }
}

impl ModelSource for HfHubSource {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, HubError> {
        tracing::info!(repo_id, filename, "Fetching from Hugging Face Hub");
        self.api.model(repo_id.to_string()).get(filename).map_err(|e| HubError::Fetch {
            repo_id: repo_id.to_string(),
            filename: filename.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Mirror directory laid out as `<root>/<repo_id>/<filename>`.
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelSource for LocalDirSource {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf, HubError> {
        let path = self.root.join(repo_id).join(filename);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "Resolved from local mirror");
            Ok(path)
        } else {
            Err(HubError::Fetch {
                repo_id: repo_id.to_string(),
                filename: filename.to_string(),
                reason: format!("{} does not exist", path.display()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_dir_source() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("org").join("model");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("config.json"), "{}").unwrap();

        let source = LocalDirSource::new(dir.path());
        assert_eq!(source.fetch("org/model", "config.json").unwrap(), repo.join("config.json"));

        let err = source.fetch("org/model", "model.safetensors").unwrap_err();
        assert!(matches!(err, HubError::Fetch { ref filename, .. } if filename == "model.safetensors"));
        assert!(err.to_string().contains("org/model"));
    }
}
