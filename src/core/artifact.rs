//! Run-scoped artifact store
//!
//! Uploaded files are copied into a staging folder owned by the run, so a
//! bundle cannot change after upload. A bundle only becomes downloadable
//! once its producing job instance has succeeded; bundles of a failed
//! producer are discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("No files were found at '{path}' for artifact '{name}'")]
    NoFiles { name: String, path: PathBuf },

    #[error("An artifact named '{0}' was already uploaded in this run")]
    Duplicate(String),

    #[error("Artifact '{0}' not found in this run")]
    NotFound(String),

    #[error("Artifact '{name}' is not available: producing job '{producer}' has not succeeded")]
    NotSealed { name: String, producer: String },

    #[error("Invalid artifact name '{0}': names may not be empty, contain path separators or '..'")]
    InvalidName(String),

    #[error("I/O error on artifact '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Artifact names become folder names under the staging root
pub fn check_artifact_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = name.trim().is_empty()
        || name.contains(['/', '\\'])
        || name.contains("..");
    if invalid {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An immutable named bundle of files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub name: String,

    /// Job instance that uploaded the bundle
    pub producer: String,

    /// Staging folder holding the files
    pub root: PathBuf,

    /// File paths relative to `root`, sorted
    pub files: Vec<PathBuf>,

    pub size_bytes: u64,

    pub uploaded_at: DateTime<Utc>,

    /// Set once the producer succeeded
    pub sealed: bool,
}

impl ArtifactBundle {
    /// Absolute paths of the staged files
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| self.root.join(f)).collect()
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    bundles: RwLock<HashMap<String, ArtifactBundle>>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bundles: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage the file or directory at `source` under `name`
    pub async fn upload(
        &self,
        name: &str,
        producer: &str,
        source: &Path,
    ) -> Result<ArtifactBundle, ArtifactError> {
        check_artifact_name(name)?;
        let mut bundles = self.bundles.write().await;
        if bundles.contains_key(name) {
            return Err(ArtifactError::Duplicate(name.to_string()));
        }

        let staging = self.root.join(name);
        let source_owned = source.to_path_buf();
        let staging_owned = staging.clone();
        let name_owned = name.to_string();
        let (files, size_bytes) = tokio::task::spawn_blocking(move || {
            stage_files(&source_owned, &staging_owned)
        })
        .await
        .map_err(|e| ArtifactError::Io {
            name: name_owned.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| ArtifactError::Io {
            name: name_owned,
            source,
        })?;

        if files.is_empty() {
            return Err(ArtifactError::NoFiles {
                name: name.to_string(),
                path: source.to_path_buf(),
            });
        }

        let bundle = ArtifactBundle {
            name: name.to_string(),
            producer: producer.to_string(),
            root: staging,
            files,
            size_bytes,
            uploaded_at: Utc::now(),
            sealed: false,
        };
        info!(
            "Uploaded artifact '{}' from {} ({} files, {} bytes)",
            name,
            producer,
            bundle.files.len(),
            bundle.size_bytes
        );
        bundles.insert(name.to_string(), bundle.clone());
        Ok(bundle)
    }

    /// A downloadable (sealed) bundle
    pub async fn get(&self, name: &str) -> Result<ArtifactBundle, ArtifactError> {
        let bundles = self.bundles.read().await;
        let bundle = bundles
            .get(name)
            .ok_or_else(|| ArtifactError::NotFound(name.to_string()))?;
        if !bundle.sealed {
            return Err(ArtifactError::NotSealed {
                name: name.to_string(),
                producer: bundle.producer.clone(),
            });
        }
        Ok(bundle.clone())
    }

    /// Copy a sealed bundle's files into `dest`
    pub async fn download(&self, name: &str, dest: &Path) -> Result<ArtifactBundle, ArtifactError> {
        let bundle = self.get(name).await?;
        let files = bundle.files.clone();
        let root = bundle.root.clone();
        let dest = dest.to_path_buf();
        let name_owned = name.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for file in &files {
                let target = dest.join(file);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(root.join(file), target)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ArtifactError::Io {
            name: name_owned.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| ArtifactError::Io {
            name: name_owned,
            source,
        })?;
        debug!("Downloaded artifact '{}' ({} files)", name, bundle.files.len());
        Ok(bundle)
    }

    /// Make every bundle uploaded by `producer` downloadable
    pub async fn seal(&self, producer: &str) {
        let mut bundles = self.bundles.write().await;
        for bundle in bundles.values_mut().filter(|b| b.producer == producer) {
            bundle.sealed = true;
        }
    }

    /// Drop every bundle uploaded by `producer`
    pub async fn discard(&self, producer: &str) -> Vec<String> {
        let mut bundles = self.bundles.write().await;
        let names: Vec<String> = bundles
            .values()
            .filter(|b| b.producer == producer)
            .map(|b| b.name.clone())
            .collect();
        for name in &names {
            if let Some(bundle) = bundles.remove(name) {
                if let Err(e) = std::fs::remove_dir_all(&bundle.root) {
                    warn!(
                        "Failed to remove staged artifact '{}' at {}: {}",
                        name,
                        bundle.root.display(),
                        e
                    );
                }
            }
        }
        names
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bundles.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Copy `source` (file or directory) into `staging`; returns relative file paths and total size
fn stage_files(source: &Path, staging: &Path) -> std::io::Result<(Vec<PathBuf>, u64)> {
    let mut files = Vec::new();
    if source.is_file() {
        let Some(file_name) = source.file_name() else {
            return Ok((files, 0));
        };
        let relative = PathBuf::from(file_name);
        std::fs::create_dir_all(staging)?;
        let size = std::fs::copy(source, staging.join(&relative))?;
        files.push(relative);
        return Ok((files, size));
    }
    if !source.is_dir() {
        return Ok((files, 0));
    }

    collect_files(source, Path::new(""), &mut files)?;
    files.sort();

    let mut size = 0;
    for file in &files {
        let target = staging.join(file);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        size += std::fs::copy(source.join(file), target)?;
    }
    Ok((files, size))
}

fn collect_files(base: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(base.join(relative))? {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}
