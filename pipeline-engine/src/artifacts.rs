// Artifacts
// Named, path-addressed data handed from publishing stages to dependent stages

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact '{0}' was already published in this run")]
    Duplicate(String),

    #[error("artifact '{name}' has not been published by a dependency of stage '{stage}'")]
    Missing { name: String, stage: String },

    #[error("'{0}' is not a valid artifact name")]
    InvalidName(String),

    #[error("artifact '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    fn io(name: &str, source: std::io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            source,
        }
    }
}

/// An artifact name must stay a single path component under the store root
pub fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || Path::new(name).is_absolute();
    if invalid {
        return Err(ArtifactError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Persistent side channel behind publish and download steps
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn publish(&self, name: &str, source: &Path) -> Result<(), ArtifactError>;
    async fn download(&self, name: &str, target: &Path) -> Result<(), ArtifactError>;
}

/// Stores each artifact as a directory (or file) under `root/<name>`
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn publish(&self, name: &str, source: &Path) -> Result<(), ArtifactError> {
        validate_name(name)?;
        let source = source.to_path_buf();
        let target = self.root.join(name);
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || replace_path(&source, &target))
            .await
            .map_err(|e| ArtifactError::io(&owned, std::io::Error::other(e)))?
            .map_err(|e| ArtifactError::io(&owned, e))?;
        debug!(artifact = name, "artifact stored");
        Ok(())
    }

    async fn download(&self, name: &str, target: &Path) -> Result<(), ArtifactError> {
        validate_name(name)?;
        let source = self.root.join(name);
        let target = target.to_path_buf();
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || copy_path(&source, &target))
            .await
            .map_err(|e| ArtifactError::io(&owned, std::io::Error::other(e)))?
            .map_err(|e| ArtifactError::io(&owned, e))
    }
}

/// Copy `source` over `target`, dropping whatever an earlier run left there
fn replace_path(source: &Path, target: &Path) -> std::io::Result<()> {
    if !source.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", source.display()),
        ));
    }
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target)?,
        Ok(_) => std::fs::remove_file(target)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    copy_path(source, target)
}

fn copy_path(source: &Path, target: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_path(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, target).map(|_| ())
    }
}

/// Records names only. Used for dry runs, where step outputs never exist on disk.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    published: Mutex<HashSet<String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.published
            .lock()
            .map(|names| names.contains(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn publish(&self, name: &str, _source: &Path) -> Result<(), ArtifactError> {
        if let Ok(mut names) = self.published.lock() {
            names.insert(name.to_string());
        }
        Ok(())
    }

    async fn download(&self, name: &str, _target: &Path) -> Result<(), ArtifactError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(ArtifactError::io(
                name,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not in store"),
            ))
        }
    }
}

/// Which stage published each artifact during the current run.
///
/// Names are reserved before the store is touched, so two concurrent
/// publishers of the same name cannot both succeed.
#[derive(Debug, Default)]
pub struct ArtifactLedger {
    published: Mutex<HashMap<String, String>>,
}

impl ArtifactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, name: &str, stage: &str) -> Result<(), ArtifactError> {
        validate_name(name)?;
        let mut published = self
            .published
            .lock()
            .map_err(|_| ArtifactError::Duplicate(name.to_string()))?;
        if published.contains_key(name) {
            return Err(ArtifactError::Duplicate(name.to_string()));
        }
        published.insert(name.to_string(), stage.to_string());
        Ok(())
    }

    /// Undo a reservation whose publish failed
    pub fn release(&self, name: &str) {
        if let Ok(mut published) = self.published.lock() {
            published.remove(name);
        }
    }

    pub fn publisher(&self, name: &str) -> Option<String> {
        self.published.lock().ok()?.get(name).cloned()
    }

    /// A stage may only download what one of its ancestors published
    pub fn check_download(
        &self,
        name: &str,
        stage: &str,
        ancestors: &HashSet<String>,
    ) -> Result<(), ArtifactError> {
        match self.publisher(name) {
            Some(publisher) if ancestors.contains(&publisher) => Ok(()),
            _ => Err(ArtifactError::Missing {
                name: name.to_string(),
                stage: stage.to_string(),
            }),
        }
    }
}
