//! Persistence of the framework identity across scheduler restarts.
//!
//! The store is external to the core; the trait keeps the seam narrow and
//! the file-backed implementation covers single-host and shared-volume
//! deployments.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::driver::FrameworkId;

/// Result of persisting the framework id on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Created,
    /// An id was already persisted for this cluster. Benign on register.
    AlreadyPresent,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn persist_framework_id(&self, id: &FrameworkId) -> Result<PersistOutcome>;

    async fn load_framework_id(&self) -> Result<Option<FrameworkId>>;

    async fn clear_framework_id(&self) -> Result<()>;
}

/// Stores the framework id at `<root>/<cluster_name>/framework-id`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, cluster_name: &str) -> Self {
        Self {
            dir: root.into().join(cluster_name),
        }
    }

    fn id_path(&self) -> PathBuf {
        self.dir.join("framework-id")
    }
}

#[async_trait]
impl CoordinationStore for FileStore {
    async fn persist_framework_id(&self, id: &FrameworkId) -> Result<PersistOutcome> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.id_path();
        // create_new makes the write a compare-and-set: whoever persisted
        // first wins, everyone else sees AlreadyPresent.
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(&path).await {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(id.get().as_bytes())
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                file.sync_all().await?;
                info!(framework_id = id.get(), path = %path.display(), "persisted framework id");
                Ok(PersistOutcome::Created)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(PersistOutcome::AlreadyPresent),
            Err(err) => Err(err).with_context(|| format!("creating {}", path.display())),
        }
    }

    async fn load_framework_id(&self) -> Result<Option<FrameworkId>> {
        match tokio::fs::read_to_string(self.id_path()).await {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(FrameworkId::new(trimmed)))
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", self.id_path().display())),
        }
    }

    async fn clear_framework_id(&self) -> Result<()> {
        match tokio::fs::remove_file(self.id_path()).await {
            Ok(()) => {
                info!(path = %self.id_path().display(), "cleared persisted framework id");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", self.id_path().display())),
        }
    }
}
