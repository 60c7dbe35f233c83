//! File-backed JSON documents.
//!
//! Each document is loaded once, kept in memory behind an async lock and
//! written through (temp file + rename) whenever a mutation changes it.

pub mod models;
pub mod repository;

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::error::AppResult;

pub use models::*;
pub use repository::*;

pub type TopicConfigStore = JsonDocument<TopicConfig>;
pub type MappingStore = JsonDocument<MappingDocument>;

pub struct JsonDocument<T> {
    /// `None` keeps the document in memory only.
    path: Option<PathBuf>,
    state: RwLock<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + PartialEq,
{
    /// Open the document at `path`. A missing file yields the default value;
    /// an unreadable one is logged and also treated as default, leaving the
    /// file untouched until the next successful write.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let value = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}. Starting from defaults",
                        path.display(),
                        e
                    );
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("{} not found, starting from defaults", path.display());
                T::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            state: RwLock::new(value),
        })
    }

    /// In-memory document that is never written to disk.
    #[cfg(test)]
    pub fn in_memory(value: T) -> Self {
        Self {
            path: None,
            state: RwLock::new(value),
        }
    }

    pub async fn read(&self) -> T {
        self.state.read().await.clone()
    }

    /// Apply `f` to a copy of the document. If it fails nothing changes; if it
    /// succeeds and the document differs, the new value is persisted before
    /// it becomes visible to readers.
    pub async fn update<R, F>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut T) -> AppResult<R>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let result = f(&mut next)?;

        if next != *guard {
            self.persist(&next).await?;
            *guard = next;
        }

        Ok(result)
    }

    async fn persist(&self, value: &T) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(value)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
