//! On-disk model artifact.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use super::ModelStorage;
use crate::error::{Error, Result};

/// Stores the serialized model at a fixed path.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash or failed write never leaves a truncated artifact behind.
#[derive(Debug, Clone)]
pub struct FileModelStorage {
    path: PathBuf,
}

impl FileModelStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "model".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ModelStorage for FileModelStorage {
    #[instrument(skip(self, bytes), fields(path = %self.path.display(), size = bytes.len()))]
    async fn save_artifact(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::model_storage("Failed to create model directory", e))?;
        }

        let tmp = self.temp_path();
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::model_storage("Failed to write model artifact", e));
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::model_storage("Failed to replace model artifact", e))?;

        debug!("Model artifact written");
        Ok(())
    }

    async fn load_artifact(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::model_storage("Failed to read model artifact", e)),
        }
    }
}
