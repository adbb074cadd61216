use crate::keyfile::KeyFile;
use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Persistent storage of the global settings key file.
#[async_trait]
pub trait SettingsStore: 'static + Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load_global(&self) -> Result<Option<KeyFile>>;

    async fn save_global(&self, keyfile: &KeyFile) -> Result<()>;
}

/// Settings kept in a single file on disk.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SettingsStore for FileSettings {
    async fn load_global(&self) -> Result<Option<KeyFile>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to read {}", self.path.display()));
            }
        };

        let keyfile = KeyFile::parse(&contents)
            .wrap_err_with(|| format!("failed to parse {}", self.path.display()))?;

        Ok(Some(keyfile))
    }

    async fn save_global(&self, keyfile: &KeyFile) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, keyfile.to_string()).await?;
        fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("failed to write {}", self.path.display()))?;

        Ok(())
    }
}
