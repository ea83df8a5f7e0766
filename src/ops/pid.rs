use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Process id file, removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("unable to write pid file {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!("unable to remove pid file {}: {err}", self.path.display());
        }
    }
}
