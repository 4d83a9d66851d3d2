//! Pid file management: a line-terminated decimal pid
//! written at startup and removed on clean shutdown.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn write(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        fs::write(path, format!("{pid}\n"))
            .map_err(|e| Error::fatal_config(format!("writing pid file {}: {e}", path.display())))?;
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pid file");
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove();
    }
}
