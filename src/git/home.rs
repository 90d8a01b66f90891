use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;

const HOME_PREFIX: &str = "repo-";

/// A process-private directory holding one clone and its git/ssh
/// configuration.
///
/// It is not removed on drop.  Repository handles remove it explicitly when
/// they are closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeDir {
    path: PathBuf,
}

impl HomeDir {
    /// Create a fresh, empty home directory under the system temp dir.
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(HOME_PREFIX)
            .tempdir()
            .context("Failed to create home directory")?;
        let path = dir.keep();
        // Canonical so that paths git reports back compare equal.
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        debug!(home = %path.display(), "created home directory");
        Ok(Self { path })
    }

    /// Adopt an existing directory.
    pub fn adopt(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything in it.  Missing is not an error.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(home = %self.path.display(), "removed home directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove home directory {}", self.path.display())),
        }
    }
}
