//! Per-execution scratch directories.
//!
//! Each execution gets its own randomly named directory; it is bind-mounted
//! as the container's working directory and deleted when the workspace is
//! closed or dropped, whichever comes first.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::EngineError;

const WORKSPACE_PREFIX: &str = "crucible-exec-";

#[derive(Debug)]
pub struct EphemeralWorkspace {
    dir: TempDir,
}

impl EphemeralWorkspace {
    /// Create a uniquely named directory under `root`, or the system temp dir
    pub async fn create(root: Option<&Path>) -> Result<Self, EngineError> {
        let root = root.map(Path::to_path_buf);

        let dir = tokio::task::spawn_blocking(move || -> Result<TempDir, std::io::Error> {
            let mut builder = Builder::new();
            builder.prefix(WORKSPACE_PREFIX);
            match root {
                Some(root) => {
                    std::fs::create_dir_all(&root)?;
                    // Docker bind mounts need an absolute host path
                    let root = std::fs::canonicalize(&root)?;
                    builder.tempdir_in(root)
                }
                None => builder.tempdir(),
            }
        })
        .await
        .map_err(|e| EngineError::Workspace(format!("workspace task failed: {}", e)))??;

        #[cfg(unix)]
        {
            // Images running as a non-root user still need write access
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).await?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `code` into `filename` inside the workspace
    pub async fn write_source(&self, filename: &str, code: &str) -> Result<PathBuf, EngineError> {
        if filename.contains('/') || filename.contains('\\') || filename.starts_with('.') {
            return Err(EngineError::Workspace(format!(
                "invalid source file name '{}'",
                filename
            )));
        }

        let host_path = self.dir.path().join(filename);
        let mut file = fs::File::create(&host_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?; // Ensure data is written

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(host_path)
    }

    /// Delete the directory now, reporting failures instead of ignoring them
    pub fn close(self) -> Result<(), EngineError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            EngineError::Workspace(format!("failed to remove {}: {}", path.display(), e))
        })
    }
}
