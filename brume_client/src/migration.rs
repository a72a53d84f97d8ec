//! One-shot migration of legacy client files.
//!
//! Earlier releases kept client state in a different directory. Each known
//! file is moved into the current data directory exactly once, on startup;
//! a file that already exists at the destination is left alone.

use log::{debug, warn};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

pub struct FileMigrator {
    source: PathBuf,
    target: PathBuf,
}

impl FileMigrator {
    pub fn new(source: PathBuf, target: PathBuf) -> Self {
        FileMigrator { source, target }
    }

    /// Move one file from the legacy directory if it exists there and has not
    /// been migrated yet. Failures are logged; startup continues without the
    /// file.
    pub async fn migrate(&self, file_name: &str) {
        let from = self.source.join(file_name);
        let to = self.target.join(file_name);

        match fs::metadata(&from).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!("Failed to inspect legacy file {}: {}", from.display(), err);
                return;
            }
        }

        if fs::metadata(&to).await.is_ok() {
            debug!("{} already migrated", file_name);
            return;
        }

        if let Some(parent) = to.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                warn!("Failed to create {}: {}", parent.display(), err);
                return;
            }
        }

        match fs::rename(&from, &to).await {
            Ok(()) => debug!("Migrated {} to {}", from.display(), to.display()),
            Err(err) => warn!(
                "Failed to migrate {} to {}: {}",
                from.display(),
                to.display(),
                err
            ),
        }
    }
}
