//! Extraction of bundled static resources into the data directory.
//!
//! The client ships read-only resources (currently the relay list) alongside
//! its binary. On startup each one is copied into the data directory, but an
//! installed copy is only overwritten when the bundled one is newer: a
//! daemon-updated relay list must not be rolled back by every client start.

use log::debug;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::fs;

pub struct ResourceExtractor {
    source_dir: PathBuf,
    target_dir: PathBuf,
}

impl ResourceExtractor {
    pub fn new(source_dir: PathBuf, target_dir: PathBuf) -> Self {
        ResourceExtractor {
            source_dir,
            target_dir,
        }
    }

    /// Install one bundled resource, overwriting only an older installed
    /// copy.
    pub async fn extract(&self, name: &str) -> io::Result<()> {
        let source = self.source_dir.join(name);
        let target = self.target_dir.join(name);

        let bundled_modified = modified_time(&fs::metadata(&source).await?);

        let should_overwrite = match fs::metadata(&target).await {
            Ok(metadata) => bundled_modified > modified_time(&metadata),
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(err),
        };

        if !should_overwrite {
            debug!("Installed {} is current, keeping it", name);
            return Ok(());
        }

        fs::create_dir_all(&self.target_dir).await?;
        fs::copy(&source, &target).await?;
        debug!("Extracted {} to {}", name, target.display());

        Ok(())
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> SystemTime {
    metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}
