//! Directories under watch, persisted as the monitoring list document (a JSON array of paths in
//! the order they were added).

use crate::backup::atomic_file::write_json_atomic;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WatchSet {
    path: PathBuf,
    directories: Vec<PathBuf>,
}

impl WatchSet {
    /// Reads the monitoring list; a missing document is an empty set.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let directories = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<Vec<PathBuf>>(&bytes).map_err(|e| Error::CorruptState {
                    path: path.clone(),
                    reason: e.to_string(),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::from(e).with_msg(format!("Read monitoring list {:?} failed", path)))
            }
        };
        Ok(Self { path, directories })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn contains<P: AsRef<Path>>(&self, directory: P) -> bool {
        self.directories.iter().any(|d| d == directory.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    /// Appends `directory` and persists. Returns `false` when it was already present.
    pub fn add<P: Into<PathBuf>>(&mut self, directory: P) -> Result<bool> {
        let directory = directory.into();
        if self.contains(&directory) {
            return Ok(false);
        }
        self.directories.push(directory);
        self.save()?;
        Ok(true)
    }

    /// Removes `directory` and persists. Returns `false` when it was not present.
    pub fn remove<P: AsRef<Path>>(&mut self, directory: P) -> Result<bool> {
        let before = self.directories.len();
        self.directories.retain(|d| d != directory.as_ref());
        if self.directories.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.directories)
            .with_msg(format!("Save monitoring list {:?} failed", self.path))
    }
}
