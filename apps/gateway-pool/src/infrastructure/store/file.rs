//! JSON File Allocation Store
//!
//! The table is written to a sibling temp file, synced, then renamed over
//! the target so a crash mid-write leaves either the old or the new table.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::application::ports::{AllocationStore, AllocationTable, StoreError};

/// Allocation store backed by one JSON file.
#[derive(Debug, Clone)]
pub struct FileAllocationStore {
    path: PathBuf,
}

impl FileAllocationStore {
    /// Use the file at `path`. Parent directories are created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl AllocationStore for FileAllocationStore {
    fn load(&self) -> Result<AllocationTable, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(AllocationTable::default()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(AllocationTable::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, table: &AllocationTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_vec_pretty(table)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
