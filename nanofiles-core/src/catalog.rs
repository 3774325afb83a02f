//! File catalog boundary: what a peer shares and how a hash resolves to a local path.

use std::path::{Path, PathBuf};

use crate::integrity;

/// Metadata of a published file, as carried on both wires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            size,
        }
    }
}

/// A file shared by the local peer: published metadata plus where the bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub info: FileInfo,
    pub path: PathBuf,
}

/// Local collaborator consumed by transfer sessions and by SERVE_FILES construction.
pub trait FileCatalog {
    fn list_local_files(&self) -> Vec<FileInfo>;

    /// Resolve a hash (or unique hash prefix) to a local path.
    fn resolve_path(&self, hash: &str) -> Option<&Path>;
}

/// In-memory catalog, built once by the host from whatever it scanned.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    files: Vec<SharedFile>,
}

impl Catalog {
    pub fn new(files: Vec<SharedFile>) -> Self {
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[SharedFile] {
        &self.files
    }
}

impl FileCatalog for Catalog {
    fn list_local_files(&self) -> Vec<FileInfo> {
        self.files.iter().map(|f| f.info.clone()).collect()
    }

    /// A prefix that matches more than one file is treated as not found.
    fn resolve_path(&self, hash: &str) -> Option<&Path> {
        let mut matches = self
            .files
            .iter()
            .filter(|f| integrity::matches_target(&f.info.hash, hash));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.path.as_path())
    }
}
