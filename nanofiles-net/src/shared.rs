//! Shared folder: scan regular files into a catalog, hashing each one.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use log::{debug, info, warn};
use nanofiles_core::integrity::DigestWriter;
use nanofiles_core::{Catalog, FileInfo, SharedFile};

const HASH_BLOCK: usize = 64 * 1024;

/// Scan `dir` (not recursively). A missing folder is created and yields an empty catalog.
/// Files that cannot be read, or whose names the peer protocol cannot carry intact,
/// are skipped with a warning.
pub fn scan_folder(dir: &Path) -> io::Result<Catalog> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        info!("created shared folder {}", dir.display());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_publishable_name(&name) {
            warn!("skipping {:?}: name has surrounding whitespace or control characters", name);
            continue;
        }
        let hash = match hash_file(&path) {
            Ok(h) => h,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        debug!("sharing {} {}", hash, name);
        files.push(SharedFile {
            info: FileInfo::new(name, hash, meta.len()),
            path,
        });
    }
    files.sort_by(|a, b| a.info.name.cmp(&b.info.name));
    info!("{} files in {}", files.len(), dir.display());
    Ok(Catalog::new(files))
}

/// Peer text values are trimmed and split on line ends, so a name must survive both.
fn is_publishable_name(name: &str) -> bool {
    !name.is_empty() && name.trim() == name && !name.chars().any(char::is_control)
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut f = fs::File::open(path)?;
    let mut digest = DigestWriter::new();
    let mut buf = vec![0u8; HASH_BLOCK];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish_hex())
}
