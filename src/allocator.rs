use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::utils::{random_suffix, random_token};

const MAX_ATTEMPTS: usize = 1000;
const SUFFIX_LEN: usize = 6;

/// Hands out file names that are unique within the download directory.
///
/// A name is unique if it was never handed out or reserved by this process
/// and no file with that name exists on disk at allocation time.
#[derive(Debug)]
pub struct FileNameAllocator {
    dir: PathBuf,
    reserved: Mutex<HashSet<String>>,
}

impl FileNameAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn reserve(&self, name: &str) {
        if name.is_empty() {
            return;
        }
        self.reserved.lock().insert(name.to_string());
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.lock().contains(name)
    }

    pub fn allocate(&self, requested: &str) -> String {
        let base = normalize(requested);
        let (stem, ext) = split_extension(&base);

        let mut reserved = self.reserved.lock();
        for attempt in 0..MAX_ATTEMPTS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}{}", stem, random_suffix(SUFFIX_LEN), ext)
            };
            if reserved.contains(&name) {
                continue;
            }
            // Names already on disk are reserved too so they are never retried.
            let taken = path_exists(&self.dir.join(&name));
            reserved.insert(name.clone());
            if taken {
                debug!(name = %name, "file name present on disk, retrying");
                continue;
            }
            return name;
        }

        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let name = format!("{}-{}{}", stem, nanos, ext);
        reserved.insert(name.clone());
        name
    }
}

fn normalize(requested: &str) -> String {
    let trimmed = requested.trim();
    match Path::new(trimmed).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
        _ => random_token(),
    }
}

/// Splits `name` at its last dot; the extension keeps the dot.
fn split_extension(name: &str) -> (&str, &str) {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    };
    if stem.is_empty() {
        ("file", ext)
    } else {
        (stem, ext)
    }
}

fn path_exists(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(_) => true,
        Err(err) => err.kind() != std::io::ErrorKind::NotFound,
    }
}
