//! Per-directory write exclusion shared by every store in the process.
//!
//! One [`crate::WriteScheduler`] never runs two jobs for the same key at once. Two stores
//! open on the same cache root at the same time have separate schedulers, so their writes to
//! one container directory meet here.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Default)]
struct Registry {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

/// Exclusive, in-process claim on one cache key. Released on drop.
///
/// Only keys currently held are tracked, so the registry stays as small as the number of
/// concurrent writers.
#[derive(Debug)]
pub struct CacheFileLock {
    key: PathBuf,
}

impl CacheFileLock {
    /// Blocks until no other holder exists for `key`.
    pub fn lock_exclusive(key: &Path) -> Self {
        let registry = registry();
        let mut held = registry.held.lock();
        while held.contains(key) {
            registry.released.wait(&mut held);
        }
        held.insert(key.to_path_buf());
        Self {
            key: key.to_path_buf(),
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }
}

impl Drop for CacheFileLock {
    fn drop(&mut self) {
        let registry = registry();
        registry.held.lock().remove(&self.key);
        registry.released.notify_all();
    }
}
