use crate::error::CacheError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard upper bound for any cache file we will read into memory.
///
/// Corruption must degrade to a cache miss, not an out-of-memory crash.
pub const CACHE_FILE_LIMIT_BYTES: u64 = 256 * 1024 * 1024;

/// Marker embedded in temporary file names by [`atomic_write_with`].
pub(crate) const TMP_MARKER: &str = ".tmp.";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "anno.cache",
                    error = %err,
                    "system time is before unix epoch; using 0 for now_millis"
                );
            }
            0
        }
    }
}

/// Reads a cache file, returning `None` for anything that cannot be a valid entry.
pub(crate) fn read_file_limited(path: &Path) -> Option<Vec<u8>> {
    // Avoid following symlinks out of the cache directory.
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "anno.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache file"
                );
            }
            return None;
        }
    };
    if meta.file_type().is_symlink() || !meta.is_file() {
        tracing::debug!(
            target = "anno.cache",
            path = %path.display(),
            "cache path is not a regular file"
        );
        return None;
    }
    if meta.len() > CACHE_FILE_LIMIT_BYTES {
        remove_file_best_effort(path, "read_file_limited.oversize");
        return None;
    }

    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "anno.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache file"
                );
            }
            None
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "anno.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Writes `path` through a unique temporary sibling and renames it into place.
///
/// Readers observe either the previous complete file or the new complete file.
pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<(), CacheError> {
        write(&mut file)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = write_result {
        drop(file);
        remove_file_best_effort(&tmp_path, "atomic_write_with.write_failed");
        return Err(err);
    }
    drop(file);

    match rename_overwrite(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent);
            Ok(())
        }
        Err(err) => {
            remove_file_best_effort(&tmp_path, "atomic_write_with.rename_failed");
            Err(CacheError::from(err))
        }
    }
}

fn rename_overwrite(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;

    loop {
        match fs::rename(tmp_path, dest) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows)
                    && (err.kind() == io::ErrorKind::AlreadyExists || dest.exists()) =>
            {
                // On Windows, `rename` doesn't overwrite. Under concurrent writers,
                // multiple `remove + rename` sequences can race; retry until we win.
                match fs::remove_file(dest) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }

                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "anno.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!("{TMP_MARKER}{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Whether a file name was produced by [`atomic_write_with`] and never renamed into place.
pub(crate) fn is_tmp_file_name(name: &str) -> bool {
    name.contains(TMP_MARKER)
}
