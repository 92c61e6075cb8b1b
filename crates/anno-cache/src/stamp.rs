use crate::model::ContainerEntry;
use crate::options::CacheOptions;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

const UNAVAILABLE: &str = "**UNAVAILABLE**";

/// An opaque fingerprint of a container's state.
///
/// Stamps are compared for exact equality; their textual shape (`meta:`, `dir:`, `sha256:`,
/// `combined:`) only documents how they were produced.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(String);

impl Stamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Marker for a container whose state could not be determined. Never valid.
    pub fn unavailable() -> Self {
        Self(UNAVAILABLE.to_string())
    }

    pub fn is_unavailable(&self) -> bool {
        self.0 == UNAVAILABLE
    }

    /// Stamp of an ordered list of member stamps, used for merged module partitions.
    ///
    /// Any unavailable member makes the combination unavailable.
    pub fn combine<'a>(members: impl IntoIterator<Item = &'a Stamp>) -> Self {
        let mut hasher = Sha256::new();
        for member in members {
            if member.is_unavailable() {
                return Self::unavailable();
            }
            hasher.update((member.0.len() as u64).to_le_bytes());
            hasher.update(member.0.as_bytes());
        }
        Self(format!("combined:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a container's current stamp is derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StampStrategy {
    /// Size and modification time; cheap, no file contents are read.
    #[default]
    Metadata,
    /// SHA-256 over file contents.
    Content,
}

/// Computes current stamps and decides whether a stored stamp is still valid.
#[derive(Clone, Debug)]
pub struct StampEngine {
    strategy: StampStrategy,
    always_valid: bool,
}

impl StampEngine {
    pub fn new(options: &CacheOptions) -> Self {
        Self {
            strategy: StampStrategy::default(),
            always_valid: options.always_valid,
        }
    }

    pub fn with_strategy(mut self, strategy: StampStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> StampStrategy {
        self.strategy
    }

    pub fn always_valid(&self) -> bool {
        self.always_valid
    }

    /// The entry's current stamp: the caller-supplied one, else one computed from its path.
    pub fn current_stamp(&self, entry: &ContainerEntry) -> Option<Stamp> {
        if let Some(stamp) = &entry.stamp {
            return Some(stamp.clone());
        }
        entry.path.as_deref().map(|path| self.compute(path))
    }

    /// Fingerprint `path` without scanning it. Missing or unreadable paths are unavailable.
    pub fn compute(&self, path: &Path) -> Stamp {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(
                    target = "anno.cache",
                    path = %path.display(),
                    error = %err,
                    "container is not readable; stamp unavailable"
                );
                return Stamp::unavailable();
            }
        };

        let result = if meta.is_dir() {
            self.directory_stamp(path)
        } else {
            match self.strategy {
                StampStrategy::Metadata => {
                    Ok(Stamp(format!("meta:{}:{}", meta.len(), modified_nanos(&meta, path))))
                }
                StampStrategy::Content => file_digest(path)
                    .map(|digest| Stamp(format!("sha256:{}", hex::encode(digest)))),
            }
        };

        result.unwrap_or_else(|err| {
            tracing::debug!(
                target = "anno.cache",
                path = %path.display(),
                error = %err,
                "failed to compute container stamp"
            );
            Stamp::unavailable()
        })
    }

    /// Whether a stored stamp may be trusted given the current one.
    ///
    /// A missing or unavailable stored stamp is always invalid. With `alwaysValid` any other
    /// stored stamp is accepted without looking at `current`.
    pub fn is_valid(&self, stored: Option<&Stamp>, current: Option<&Stamp>) -> bool {
        let Some(stored) = stored else {
            return false;
        };
        if stored.is_unavailable() {
            return false;
        }
        if self.always_valid {
            return true;
        }
        match current {
            Some(current) if !current.is_unavailable() => stored == current,
            _ => false,
        }
    }

    fn directory_stamp(&self, root: &Path) -> std::io::Result<Stamp> {
        let mut hasher = Sha256::new();
        let walker = walkdir::WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            hasher.update((relative.len() as u64).to_le_bytes());
            hasher.update(relative.as_bytes());
            match self.strategy {
                StampStrategy::Metadata => {
                    let meta = entry.metadata().map_err(std::io::Error::other)?;
                    hasher.update(meta.len().to_le_bytes());
                    hasher.update(modified_nanos(&meta, entry.path()).to_le_bytes());
                }
                StampStrategy::Content => {
                    hasher.update(file_digest(entry.path())?);
                }
            }
        }
        Ok(Stamp(format!("dir:{}", hex::encode(hasher.finalize()))))
    }
}

fn file_digest(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let mut digest = [0_u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

fn modified_nanos(meta: &std::fs::Metadata, path: &Path) -> u128 {
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    match modified.duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_nanos(),
        Err(err) => {
            static REPORTED_MTIME_BEFORE_EPOCH: OnceLock<()> = OnceLock::new();
            if REPORTED_MTIME_BEFORE_EPOCH.set(()).is_ok() {
                tracing::debug!(
                    target = "anno.cache",
                    path = %path.display(),
                    error = ?err,
                    "file mtime is before UNIX_EPOCH; using 0 for container stamp"
                );
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerName, ScanPolicy};

    fn engine(always_valid: bool) -> StampEngine {
        StampEngine::new(&CacheOptions {
            always_valid,
            ..CacheOptions::default()
        })
    }

    #[test]
    fn missing_stored_stamp_is_invalid() {
        let strict = engine(false);
        let current = Stamp::new("meta:1:2");
        assert!(!strict.is_valid(None, Some(&current)));
        assert!(!engine(true).is_valid(None, Some(&current)));
    }

    #[test]
    fn stamps_compare_exactly() {
        let engine = engine(false);
        let s1 = Stamp::new("meta:10:100");
        let s2 = Stamp::new("meta:10:101");
        assert!(engine.is_valid(Some(&s1), Some(&s1.clone())));
        assert!(!engine.is_valid(Some(&s1), Some(&s2)));
        assert!(!engine.is_valid(Some(&s1), None));
        assert!(!engine.is_valid(Some(&Stamp::unavailable()), Some(&Stamp::unavailable())));
    }

    #[test]
    fn always_valid_ignores_current_stamp() {
        let engine = engine(true);
        let s1 = Stamp::new("meta:10:100");
        let s2 = Stamp::new("meta:99:999");
        assert!(engine.is_valid(Some(&s1), Some(&s2)));
        assert!(engine.is_valid(Some(&s1), None));
        assert!(!engine.is_valid(Some(&Stamp::unavailable()), Some(&s2)));
    }

    #[test]
    fn file_stamp_changes_with_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("lib.jar");
        std::fs::write(&jar, b"one").unwrap();

        let engine = engine(false);
        let before = engine.compute(&jar);
        assert!(before.as_str().starts_with("meta:3:"));
        std::fs::write(&jar, b"three").unwrap();
        let after = engine.compute(&jar);
        assert_ne!(before, after);
    }

    #[test]
    fn content_stamp_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jar");
        let b = dir.path().join("b.jar");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let engine = engine(false).with_strategy(StampStrategy::Content);
        assert_eq!(engine.compute(&a), engine.compute(&b));
    }

    #[test]
    fn directory_stamp_tracks_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("com/acme")).unwrap();
        std::fs::write(dir.path().join("com/acme/A.class"), b"cafebabe").unwrap();

        let engine = engine(false);
        let before = engine.compute(dir.path());
        assert!(before.as_str().starts_with("dir:"));
        assert_eq!(before, engine.compute(dir.path()));

        std::fs::write(dir.path().join("com/acme/B.class"), b"cafebabe").unwrap();
        assert_ne!(before, engine.compute(dir.path()));
    }

    #[test]
    fn missing_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = engine(false).compute(&dir.path().join("gone.jar"));
        assert!(stamp.is_unavailable());
    }

    #[test]
    fn supplied_stamp_wins_over_path() {
        let entry = ContainerEntry::new("app", "mod", ContainerName::Root, ScanPolicy::Seed)
            .with_path("/does/not/exist")
            .with_stamp(Stamp::new("given"));
        assert_eq!(engine(false).current_stamp(&entry), Some(Stamp::new("given")));

        let bare = ContainerEntry::new("app", "mod", ContainerName::Root, ScanPolicy::Seed);
        assert_eq!(engine(false).current_stamp(&bare), None);
    }

    #[test]
    fn combined_stamp_is_order_sensitive() {
        let a = Stamp::new("a");
        let b = Stamp::new("b");
        assert_ne!(Stamp::combine([&a, &b]), Stamp::combine([&b, &a]));
        assert_eq!(Stamp::combine([&a, &b]), Stamp::combine([&a, &b]));
        assert!(Stamp::combine([&a, &Stamp::unavailable()]).is_unavailable());
    }
}
