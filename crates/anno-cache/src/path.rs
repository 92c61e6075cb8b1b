//! Filesystem-safe names and the four-tier cache directory layout.
//!
//! ```text
//! <dir>/A_<app>/M_<module>/C_<container>/{stamp,classes,data|jandex.idx,details}
//! <dir>/A_<app>/M_<module>/{root,classes,seed,partial,excluded}/...
//! <dir>/A_<app>/M_<module>/{containers,resolved,unresolved}
//! ```

use crate::model::{ContainerEntry, ContainerName, TableKind};
use crate::options::Format;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const APP_PREFIX: &str = "A_";
pub const MOD_PREFIX: &str = "M_";
pub const CON_PREFIX: &str = "C_";

/// Directory name of a module's root container.
pub const ROOT_CONTAINER_NAME: &str = "root";
/// Directory name of a module's suggested classes container.
pub const CLASSES_CONTAINER_NAME: &str = "classes";
/// Reserved leaf for the query history file. Nothing in this crate writes it.
pub const QUERIES_LEAF: &str = "queries";

/// Substituted for names that would otherwise encode to nothing.
///
/// `~` never appears in a regular encoding, so the placeholder cannot collide.
pub const EMPTY_NAME_PLACEHOLDER: &str = "~empty";

/// Encoded names longer than this are shortened to a prefix plus a digest of the full name.
pub const MAX_ENCODED_LEN: usize = 120;
const HASHED_PREFIX_LEN: usize = 48;

/// Maps arbitrary names to collision-free, filesystem-legal path segments.
///
/// ASCII letters, digits, `-` and `.` pass through (a leading `.` is escaped so that `.` and
/// `..` never appear). Every other byte of the UTF-8 encoding, `_` included, becomes `_xx`
/// with two lowercase hex digits, which keeps the mapping injective.
pub fn encode(name: &str) -> String {
    if name.is_empty() {
        static REPORTED_EMPTY_NAME: OnceLock<()> = OnceLock::new();
        if REPORTED_EMPTY_NAME.set(()).is_ok() {
            tracing::debug!(
                target = "anno.cache",
                placeholder = EMPTY_NAME_PLACEHOLDER,
                "empty cache name replaced by placeholder"
            );
        }
        return EMPTY_NAME_PLACEHOLDER.to_string();
    }

    let mut out = String::with_capacity(name.len());
    for (idx, byte) in name.bytes().enumerate() {
        let passes = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && idx > 0);
        if passes {
            out.push(byte as char);
        } else {
            out.push('_');
            out.push_str(&format!("{byte:02x}"));
        }
    }

    if out.len() <= MAX_ENCODED_LEN {
        return out;
    }

    // Output is ASCII, so any byte offset is a char boundary. The digest disambiguates an
    // escape split by the cut.
    let digest = Sha256::digest(name.as_bytes());
    format!(
        "{}~{}",
        &out[..HASHED_PREFIX_LEN],
        &hex::encode(digest)[..40]
    )
}

/// Resolves cache entries to paths under the cache root.
#[derive(Clone, Debug)]
pub struct CacheLayout {
    root: PathBuf,
    format: Format,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>, format: Format) -> Self {
        Self {
            root: root.into(),
            format,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(format!("{APP_PREFIX}{}", encode(app)))
    }

    pub fn module_dir(&self, app: &str, module: &str) -> PathBuf {
        self.app_dir(app)
            .join(format!("{MOD_PREFIX}{}", encode(module)))
    }

    /// Directory for one container, or `None` for the never-persisted external partition.
    pub fn container_dir(&self, app: &str, module: &str, name: &ContainerName) -> Option<PathBuf> {
        let module_dir = self.module_dir(app, module);
        let dir = match name {
            ContainerName::Named(name) => module_dir.join(format!("{CON_PREFIX}{}", encode(name))),
            ContainerName::Root => module_dir.join(ROOT_CONTAINER_NAME),
            ContainerName::Classes => module_dir.join(CLASSES_CONTAINER_NAME),
            ContainerName::Result(policy) if policy.is_persisted() => {
                module_dir.join(policy.dir_name())
            }
            ContainerName::Result(_) => return None,
            ContainerName::Module => module_dir,
        };
        Some(dir)
    }

    /// Composes the full path of one table file.
    pub fn container_path(
        &self,
        app: &str,
        module: &str,
        name: &ContainerName,
        kind: TableKind,
    ) -> Option<PathBuf> {
        self.container_dir(app, module, name)
            .map(|dir| dir.join(kind.leaf_name(self.format)))
    }

    pub fn entry_dir(&self, entry: &ContainerEntry) -> Option<PathBuf> {
        self.container_dir(&entry.app, &entry.module, &entry.name)
    }

    pub fn entry_path(&self, entry: &ContainerEntry, kind: TableKind) -> Option<PathBuf> {
        self.container_path(&entry.app, &entry.module, &entry.name, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanPolicy;
    use std::collections::BTreeSet;

    fn is_filesystem_legal(segment: &str) -> bool {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    }

    #[test]
    fn encodes_awkward_names_distinctly() {
        let long = "x".repeat(300);
        let names = ["a/b", "a\\b", "", "日本語", long.as_str()];
        let encoded: Vec<String> = names.iter().map(|name| encode(name)).collect();

        let distinct: BTreeSet<&String> = encoded.iter().collect();
        assert_eq!(distinct.len(), names.len(), "{encoded:?}");
        for segment in &encoded {
            assert!(is_filesystem_legal(segment), "illegal segment {segment:?}");
            assert!(segment.len() <= MAX_ENCODED_LEN);
        }
        for name in names {
            assert_eq!(encode(name), encode(name));
        }
    }

    #[test]
    fn escapes_are_unambiguous() {
        assert_ne!(encode("a_2fb"), encode("a/b"));
        assert_ne!(encode("a_b"), encode("a b"));
        assert_eq!(encode("lib-1.0.jar"), "lib-1.0.jar");
        assert_eq!(encode("."), "_2e");
        assert_eq!(encode(".."), "_2e.");
    }

    #[test]
    fn long_names_with_shared_prefix_differ() {
        let a = format!("{}a", "p".repeat(200));
        let b = format!("{}b", "p".repeat(200));
        assert_ne!(encode(&a), encode(&b));
    }

    #[test]
    fn layout_uses_tiered_prefixes() {
        let layout = CacheLayout::new("/cache", Format::Binary);
        let path = layout
            .container_path(
                "shop",
                "web.war",
                &ContainerName::Named("WEB-INF/lib/a.jar".to_string()),
                TableKind::Targets,
            )
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/cache/A_shop/M_web.war/C_WEB-INF_2flib_2fa.jar/data")
        );

        let root = layout
            .container_path("shop", "web.war", &ContainerName::Root, TableKind::Stamp)
            .unwrap();
        assert_eq!(root, PathBuf::from("/cache/A_shop/M_web.war/root/stamp"));

        let seed = layout
            .container_dir("shop", "web.war", &ContainerName::Result(ScanPolicy::Seed))
            .unwrap();
        assert_eq!(seed, PathBuf::from("/cache/A_shop/M_web.war/seed"));

        let module = layout
            .container_path("shop", "web.war", &ContainerName::Module, TableKind::Containers)
            .unwrap();
        assert_eq!(module, PathBuf::from("/cache/A_shop/M_web.war/containers"));
    }

    #[test]
    fn external_partition_has_no_path() {
        let layout = CacheLayout::new("/cache", Format::Binary);
        assert!(layout
            .container_dir("a", "m", &ContainerName::Result(ScanPolicy::External))
            .is_none());
    }

    #[test]
    fn jandex_layout_renames_targets_leaf() {
        let layout = CacheLayout::new("/cache", Format::Jandex);
        let path = layout
            .container_path("a", "m", &ContainerName::Classes, TableKind::Targets)
            .unwrap();
        assert_eq!(path, PathBuf::from("/cache/A_a/M_m/classes/jandex.idx"));
    }
}
