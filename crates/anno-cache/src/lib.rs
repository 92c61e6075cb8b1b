//! On-disk cache of annotation scan results.
//!
//! A scanner asks [`CacheStore::try_read`] for a container's tables before scanning it. A hit
//! means the stored stamp still matches the container and the file decoded cleanly; anything
//! else is a miss, the scanner rescans, and [`CacheStore::schedule_write`] persists the new
//! result on a background [`WriteScheduler`].
//!
//! ## On-disk layout (inventory)
//!
//! Everything lives under [`CacheOptions::dir`] (default `./anno`), named by
//! [`path::encode`]:
//! - `A_<app>/M_<module>/C_<container>/`:
//!   - `stamp`: the container's stamp when its tables were written
//!   - `classes`, `data` (`jandex.idx` in the jandex format), `details`
//! - `A_<app>/M_<module>/{root,classes}/`: the module's root and suggested classes containers
//! - `A_<app>/M_<module>/{seed,partial,excluded}/`: merged result partitions; the external
//!   partition is never persisted
//! - `A_<app>/M_<module>/{containers,resolved,unresolved}`: module-level tables
//!
//! Each file is one table in the [`codec::binary`] or [`codec::text`] format, written to a
//! `*.tmp.<pid>.<n>` sibling and renamed into place.

pub mod codec;
mod error;
mod lock;
mod model;
mod options;
pub mod path;
mod scheduler;
mod stamp;
mod store;
mod util;

pub use codec::{TableCodec, TableHeader};
pub use error::{CacheError, ConfigError, FormatError, Result};
pub use lock::CacheFileLock;
pub use model::{
    AnnotationDetail, ClassRecord, ClassTable, ContainerEntry, ContainerName, ContainersTable,
    DetailsTable, ReferencesTable, ScanPolicy, StampTable, Table, TableKind, Target,
    TargetsTable, ACC_ABSTRACT, ACC_INTERFACE,
};
pub use options::{
    env_var_name, CacheOptions, Format, WriteThreads, ALWAYS_VALID_KEY, BINARY_FORMAT_KEY,
    DEFAULT_DIR, DEFAULT_WRITE_LIMIT, DEFAULT_WRITE_THREADS, DIR_KEY, DISABLED_KEY,
    JANDEX_FORMAT_KEY, LOG_QUERIES_KEY, MAX_WRITE_THREADS, PROPERTY_PREFIX, READ_ONLY_KEY,
    UNBOUNDED_WRITE_THREADS, WRITE_LIMIT_KEY, WRITE_THREADS_KEY,
};
pub use path::CacheLayout;
pub use scheduler::{ShutdownMode, WriteJob, WriteScheduler, WriteStats};
pub use stamp::{Stamp, StampEngine, StampStrategy};
pub use store::{CacheStore, EntryState};
pub use util::{now_millis, CACHE_FILE_LIMIT_BYTES};
