use crate::codec::{codec_for, TableCodec, TextCodec};
use crate::error::{CacheError, FormatError};
use crate::model::{ContainerEntry, ContainerName, ScanPolicy, StampTable, Table, TableKind};
use crate::options::{CacheOptions, Format};
use crate::path::CacheLayout;
use crate::scheduler::{ShutdownMode, WriteScheduler, WriteStats};
use crate::stamp::{Stamp, StampEngine, StampStrategy};
use crate::util::{atomic_write_with, is_tmp_file_name, read_file_limited, remove_file_best_effort};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Progress of one (container, table) pair within a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryState {
    #[default]
    Unknown,
    /// Read from disk under a valid stamp. Not re-validated for the rest of the run.
    ReadValid,
    ReadMissingOrInvalid,
    Rescanned,
    WritePending,
    /// Written during this run. Not re-validated for the rest of the run.
    Written,
}

impl EntryState {
    fn is_trusted(self) -> bool {
        matches!(self, EntryState::ReadValid | EntryState::Written)
    }
}

type StateMap = Arc<Mutex<HashMap<PathBuf, EntryState>>>;
type DirSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Read-validate-or-rescan-and-write cycle over the on-disk cache tree.
///
/// The store exclusively owns everything under [`CacheOptions::dir`]. Reads run on the
/// caller's thread; writes are handed to a [`WriteScheduler`] keyed by container directory.
pub struct CacheStore {
    options: CacheOptions,
    layout: CacheLayout,
    stamps: StampEngine,
    codec: &'static dyn TableCodec,
    scheduler: WriteScheduler,
    states: StateMap,
    /// Container directories with a failed table write not yet answered by a stamp write.
    unstamped: DirSet,
}

impl CacheStore {
    pub fn new(options: CacheOptions) -> Result<Self, CacheError> {
        options.validate()?;
        let format = options.format();
        let scheduler = if options.disabled || options.read_only {
            WriteScheduler::inline()
        } else {
            WriteScheduler::new(options.write_threads())
        };

        tracing::info!(
            target = "anno.cache",
            dir = %options.dir.display(),
            disabled = options.disabled,
            read_only = options.read_only,
            always_valid = options.always_valid,
            write_threads = options.write_threads,
            write_limit = options.write_limit,
            format = %format,
            log_queries = options.log_queries,
            "annotation cache options"
        );

        Ok(Self {
            layout: CacheLayout::new(options.dir.clone(), format),
            stamps: StampEngine::new(&options),
            codec: codec_for(format),
            scheduler,
            states: Arc::new(Mutex::new(HashMap::new())),
            unstamped: Arc::new(Mutex::new(HashSet::new())),
            options,
        })
    }

    pub fn with_stamp_strategy(mut self, strategy: StampStrategy) -> Self {
        self.stamps = self.stamps.clone().with_strategy(strategy);
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn format(&self) -> Format {
        self.layout.format()
    }

    pub fn stamp_engine(&self) -> &StampEngine {
        &self.stamps
    }

    pub fn write_stats(&self) -> WriteStats {
        self.scheduler.stats()
    }

    pub fn state(&self, entry: &ContainerEntry, kind: TableKind) -> EntryState {
        self.layout
            .entry_path(entry, kind)
            .and_then(|path| self.states.lock().get(&path).copied())
            .unwrap_or_default()
    }

    /// Records that the caller scanned `entry` itself, after a miss.
    pub fn mark_rescanned(&self, entry: &ContainerEntry, kind: TableKind) {
        if let Some(path) = self.layout.entry_path(entry, kind) {
            self.set_state(path, EntryState::Rescanned);
        }
    }

    fn set_state(&self, path: PathBuf, state: EntryState) {
        self.states.lock().insert(path, state);
    }

    /// Returns the cached `kind` table of `entry`, or `None` when the caller must rescan.
    ///
    /// Disabled caches, stale or missing stamps, missing files and undecodable files all
    /// yield `None`; none of them is reported as an error.
    pub fn try_read(&self, entry: &ContainerEntry, kind: TableKind) -> Option<Table> {
        if self.options.disabled {
            return None;
        }
        let path = self.layout.entry_path(entry, kind)?;
        let state = self.states.lock().get(&path).copied().unwrap_or_default();

        if !state.is_trusted() && kind != TableKind::Stamp && !self.has_valid_stamp(entry) {
            self.set_state(path, EntryState::ReadMissingOrInvalid);
            return None;
        }

        match self.read_table(&path, kind) {
            Some(table) => {
                if !state.is_trusted() {
                    self.set_state(path, EntryState::ReadValid);
                }
                Some(table)
            }
            None => {
                self.set_state(path, EntryState::ReadMissingOrInvalid);
                None
            }
        }
    }

    /// The stamp recorded on disk for `entry`, if a well-formed one exists.
    pub fn stored_stamp(&self, entry: &ContainerEntry) -> Option<Stamp> {
        let path = self.layout.entry_path(entry, TableKind::Stamp)?;
        match self.read_table(&path, TableKind::Stamp)? {
            Table::Stamp(StampTable { name, stamp }) if name == entry.display_name() => Some(stamp),
            Table::Stamp(StampTable { name, .. }) => {
                tracing::debug!(
                    target = "anno.cache",
                    path = %path.display(),
                    stored = %name,
                    expected = %entry.display_name(),
                    "stamp table belongs to another container"
                );
                None
            }
            _ => None,
        }
    }

    fn has_valid_stamp(&self, entry: &ContainerEntry) -> bool {
        let stored = self.stored_stamp(entry);
        let current = if self.stamps.always_valid() {
            None
        } else {
            self.stamps.current_stamp(entry)
        };
        let valid = self.stamps.is_valid(stored.as_ref(), current.as_ref());
        if !valid {
            tracing::debug!(
                target = "anno.cache",
                container = %entry.display_name(),
                stored = ?stored.as_ref().map(Stamp::as_str),
                current = ?current.as_ref().map(Stamp::as_str),
                "container stamp is missing or stale"
            );
        }
        valid
    }

    /// Reads and decodes one file without consulting stamps.
    fn read_table(&self, path: &Path, kind: TableKind) -> Option<Table> {
        let bytes = read_file_limited(path)?;
        let result = self.codec.read(&bytes).and_then(|table| {
            if table.kind() == kind {
                Ok(table)
            } else {
                Err(FormatError::WrongTable {
                    expected: kind.table_name(),
                    found: table.kind().table_name().to_string(),
                })
            }
        });
        match result {
            Ok(table) => Some(table),
            Err(err) => {
                tracing::warn!(
                    target = "anno.cache",
                    path = %path.display(),
                    codec = self.codec.name(),
                    error = %err,
                    "ignoring unreadable cache file"
                );
                None
            }
        }
    }

    /// Persists `table` for `entry` in the background.
    ///
    /// Returns whether a write was queued. Nothing is written when the cache is disabled or
    /// read-only, for the external policy, or for details of fewer classes than the write
    /// limit; in the last case any details file left by an earlier scan is removed, so the
    /// next stamp never vouches for it.
    ///
    /// Writes share one queue per container directory. A stamp write queued after a failed
    /// table write of the same directory removes the stored stamp instead of replacing it.
    pub fn schedule_write(&self, entry: &ContainerEntry, table: Table) -> bool {
        let kind = table.kind();
        if self.options.disabled || self.options.read_only {
            tracing::debug!(
                target = "anno.cache",
                container = %entry.display_name(),
                table = kind.table_name(),
                "cache is not writable; dropping write"
            );
            return false;
        }
        if entry.policy == ScanPolicy::External {
            tracing::debug!(
                target = "anno.cache",
                container = %entry.display_name(),
                error = %CacheError::ExternalNotPersisted { table: kind.table_name() },
                "skipping write"
            );
            return false;
        }
        let location = (
            self.layout.entry_dir(entry),
            self.layout.entry_path(entry, kind),
        );
        let (Some(dir), Some(path)) = location else {
            tracing::debug!(
                target = "anno.cache",
                container = %entry.display_name(),
                table = kind.table_name(),
                "container has no cache location; skipping write"
            );
            return false;
        };
        if let Table::Details(details) = &table {
            let limit = self.options.write_limit();
            if details.class_count() < limit {
                tracing::debug!(
                    target = "anno.cache",
                    container = %entry.display_name(),
                    classes = details.class_count(),
                    limit,
                    "too few classes; annotation details not persisted"
                );
                self.schedule_remove(dir, path);
                return false;
            }
        }

        self.set_state(path.clone(), EntryState::WritePending);
        let codec = self.codec;
        let states = Arc::clone(&self.states);
        let unstamped = Arc::clone(&self.unstamped);
        let job_dir = dir.clone();
        let job_path = path.clone();
        let queued = self.scheduler.submit(dir, move || {
            let result = if kind == TableKind::Stamp && unstamped.lock().remove(&job_dir) {
                remove_leaf(&job_path).and_then(|()| {
                    Err(CacheError::StampWithheld {
                        dir: job_dir.display().to_string(),
                    })
                })
            } else {
                atomic_write_with(&job_path, |file| codec.write(&table, file))
            };
            let next = if result.is_ok() {
                EntryState::Written
            } else {
                EntryState::Rescanned
            };
            states.lock().insert(job_path, next);
            if result.is_err() && kind != TableKind::Stamp {
                unstamped.lock().insert(job_dir);
            }
            result
        });
        if !queued {
            self.set_state(path, EntryState::Rescanned);
        }
        queued
    }

    /// Queues removal of a table file that this scan no longer backs.
    fn schedule_remove(&self, dir: PathBuf, path: PathBuf) {
        self.set_state(path.clone(), EntryState::Rescanned);
        let unstamped = Arc::clone(&self.unstamped);
        let job_dir = dir.clone();
        self.scheduler.submit(dir, move || {
            let result = remove_leaf(&path);
            if result.is_err() {
                unstamped.lock().insert(job_dir);
            }
            result
        });
    }

    /// Records the current stamp of `entry`, queued behind its table writes.
    ///
    /// Entries whose stamp cannot be determined are not stamped, so they stay invalid.
    pub fn schedule_write_stamp(&self, entry: &ContainerEntry) -> bool {
        match self.stamps.current_stamp(entry) {
            Some(stamp) if !stamp.is_unavailable() => self.schedule_write(
                entry,
                Table::Stamp(StampTable {
                    name: entry.display_name(),
                    stamp,
                }),
            ),
            _ => {
                tracing::debug!(
                    target = "anno.cache",
                    container = %entry.display_name(),
                    "container stamp unavailable; not recording it"
                );
                false
            }
        }
    }

    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    /// Stops accepting writes. Later `schedule_write` calls are dropped.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.scheduler.shutdown(mode);
    }

    /// Removes temp files left by writes that never completed. Returns how many were removed.
    pub fn sweep_abandoned_writes(&self) -> Result<usize, CacheError> {
        if self.options.read_only {
            return Ok(0);
        }
        let root = self.layout.root();
        if !root.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_tmp = entry.file_name().to_str().is_some_and(is_tmp_file_name);
            if is_tmp && remove_file_best_effort(entry.path(), "sweep_abandoned_writes") {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(
                target = "anno.cache",
                removed,
                "removed abandoned cache writes"
            );
        }
        Ok(removed)
    }

    /// Deletes everything cached for one module, after pending writes have landed.
    pub fn clear_module(&self, app: &str, module: &str) -> Result<(), CacheError> {
        self.clear_dir(self.layout.module_dir(app, module))
    }

    /// Deletes everything cached for one application, after pending writes have landed.
    pub fn clear_app(&self, app: &str) -> Result<(), CacheError> {
        self.clear_dir(self.layout.app_dir(app))
    }

    fn clear_dir(&self, dir: PathBuf) -> Result<(), CacheError> {
        if self.options.read_only || self.options.disabled {
            return Ok(());
        }
        self.scheduler.wait_idle();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.states.lock().retain(|path, _| !path.starts_with(&dir));
        self.unstamped.lock().retain(|path| !path.starts_with(&dir));
        tracing::debug!(target = "anno.cache", dir = %dir.display(), "cleared cache subtree");
        Ok(())
    }

    /// Writes the stamp, classes and targets stored for `entry` as one text bundle.
    ///
    /// Stamps are not checked. Missing or unreadable tables are left out; returns how many
    /// tables were written.
    pub fn dump_container(
        &self,
        entry: &ContainerEntry,
        out: &mut dyn Write,
    ) -> Result<usize, CacheError> {
        let tables: Vec<Table> = [TableKind::Stamp, TableKind::Classes, TableKind::Targets]
            .into_iter()
            .filter_map(|kind| {
                let path = self.layout.entry_path(entry, kind)?;
                self.read_table(&path, kind)
            })
            .collect();
        TextCodec.write_bundle(&tables, out)?;
        Ok(tables.len())
    }

    /// The partition entry holding a module's merged results for `policy`.
    pub fn result_entry(app: &str, module: &str, policy: ScanPolicy) -> ContainerEntry {
        ContainerEntry::new(app, module, ContainerName::Result(policy), policy)
    }
}

fn remove_leaf(path: &Path) -> Result<(), CacheError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        self.scheduler.shutdown(ShutdownMode::Drain);
    }
}
