use anno_cache::codec::binary::MAGIC_END;
use anno_cache::codec::{BinaryCodec, TableCodec};
use anno_cache::{
    CacheOptions, CacheStore, ClassRecord, ClassTable, ContainerEntry, DetailsTable, ScanPolicy,
    Stamp, Table, TableKind, Target, TargetsTable,
};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;
use walkdir::WalkDir;

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn as_string(&self) -> String {
        let bytes = self.0.lock().expect("log buffer mutex poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("log buffer mutex poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.0.clone())
    }
}

fn options(tmp: &TempDir) -> CacheOptions {
    CacheOptions {
        dir: tmp.path().join("anno"),
        ..CacheOptions::default()
    }
}

fn container(tmp: &TempDir, name: &str, contents: &[u8]) -> ContainerEntry {
    let path = tmp.path().join("containers").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    ContainerEntry::for_path("shop", "web", name, path, ScanPolicy::Seed)
}

fn classes(tag: &str) -> ClassTable {
    let mut table = ClassTable::new();
    table.add_package(format!("com.acme.{tag}"));
    table.add_class(
        format!("com.acme.{tag}.Service"),
        ClassRecord::new(format!("{tag}.jar"))
            .with_superclass("java.lang.Object")
            .with_interface("java.io.Serializable")
            .with_modifiers(0x0001),
    );
    table
}

fn targets(tag: &str) -> TargetsTable {
    let mut table = TargetsTable::new();
    table.add("javax.inject.Singleton", Target::class(format!("com.acme.{tag}.Service")));
    table.add(
        "javax.inject.Inject",
        Target::field(format!("com.acme.{tag}.Service"), "repository"),
    );
    table
}

fn persist(store: &CacheStore, entry: &ContainerEntry, tag: &str) {
    assert!(store.schedule_write(entry, Table::Classes(classes(tag))));
    assert!(store.schedule_write(entry, Table::Targets(targets(tag))));
    assert!(store.schedule_write_stamp(entry));
}

fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    if !root.exists() {
        return BTreeMap::new();
    }
    WalkDir::new(root)
        .into_iter()
        .map(|entry| entry.unwrap())
        .map(|entry| {
            let bytes = if entry.file_type().is_file() {
                std::fs::read(entry.path()).unwrap()
            } else {
                Vec::new()
            };
            (entry.path().to_path_buf(), bytes)
        })
        .collect()
}

#[test]
fn changed_container_invalidates_its_entry() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"version one");
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &entry, "api");
    }

    let store = CacheStore::new(options(&tmp)).unwrap();
    assert_eq!(
        store.try_read(&entry, TableKind::Targets),
        Some(Table::Targets(targets("api")))
    );

    // A different length guarantees a different metadata stamp.
    std::fs::write(entry.path.as_ref().unwrap(), b"version two, longer").unwrap();
    let stored = store.stored_stamp(&entry).unwrap();
    let current = store.stamp_engine().current_stamp(&entry).unwrap();
    assert_ne!(stored, current);
    assert!(!store.stamp_engine().is_valid(Some(&stored), Some(&current)));

    let next_run = CacheStore::new(options(&tmp)).unwrap();
    assert!(next_run.try_read(&entry, TableKind::Targets).is_none());
    assert!(next_run.try_read(&entry, TableKind::Classes).is_none());
}

#[test]
fn caller_supplied_stamps_take_precedence() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"bytes").with_stamp(Stamp::new("build-41"));
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &entry, "api");
    }

    let store = CacheStore::new(options(&tmp)).unwrap();
    assert!(store.try_read(&entry, TableKind::Classes).is_some());

    let rebuilt = entry.clone().with_stamp(Stamp::new("build-42"));
    let next_run = CacheStore::new(options(&tmp)).unwrap();
    assert!(next_run.try_read(&rebuilt, TableKind::Classes).is_none());
}

#[test]
fn always_valid_trusts_any_stored_stamp() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"version one");
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &entry, "api");
    }
    std::fs::write(entry.path.as_ref().unwrap(), b"version two, longer").unwrap();

    let trusting = CacheStore::new(CacheOptions {
        always_valid: true,
        ..options(&tmp)
    })
    .unwrap();
    assert_eq!(
        trusting.try_read(&entry, TableKind::Classes),
        Some(Table::Classes(classes("api")))
    );

    // A stamp must still have been recorded.
    let unstamped = container(&tmp, "other.jar", b"other");
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        assert!(store.schedule_write(&unstamped, Table::Classes(classes("other"))));
    }
    assert!(trusting.try_read(&unstamped, TableKind::Classes).is_none());
}

fn details(classes: usize) -> DetailsTable {
    let mut table = DetailsTable::new();
    for idx in 0..classes {
        table.add(
            Target::class(format!("com.acme.C{idx}")),
            "javax.persistence.Entity",
            vec![idx as u8],
        );
    }
    table
}

#[test]
fn skipped_details_do_not_survive_a_new_stamp() {
    let tmp = TempDir::new().unwrap();
    let options = CacheOptions {
        write_limit: 5,
        ..options(&tmp)
    };
    let first = container(&tmp, "api.jar", b"bytes").with_stamp(Stamp::new("S1"));
    {
        let store = CacheStore::new(options.clone()).unwrap();
        assert!(store.schedule_write(&first, Table::Details(details(20))));
        persist(&store, &first, "api");
    }

    let second = first.clone().with_stamp(Stamp::new("S2"));
    {
        let store = CacheStore::new(options.clone()).unwrap();
        assert!(!store.schedule_write(&second, Table::Details(details(3))));
        persist(&store, &second, "api");
    }

    let store = CacheStore::new(options).unwrap();
    assert!(store.try_read(&second, TableKind::Details).is_none());
    assert!(store.try_read(&second, TableKind::Classes).is_some());
    assert!(!store
        .layout()
        .entry_path(&second, TableKind::Details)
        .unwrap()
        .exists());
}

#[test]
fn failed_table_write_leaves_the_container_unstamped() {
    let tmp = TempDir::new().unwrap();
    let first = container(&tmp, "api.jar", b"bytes").with_stamp(Stamp::new("S1"));
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &first, "api");
    }

    let second = first.clone().with_stamp(Stamp::new("S2"));
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        let leaf = store.layout().entry_path(&second, TableKind::Targets).unwrap();
        std::fs::remove_file(&leaf).unwrap();
        // A directory in place of the leaf makes the replacing rename fail.
        std::fs::create_dir(&leaf).unwrap();
        assert!(store.schedule_write(&second, Table::Classes(classes("v2"))));
        assert!(store.schedule_write(&second, Table::Targets(targets("v2"))));
        assert!(store.schedule_write_stamp(&second));
        store.wait_idle();
        let stats = store.write_stats();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.failed, 2);
    }

    let store = CacheStore::new(options(&tmp)).unwrap();
    assert!(store.stored_stamp(&second).is_none());
    assert!(store.try_read(&second, TableKind::Classes).is_none());
    assert!(store.try_read(&first, TableKind::Classes).is_none());
}

#[test]
fn truncated_file_is_a_miss_not_a_failure() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"bytes");
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &entry, "api");
    }

    let store = CacheStore::new(options(&tmp)).unwrap();
    let path = store.layout().entry_path(&entry, TableKind::Targets).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.ends_with(&MAGIC_END));
    let truncated = &bytes[..bytes.len() - MAGIC_END.len()];
    assert!(BinaryCodec.read(truncated).is_err());

    std::fs::write(&path, truncated).unwrap();
    let logs = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .without_time()
        .with_max_level(tracing::Level::WARN)
        .with_writer(logs.clone())
        .finish();
    let read = tracing::subscriber::with_default(subscriber, || {
        store.try_read(&entry, TableKind::Targets)
    });
    assert!(read.is_none());
    let text = logs.as_string();
    assert!(text.contains("ignoring unreadable cache file"), "{text}");
    // The other tables of the container are unaffected.
    assert!(store.try_read(&entry, TableKind::Classes).is_some());
}

#[test]
fn fifty_containers_with_eight_writers_stay_separate() {
    let tmp = TempDir::new().unwrap();
    let options = CacheOptions {
        write_threads: 8,
        ..options(&tmp)
    };
    let entries: Vec<_> = (0..50)
        .map(|i| container(&tmp, &format!("lib/dep-{i}.jar"), format!("jar {i}").as_bytes()))
        .collect();

    {
        let store = CacheStore::new(options.clone()).unwrap();
        for (i, entry) in entries.iter().enumerate() {
            assert!(store.schedule_write(entry, Table::Targets(targets(&format!("m{i}")))));
            assert!(store.schedule_write_stamp(entry));
        }
        store.wait_idle();
        let stats = store.write_stats();
        assert_eq!(stats.written, 100);
        assert_eq!(stats.failed, 0);
    }

    let store = CacheStore::new(options).unwrap();
    let mut files = std::collections::BTreeSet::new();
    for (i, entry) in entries.iter().enumerate() {
        let path = store.layout().entry_path(entry, TableKind::Targets).unwrap();
        let decoded = BinaryCodec.read(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(decoded, Table::Targets(targets(&format!("m{i}"))));
        assert_eq!(
            store.try_read(entry, TableKind::Targets),
            Some(Table::Targets(targets(&format!("m{i}"))))
        );
        files.insert(path);
    }
    assert_eq!(files.len(), 50);
}

#[test]
fn read_only_store_never_touches_the_disk() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"bytes");
    {
        let store = CacheStore::new(options(&tmp)).unwrap();
        persist(&store, &entry, "api");
    }
    let root = tmp.path().join("anno");
    std::fs::write(root.join("stray.tmp.1.1"), b"left behind").unwrap();
    let before = snapshot(&root);

    let store = CacheStore::new(CacheOptions {
        read_only: true,
        ..options(&tmp)
    })
    .unwrap();
    let fresh = container(&tmp, "new.jar", b"new");
    assert!(!store.schedule_write(&entry, Table::Classes(classes("changed"))));
    assert!(!store.schedule_write(&fresh, Table::Targets(targets("new"))));
    assert!(!store.schedule_write_stamp(&fresh));
    assert_eq!(store.sweep_abandoned_writes().unwrap(), 0);
    store.clear_app("shop").unwrap();
    store.wait_idle();

    // Reads still work.
    assert!(store.try_read(&entry, TableKind::Classes).is_some());
    drop(store);
    assert_eq!(snapshot(&root), before);
}

#[test]
fn concurrent_readers_see_complete_files_while_writers_replace_them() {
    let tmp = TempDir::new().unwrap();
    let entry = container(&tmp, "api.jar", b"bytes");
    let store = Arc::new(
        CacheStore::new(CacheOptions {
            write_threads: 4,
            ..options(&tmp)
        })
        .unwrap(),
    );
    persist(&store, &entry, "v0");
    store.wait_idle();
    let path = store.layout().entry_path(&entry, TableKind::Classes).unwrap();

    let writer = {
        let store = store.clone();
        let entry = entry.clone();
        thread::spawn(move || {
            for round in 1..=40 {
                store.schedule_write(&entry, Table::Classes(classes(&format!("v{round}"))));
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let bytes = std::fs::read(&path).unwrap();
                    let table = BinaryCodec.read(&bytes).unwrap();
                    assert_eq!(table.kind(), TableKind::Classes);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    store.wait_idle();
    assert_eq!(
        BinaryCodec.read(&std::fs::read(&path).unwrap()).unwrap(),
        Table::Classes(classes("v40"))
    );
}
