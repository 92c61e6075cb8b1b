use anno_cache::codec::text::{BUNDLE_SEPARATOR, DELIMITER};
use anno_cache::codec::{detect, BinaryCodec, TableCodec, TextCodec};
use anno_cache::path::encode;
use anno_cache::{
    CacheOptions, CacheStore, ContainerEntry, ContainerName, ContainersTable, DetailsTable,
    Format, ReferencesTable, ScanPolicy, Stamp, Table, TableKind, Target, TargetsTable,
};
use std::collections::BTreeSet;
use tempfile::TempDir;

fn targets() -> TargetsTable {
    let mut table = TargetsTable::new();
    table.add("javax.ws.rs.Path", Target::class("com.acme.rest.Orders"));
    table.add("javax.ws.rs.GET", Target::method("com.acme.rest.Orders", "list()Ljava/util/List;"));
    table
}

fn store(tmp: &TempDir, jandex: bool, binary: bool) -> CacheStore {
    CacheStore::new(CacheOptions {
        dir: tmp.path().join("anno"),
        use_jandex_format: jandex,
        use_binary_format: binary,
        write_limit: 0,
        ..CacheOptions::default()
    })
    .unwrap()
}

fn entry() -> ContainerEntry {
    ContainerEntry::new(
        "shop",
        "rest",
        ContainerName::Named("WEB-INF/lib/rest.jar".to_string()),
        ScanPolicy::Seed,
    )
    .with_stamp(Stamp::new("rest-1"))
}

#[test]
fn text_format_writes_readable_text_files() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, false, false);
    assert_eq!(store.format(), Format::Text);
    let entry = entry();
    assert!(store.schedule_write(&entry, Table::Targets(targets())));
    assert!(store.schedule_write_stamp(&entry));
    store.wait_idle();

    let path = store.layout().entry_path(&entry, TableKind::Targets).unwrap();
    assert_eq!(path.file_name().unwrap(), "data");
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with(DELIMITER));
    assert!(text.contains("Table: Annotation Targets\n"));
    assert_eq!(detect(text.as_bytes()).name(), "text");

    let next_run = store_after(&tmp, false, false, store);
    assert_eq!(
        next_run.try_read(&entry, TableKind::Targets),
        Some(Table::Targets(targets()))
    );
}

fn store_after(tmp: &TempDir, jandex: bool, binary: bool, previous: CacheStore) -> CacheStore {
    drop(previous);
    store(tmp, jandex, binary)
}

#[test]
fn jandex_format_stores_targets_under_its_own_leaf() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, true, true);
    assert_eq!(store.format(), Format::Jandex);
    let entry = entry();
    assert!(store.schedule_write(&entry, Table::Targets(targets())));
    assert!(store.schedule_write_stamp(&entry));
    store.wait_idle();

    let dir = store.layout().entry_dir(&entry).unwrap();
    assert!(dir.ends_with(format!("C_{}", encode("WEB-INF/lib/rest.jar"))));
    assert!(dir.join("jandex.idx").is_file());
    assert!(!dir.join("data").exists());

    let bytes = std::fs::read(dir.join("jandex.idx")).unwrap();
    assert_eq!(detect(&bytes).name(), "binary");
    assert_eq!(BinaryCodec.read(&bytes).unwrap(), Table::Targets(targets()));

    // A binary-format store looks for `data` and misses.
    let binary = store_after(&tmp, false, true, store);
    assert!(binary.try_read(&entry, TableKind::Targets).is_none());
}

#[test]
fn switching_codecs_turns_old_files_into_misses() {
    let tmp = TempDir::new().unwrap();
    let binary = store(&tmp, false, true);
    let entry = entry();
    assert!(binary.schedule_write(&entry, Table::Targets(targets())));
    assert!(binary.schedule_write_stamp(&entry));

    let text = store_after(&tmp, false, false, binary);
    assert!(text.try_read(&entry, TableKind::Targets).is_none());
}

#[test]
fn module_tables_live_in_the_module_directory() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, false, true);
    let module = ContainerEntry::new("shop", "rest", ContainerName::Module, ScanPolicy::Seed)
        .with_stamp(Stamp::combine([&Stamp::new("rest-1"), &Stamp::new("api-7")]));

    let mut containers = ContainersTable::new();
    containers.push("WEB-INF/lib/rest.jar", ScanPolicy::Seed);
    containers.push("WEB-INF/lib/servlet-api.jar", ScanPolicy::External);
    let resolved: ReferencesTable = ["java.lang.Object", "javax.ws.rs.Path"].into_iter().collect();
    let unresolved: ReferencesTable = ["com.acme.Missing"].into_iter().collect();

    assert!(store.schedule_write(&module, Table::Containers(containers.clone())));
    assert!(store.schedule_write(&module, Table::Resolved(resolved.clone())));
    assert!(store.schedule_write(&module, Table::Unresolved(unresolved.clone())));
    assert!(store.schedule_write_stamp(&module));
    store.wait_idle();

    let module_dir = store.layout().module_dir("shop", "rest");
    for leaf in ["containers", "resolved", "unresolved", "stamp"] {
        assert!(module_dir.join(leaf).is_file(), "{leaf}");
    }

    let next_run = store_after(&tmp, false, true, store);
    assert_eq!(
        next_run.try_read(&module, TableKind::Containers),
        Some(Table::Containers(containers))
    );
    assert_eq!(
        next_run.try_read(&module, TableKind::Resolved),
        Some(Table::Resolved(resolved))
    );
    assert_eq!(
        next_run.try_read(&module, TableKind::Unresolved),
        Some(Table::Unresolved(unresolved))
    );
}

#[test]
fn result_partitions_merge_container_targets() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, false, true);

    let mut merged = TargetsTable::new();
    merged.merge_from(&targets());
    let mut other = TargetsTable::new();
    other.add("javax.ws.rs.Path", Target::class("com.acme.rest.Customers"));
    merged.merge_from(&other);

    let seed = CacheStore::result_entry("shop", "rest", ScanPolicy::Seed)
        .with_stamp(Stamp::new("partition-1"));
    assert!(store.schedule_write(&seed, Table::Targets(merged.clone())));
    assert!(store.schedule_write_stamp(&seed));
    store.wait_idle();

    assert!(store
        .layout()
        .module_dir("shop", "rest")
        .join("seed")
        .join("data")
        .is_file());
    let read = store.try_read(&seed, TableKind::Targets).unwrap();
    assert_eq!(
        read.as_targets().unwrap().annotated_classes("javax.ws.rs.Path"),
        ["com.acme.rest.Customers", "com.acme.rest.Orders"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
    );
}

#[test]
fn dump_renders_stored_tables_as_a_text_bundle() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp, false, true);
    let entry = entry();
    let mut details = DetailsTable::new();
    details.add(Target::class("com.acme.rest.Orders"), "javax.ws.rs.Path", b"/orders".to_vec());
    assert!(store.schedule_write(&entry, Table::Targets(targets())));
    assert!(store.schedule_write(&entry, Table::Details(details)));
    assert!(store.schedule_write_stamp(&entry));
    store.wait_idle();

    let mut out = Vec::new();
    assert_eq!(store.dump_container(&entry, &mut out).unwrap(), 2);
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches(BUNDLE_SEPARATOR).count(), 2);
    assert!(text.contains("Stamp: rest-1\n"));
    let tables = TextCodec.read_bundle(text.as_bytes()).unwrap();
    assert_eq!(tables[1], Table::Targets(targets()));
}
