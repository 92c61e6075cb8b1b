//! In-memory scan results as they are persisted and restored by the cache.
//!
//! The scanner that produces these tables lives outside this crate; the cache only needs to
//! carry them through a codec without loss.

use crate::options::Format;
use crate::stamp::Stamp;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

/// Java `ACC_INTERFACE` class modifier bit.
pub const ACC_INTERFACE: u32 = 0x0200;
/// Java `ACC_ABSTRACT` class modifier bit.
pub const ACC_ABSTRACT: u32 = 0x0400;

/// How results from a container participate in merged module results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScanPolicy {
    Seed,
    Partial,
    Excluded,
    /// Results from outside the module (e.g. the server classpath); never persisted.
    External,
}

impl ScanPolicy {
    pub const ALL: [ScanPolicy; 4] = [
        ScanPolicy::Seed,
        ScanPolicy::Partial,
        ScanPolicy::Excluded,
        ScanPolicy::External,
    ];

    /// Fixed directory name used for the module-level partition of this policy.
    pub fn dir_name(self) -> &'static str {
        match self {
            ScanPolicy::Seed => "seed",
            ScanPolicy::Partial => "partial",
            ScanPolicy::Excluded => "excluded",
            ScanPolicy::External => "external",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanPolicy::Seed => "SEED",
            ScanPolicy::Partial => "PARTIAL",
            ScanPolicy::Excluded => "EXCLUDED",
            ScanPolicy::External => "EXTERNAL",
        }
    }

    pub fn is_persisted(self) -> bool {
        self != ScanPolicy::External
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            ScanPolicy::Seed => 1,
            ScanPolicy::Partial => 2,
            ScanPolicy::Excluded => 3,
            ScanPolicy::External => 4,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ScanPolicy::Seed),
            2 => Some(ScanPolicy::Partial),
            3 => Some(ScanPolicy::Excluded),
            4 => Some(ScanPolicy::External),
            _ => None,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.as_str().eq_ignore_ascii_case(text.trim()))
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which directory of the cache layout an entry addresses.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContainerName {
    /// An ordinary container, stored under `C_<encoded name>`.
    Named(String),
    /// The module's root container.
    Root,
    /// The suggested `classes` container.
    Classes,
    /// A merged module-level result partition.
    Result(ScanPolicy),
    /// The module directory itself (container list and reference tables).
    Module,
}

/// One unit of scanning: a jar, directory or module entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerEntry {
    pub app: String,
    pub module: String,
    pub name: ContainerName,
    /// Location of the container on disk, used to compute its current stamp.
    pub path: Option<PathBuf>,
    pub policy: ScanPolicy,
    /// A caller-supplied current stamp. Takes precedence over computing one from `path`.
    pub stamp: Option<Stamp>,
}

impl ContainerEntry {
    pub fn new(
        app: impl Into<String>,
        module: impl Into<String>,
        name: ContainerName,
        policy: ScanPolicy,
    ) -> Self {
        Self {
            app: app.into(),
            module: module.into(),
            name,
            path: None,
            policy,
            stamp: None,
        }
    }

    /// A named container backed by a file or directory.
    pub fn for_path(
        app: impl Into<String>,
        module: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        policy: ScanPolicy,
    ) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(app, module, ContainerName::Named(name.into()), policy)
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    /// Name recorded in the stamp table for this entry.
    pub fn display_name(&self) -> String {
        match &self.name {
            ContainerName::Named(name) => name.clone(),
            ContainerName::Root => "root".to_string(),
            ContainerName::Classes => "classes".to_string(),
            ContainerName::Result(policy) => policy.dir_name().to_string(),
            ContainerName::Module => self.module.clone(),
        }
    }
}

/// The persisted tables, one file each per container directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Stamp,
    Classes,
    Targets,
    Details,
    Containers,
    Resolved,
    Unresolved,
}

impl TableKind {
    pub const ALL: [TableKind; 7] = [
        TableKind::Stamp,
        TableKind::Classes,
        TableKind::Targets,
        TableKind::Details,
        TableKind::Containers,
        TableKind::Resolved,
        TableKind::Unresolved,
    ];

    /// Name written to the `Table` header field.
    pub fn table_name(self) -> &'static str {
        match self {
            TableKind::Stamp => "Stamp",
            TableKind::Classes => "Classes",
            TableKind::Targets => "Annotation Targets",
            TableKind::Details => "Annotation Details",
            TableKind::Containers => "Container",
            TableKind::Resolved => "Resolved References",
            TableKind::Unresolved => "Unresolved References",
        }
    }

    /// Version written to, and required in, the `Version` header field.
    pub fn version(self) -> &'static str {
        "1.0"
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table_name() == name)
    }

    /// Leaf file name inside a container directory.
    pub fn leaf_name(self, format: Format) -> &'static str {
        match self {
            TableKind::Stamp => "stamp",
            TableKind::Classes => "classes",
            TableKind::Targets if format == Format::Jandex => "jandex.idx",
            TableKind::Targets => "data",
            TableKind::Details => "details",
            TableKind::Containers => "containers",
            TableKind::Resolved => "resolved",
            TableKind::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A class as recorded by the scanner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassRecord {
    pub class_source: String,
    pub superclass: Option<String>,
    /// Declared interfaces, in declaration order, without duplicates.
    pub interfaces: Vec<String>,
    pub modifiers: u32,
}

impl ClassRecord {
    pub fn new(class_source: impl Into<String>) -> Self {
        Self {
            class_source: class_source.into(),
            ..Self::default()
        }
    }

    pub fn with_superclass(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.add_interface(interface);
        self
    }

    pub fn with_modifiers(mut self, modifiers: u32) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn add_interface(&mut self, interface: impl Into<String>) {
        let interface = interface.into();
        if !self.interfaces.contains(&interface) {
            self.interfaces.push(interface);
        }
    }

    pub fn is_interface(&self) -> bool {
        self.modifiers & ACC_INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.modifiers & ACC_ABSTRACT != 0
    }
}

/// Packages and classes of one container.
///
/// Superclass and interface names may refer to classes that are not keys of this table;
/// such forward or external references are expected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassTable {
    packages: BTreeSet<String>,
    classes: BTreeMap<String, ClassRecord>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, name: impl Into<String>) -> bool {
        self.packages.insert(name.into())
    }

    /// Records a class; a later record for the same name replaces the earlier one.
    pub fn add_class(&mut self, name: impl Into<String>, record: ClassRecord) {
        self.classes.insert(name.into(), record);
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = (&str, &ClassRecord)> {
        self.classes.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn class(&self, name: &str) -> Option<&ClassRecord> {
        self.classes.get(name)
    }

    pub fn contains_package(&self, name: &str) -> bool {
        self.packages.contains(name)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.classes.is_empty()
    }

    pub fn superclass_of(&self, class: &str) -> Option<&str> {
        self.classes.get(class)?.superclass.as_deref()
    }

    pub fn interfaces_of(&self, class: &str) -> &[String] {
        self.classes
            .get(class)
            .map(|record| record.interfaces.as_slice())
            .unwrap_or(&[])
    }

    pub fn modifiers_of(&self, class: &str) -> Option<u32> {
        self.classes.get(class).map(|record| record.modifiers)
    }

    pub fn is_interface(&self, class: &str) -> bool {
        self.classes.get(class).is_some_and(ClassRecord::is_interface)
    }

    pub fn is_abstract(&self, class: &str) -> bool {
        self.classes.get(class).is_some_and(ClassRecord::is_abstract)
    }

    /// Direct subclasses of `superclass`.
    pub fn subclasses_of(&self, superclass: &str) -> BTreeSet<String> {
        self.classes
            .iter()
            .filter(|(_, record)| record.superclass.as_deref() == Some(superclass))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every recorded class that implements `interface`, directly, through a subinterface, or
    /// by inheriting from an implementing class.
    pub fn all_implementors_of(&self, interface: &str) -> BTreeSet<String> {
        let mut wanted: BTreeSet<&str> = BTreeSet::from([interface]);
        let mut implementors = BTreeSet::new();

        // Subinterfaces first; they extend the set of names that count as "implements".
        loop {
            let mut grew = false;
            for (name, record) in &self.classes {
                if record.is_interface()
                    && !wanted.contains(name.as_str())
                    && record.interfaces.iter().any(|i| wanted.contains(i.as_str()))
                {
                    wanted.insert(name.as_str());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let mut queue: VecDeque<&str> = VecDeque::new();
        for (name, record) in &self.classes {
            if !record.is_interface()
                && record.interfaces.iter().any(|i| wanted.contains(i.as_str()))
                && implementors.insert(name.clone())
            {
                queue.push_back(name.as_str());
            }
        }

        while let Some(next) = queue.pop_front() {
            for (name, record) in &self.classes {
                if record.superclass.as_deref() == Some(next) && implementors.insert(name.clone())
                {
                    queue.push_back(name.as_str());
                }
            }
        }

        implementors
    }

    /// Whether `candidate` is `criterion` or inherits from it through recorded classes.
    pub fn is_instance_of(&self, candidate: &str, criterion: &str, is_interface: bool) -> bool {
        let mut seen = BTreeSet::new();
        let mut current = Some(candidate);
        while let Some(class) = current {
            if class == criterion {
                return true;
            }
            if !seen.insert(class) {
                // Cyclic superclass chain in corrupt input.
                return false;
            }
            if is_interface && self.extends_interface(class, criterion, &mut BTreeSet::new()) {
                return true;
            }
            current = self.superclass_of(class);
        }
        false
    }

    fn extends_interface<'a>(
        &'a self,
        class: &'a str,
        criterion: &str,
        seen: &mut BTreeSet<&'a str>,
    ) -> bool {
        for interface in self.interfaces_of(class) {
            if interface == criterion {
                return true;
            }
            if seen.insert(interface.as_str())
                && self.extends_interface(interface, criterion, seen)
            {
                return true;
            }
        }
        false
    }
}

/// A program element that may carry annotations.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    Package(String),
    Class(String),
    Field { class: String, name: String },
    Method { class: String, signature: String },
}

impl Target {
    pub fn package(name: impl Into<String>) -> Self {
        Target::Package(name.into())
    }

    pub fn class(name: impl Into<String>) -> Self {
        Target::Class(name.into())
    }

    pub fn field(class: impl Into<String>, name: impl Into<String>) -> Self {
        Target::Field {
            class: class.into(),
            name: name.into(),
        }
    }

    pub fn method(class: impl Into<String>, signature: impl Into<String>) -> Self {
        Target::Method {
            class: class.into(),
            signature: signature.into(),
        }
    }

    /// The class (or package, for package targets) that declares this element.
    pub fn owner(&self) -> &str {
        match self {
            Target::Package(name) | Target::Class(name) => name,
            Target::Field { class, .. } | Target::Method { class, .. } => class,
        }
    }
}

/// Annotation name → annotated targets, for one container or one merged partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetsTable {
    targets: BTreeMap<String, BTreeSet<Target>>,
}

impl TargetsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, annotation: impl Into<String>, target: Target) -> bool {
        self.targets.entry(annotation.into()).or_default().insert(target)
    }

    pub fn annotations(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Target)> {
        self.targets
            .iter()
            .flat_map(|(annotation, targets)| targets.iter().map(move |t| (annotation.as_str(), t)))
    }

    pub fn targets_of(&self, annotation: &str) -> impl Iterator<Item = &Target> {
        self.targets.get(annotation).into_iter().flatten()
    }

    /// Total number of (annotation, target) pairs.
    pub fn len(&self) -> usize {
        self.targets.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn annotated_packages(&self, annotation: &str) -> BTreeSet<String> {
        self.targets_of(annotation)
            .filter_map(|target| match target {
                Target::Package(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn annotated_classes(&self, annotation: &str) -> BTreeSet<String> {
        self.targets_of(annotation)
            .filter_map(|target| match target {
                Target::Class(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn classes_with_field_annotation(&self, annotation: &str) -> BTreeSet<String> {
        self.targets_of(annotation)
            .filter_map(|target| match target {
                Target::Field { class, .. } => Some(class.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn classes_with_method_annotation(&self, annotation: &str) -> BTreeSet<String> {
        self.targets_of(annotation)
            .filter_map(|target| match target {
                Target::Method { class, .. } => Some(class.clone()),
                _ => None,
            })
            .collect()
    }

    /// Annotations carried by one element.
    pub fn annotations_on(&self, target: &Target) -> BTreeSet<String> {
        self.targets
            .iter()
            .filter(|(_, targets)| targets.contains(target))
            .map(|(annotation, _)| annotation.clone())
            .collect()
    }

    pub fn class_annotations(&self, class: &str) -> BTreeSet<String> {
        self.annotations_on(&Target::Class(class.to_string()))
    }

    /// Adds every pair of `other`; used to build module partitions from container tables.
    pub fn merge_from(&mut self, other: &TargetsTable) {
        for (annotation, targets) in &other.targets {
            self.targets
                .entry(annotation.clone())
                .or_default()
                .extend(targets.iter().cloned());
        }
    }
}

/// An annotation occurrence and its serialized member values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationDetail {
    pub annotation: String,
    pub detail: Vec<u8>,
}

/// Target → annotation details, in scan order per target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetailsTable {
    details: BTreeMap<Target, Vec<AnnotationDetail>>,
}

impl DetailsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: Target, annotation: impl Into<String>, detail: Vec<u8>) {
        self.details.entry(target).or_default().push(AnnotationDetail {
            annotation: annotation.into(),
            detail,
        });
    }

    pub fn details_of(&self, target: &Target) -> &[AnnotationDetail] {
        self.details.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Target, &AnnotationDetail)> {
        self.details
            .iter()
            .flat_map(|(target, details)| details.iter().map(move |d| (target, d)))
    }

    /// Number of distinct targets with details.
    pub fn target_count(&self) -> usize {
        self.details.len()
    }

    /// Number of classes owning at least one detailed element.
    pub fn class_count(&self) -> usize {
        self.details
            .keys()
            .filter(|target| !matches!(target, Target::Package(_)))
            .map(Target::owner)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}

/// The stamp recorded when a container's tables were written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StampTable {
    pub name: String,
    pub stamp: Stamp,
}

/// The ordered containers of a module and their policies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainersTable {
    containers: Vec<(String, ScanPolicy)>,
}

impl ContainersTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, policy: ScanPolicy) {
        self.containers.push((name.into(), policy));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ScanPolicy)> {
        self.containers.iter().map(|(name, policy)| (name.as_str(), *policy))
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Class names referenced by a module, split into resolved and unresolved tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferencesTable {
    classes: BTreeSet<String>,
}

impl ReferencesTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>) -> bool {
        self.classes.insert(class.into())
    }

    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ReferencesTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            classes: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Any persisted table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Table {
    Stamp(StampTable),
    Classes(ClassTable),
    Targets(TargetsTable),
    Details(DetailsTable),
    Containers(ContainersTable),
    Resolved(ReferencesTable),
    Unresolved(ReferencesTable),
}

impl Table {
    pub fn kind(&self) -> TableKind {
        match self {
            Table::Stamp(_) => TableKind::Stamp,
            Table::Classes(_) => TableKind::Classes,
            Table::Targets(_) => TableKind::Targets,
            Table::Details(_) => TableKind::Details,
            Table::Containers(_) => TableKind::Containers,
            Table::Resolved(_) => TableKind::Resolved,
            Table::Unresolved(_) => TableKind::Unresolved,
        }
    }

    /// Element count compared against the write limit.
    pub fn element_count(&self) -> usize {
        match self {
            Table::Stamp(_) => 1,
            Table::Classes(table) => table.class_count(),
            Table::Targets(table) => table.len(),
            Table::Details(table) => table.class_count(),
            Table::Containers(table) => table.len(),
            Table::Resolved(table) | Table::Unresolved(table) => table.len(),
        }
    }

    pub fn as_classes(&self) -> Option<&ClassTable> {
        match self {
            Table::Classes(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_targets(&self) -> Option<&TargetsTable> {
        match self {
            Table::Targets(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_details(&self) -> Option<&DetailsTable> {
        match self {
            Table::Details(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_stamp(&self) -> Option<&StampTable> {
        match self {
            Table::Stamp(table) => Some(table),
            _ => None,
        }
    }
}
