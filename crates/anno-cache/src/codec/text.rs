//! Line-oriented text table format.
//!
//! A table is a delimiter line, the four header lines, a second delimiter line, the records
//! as `Key: value` lines, and a closing delimiter. Blank lines and lines starting with `#`
//! are ignored. Bundles concatenate tables, each closed by [`BUNDLE_SEPARATOR`] instead.

use super::{SeekWrite, TableCodec, TableHeader};
use crate::error::{CacheError, FormatError};
use crate::model::{
    ClassRecord, ClassTable, ContainersTable, DetailsTable, ReferencesTable, ScanPolicy,
    StampTable, Table, TableKind, Target, TargetsTable,
};
use crate::stamp::Stamp;
use crate::util::now_millis;
use std::io::Write;

/// `=` repeated to the delimiter width.
pub const DELIMITER: &str = "============================================================";
/// `X`, `=` repeated, `X`; same width as [`DELIMITER`].
pub const BUNDLE_SEPARATOR: &str = "X==========================================================X";

const ENCODING_KEY: &str = "Encoding";
const TABLE_KEY: &str = "Table";
const VERSION_KEY: &str = "Version";
const WRITTEN_KEY: &str = "Written";

const NAME_KEY: &str = "Name";
const STAMP_KEY: &str = "Stamp";
const PACKAGE_KEY: &str = "Package";
const CLASS_KEY: &str = "Class";
const CLASS_SOURCE_KEY: &str = "ClassSource";
const SUPERCLASS_KEY: &str = "Superclass";
const INTERFACE_KEY: &str = "Interface";
const MODIFIERS_KEY: &str = "Modifiers";
const FIELD_KEY: &str = "Field";
const METHOD_KEY: &str = "Method";
const PACKAGE_ANNOTATION_KEY: &str = "PackageAnnotation";
const CLASS_ANNOTATION_KEY: &str = "ClassAnnotation";
const FIELD_ANNOTATION_KEY: &str = "FieldAnnotation";
const METHOD_ANNOTATION_KEY: &str = "MethodAnnotation";
const ANNOTATION_KEY: &str = "Annotation";
const DETAIL_KEY: &str = "Detail";
const CONTAINER_KEY: &str = "Container";
const POLICY_KEY: &str = "Policy";

#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

impl TextCodec {
    /// Writes several tables as one document, each closed by the bundle separator.
    pub fn write_bundle(&self, tables: &[Table], out: &mut dyn Write) -> Result<(), CacheError> {
        let mut writer = TextWriter::default();
        for table in tables {
            writer.table(table, BUNDLE_SEPARATOR)?;
        }
        out.write_all(writer.buf.as_bytes())?;
        out.flush()?;
        Ok(())
    }

    /// Reads a document written by [`TextCodec::write_bundle`].
    pub fn read_bundle(&self, bytes: &[u8]) -> Result<Vec<Table>, FormatError> {
        let mut lines = Lines::new(as_text(bytes)?);
        let mut tables = Vec::new();
        while lines.peek().is_some() {
            let (table, end) = read_table(&mut lines)?;
            if end.text != BUNDLE_SEPARATOR {
                return Err(malformed(end.number, "expected a bundle separator"));
            }
            tables.push(table);
        }
        Ok(tables)
    }
}

impl TableCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn read(&self, bytes: &[u8]) -> Result<Table, FormatError> {
        let mut lines = Lines::new(as_text(bytes)?);
        let (table, end) = read_table(&mut lines)?;
        if end.text != DELIMITER {
            return Err(malformed(end.number, "bundle separator in a single table"));
        }
        if let Some(extra) = lines.next() {
            return Err(malformed(extra.number, "content after the end delimiter"));
        }
        Ok(table)
    }

    fn read_header(&self, bytes: &[u8]) -> Result<TableHeader, FormatError> {
        read_header(&mut Lines::new(as_text(bytes)?))
    }

    fn write(&self, table: &Table, out: &mut dyn SeekWrite) -> Result<(), CacheError> {
        let mut writer = TextWriter::default();
        writer.table(table, DELIMITER)?;
        out.write_all(writer.buf.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

fn as_text(bytes: &[u8]) -> Result<&str, FormatError> {
    std::str::from_utf8(bytes).map_err(|_| FormatError::InvalidUtf8("text table"))
}

fn malformed(line: usize, message: impl Into<String>) -> FormatError {
    FormatError::MalformedLine {
        line,
        message: message.into(),
    }
}

#[derive(Default)]
struct TextWriter {
    buf: String,
    /// Class that `Field` and `Method` lines currently belong to.
    scope: Option<String>,
    /// Element named by the most recent element lines.
    last: Option<Target>,
}

impl TextWriter {
    fn line(&mut self, text: &str) {
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    fn field(&mut self, key: &'static str, value: &str) -> Result<(), FormatError> {
        if value.contains(['\n', '\r']) {
            return Err(FormatError::MultiLineValue {
                field: key,
                value: value.to_string(),
            });
        }
        self.buf.push_str(key);
        self.buf.push_str(": ");
        self.buf.push_str(value);
        self.buf.push('\n');
        Ok(())
    }

    fn table(&mut self, table: &Table, end: &str) -> Result<(), FormatError> {
        let kind = table.kind();
        let header = TableHeader::for_kind(kind, now_millis().to_string());
        self.scope = None;
        self.last = None;

        self.line(DELIMITER);
        self.field(ENCODING_KEY, &header.encoding)?;
        self.field(TABLE_KEY, &header.table)?;
        self.field(VERSION_KEY, &header.version)?;
        self.field(WRITTEN_KEY, &header.written)?;
        self.line(DELIMITER);

        match table {
            Table::Stamp(stamp) => {
                self.field(NAME_KEY, &stamp.name)?;
                self.field(STAMP_KEY, stamp.stamp.as_str())?;
            }
            Table::Classes(classes) => {
                for package in classes.packages() {
                    self.field(PACKAGE_KEY, package)?;
                }
                for (name, class) in classes.classes() {
                    self.field(CLASS_KEY, name)?;
                    self.field(CLASS_SOURCE_KEY, &class.class_source)?;
                    if let Some(superclass) = &class.superclass {
                        self.field(SUPERCLASS_KEY, superclass)?;
                    }
                    for interface in &class.interfaces {
                        self.field(INTERFACE_KEY, interface)?;
                    }
                    self.field(MODIFIERS_KEY, &format!("0x{:04X}", class.modifiers))?;
                }
            }
            Table::Targets(targets) => {
                for (annotation, target) in targets.iter() {
                    self.target(target)?;
                    let key = match target {
                        Target::Package(_) => PACKAGE_ANNOTATION_KEY,
                        Target::Class(_) => CLASS_ANNOTATION_KEY,
                        Target::Field { .. } => FIELD_ANNOTATION_KEY,
                        Target::Method { .. } => METHOD_ANNOTATION_KEY,
                    };
                    self.field(key, annotation)?;
                }
            }
            Table::Details(details) => {
                for (target, detail) in details.iter() {
                    self.target(target)?;
                    self.field(ANNOTATION_KEY, &detail.annotation)?;
                    self.field(DETAIL_KEY, &hex::encode(&detail.detail))?;
                }
            }
            Table::Containers(containers) => {
                for (name, policy) in containers.iter() {
                    self.field(CONTAINER_KEY, name)?;
                    self.field(POLICY_KEY, policy.as_str())?;
                }
            }
            Table::Resolved(references) | Table::Unresolved(references) => {
                for class in references.iter() {
                    self.field(CLASS_KEY, class)?;
                }
            }
        }

        self.line(end);
        Ok(())
    }

    /// Emits the element lines for `target`, skipping those already in effect.
    fn target(&mut self, target: &Target) -> Result<(), FormatError> {
        if self.last.as_ref() == Some(target) {
            return Ok(());
        }
        match target {
            Target::Package(package) => self.field(PACKAGE_KEY, package)?,
            Target::Class(class) => self.enter_class(class, true)?,
            Target::Field { class, name } => {
                self.enter_class(class, false)?;
                self.field(FIELD_KEY, name)?;
            }
            Target::Method { class, signature } => {
                self.enter_class(class, false)?;
                self.field(METHOD_KEY, signature)?;
            }
        }
        self.last = Some(target.clone());
        Ok(())
    }

    fn enter_class(&mut self, class: &str, always: bool) -> Result<(), FormatError> {
        if always || self.scope.as_deref() != Some(class) {
            self.field(CLASS_KEY, class)?;
            self.scope = Some(class.to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Line<'a> {
    number: usize,
    text: &'a str,
}

impl<'a> Line<'a> {
    fn is_delimiter(&self) -> bool {
        self.text == DELIMITER || self.text == BUNDLE_SEPARATOR
    }

    fn key_value(&self) -> Result<(&'a str, &'a str), FormatError> {
        let (key, value) = self
            .text
            .split_once(':')
            .ok_or_else(|| malformed(self.number, "expected `Key: value`"))?;
        Ok((key.trim(), value.strip_prefix(' ').unwrap_or(value)))
    }

    fn expect(&self, key: &str) -> Result<&'a str, FormatError> {
        match self.key_value()? {
            (found, value) if found == key => Ok(value),
            (found, _) => Err(malformed(
                self.number,
                format!("expected `{key}`, found `{found}`"),
            )),
        }
    }
}

/// Significant lines: blank lines and `#` comments are skipped.
struct Lines<'a> {
    inner: std::iter::Peekable<std::iter::Enumerate<std::str::Lines<'a>>>,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            inner: text.lines().enumerate().peekable(),
        }
    }

    fn skip_insignificant(&mut self) {
        while let Some((_, text)) = self.inner.peek() {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                self.inner.next();
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<Line<'a>> {
        self.skip_insignificant();
        self.inner.peek().map(|&(idx, text)| Line {
            number: idx + 1,
            text: text.trim_end_matches('\r'),
        })
    }

    fn require(&mut self) -> Result<Line<'a>, FormatError> {
        self.next().ok_or(FormatError::MissingEndDelimiter)
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        let line = self.peek()?;
        self.inner.next();
        Some(line)
    }
}

fn read_header(lines: &mut Lines<'_>) -> Result<TableHeader, FormatError> {
    let open = lines.require()?;
    if open.text != DELIMITER {
        return Err(malformed(open.number, "expected the header delimiter"));
    }
    let encoding = lines.require()?.expect(ENCODING_KEY)?.to_string();
    let table = lines.require()?.expect(TABLE_KEY)?.to_string();
    let version = lines.require()?.expect(VERSION_KEY)?.to_string();
    let written = lines.require()?.expect(WRITTEN_KEY)?.to_string();
    let close = lines.require()?;
    if close.text != DELIMITER {
        return Err(malformed(close.number, "expected the delimiter after the header"));
    }
    Ok(TableHeader {
        encoding,
        table,
        version,
        written,
    })
}

/// Reads one table and returns it with the delimiter line that closed it.
fn read_table<'a>(lines: &mut Lines<'a>) -> Result<(Table, Line<'a>), FormatError> {
    let kind = read_header(lines)?.validate()?;
    let mut body = Vec::new();
    let end = loop {
        let line = lines.require()?;
        if line.is_delimiter() {
            break line;
        }
        body.push(line);
    };
    Ok((build_table(kind, &body)?, end))
}

fn unexpected(line: &Line<'_>, key: &str, kind: TableKind) -> FormatError {
    malformed(
        line.number,
        format!("unexpected `{key}` in table {}", kind.table_name()),
    )
}

fn build_table(kind: TableKind, body: &[Line<'_>]) -> Result<Table, FormatError> {
    match kind {
        TableKind::Stamp => {
            let mut name = None;
            let mut stamp = None;
            for line in body {
                match line.key_value()? {
                    (NAME_KEY, value) if name.is_none() => name = Some(value),
                    (STAMP_KEY, value) if stamp.is_none() => stamp = Some(value),
                    (key, _) => return Err(unexpected(line, key, kind)),
                }
            }
            let table = kind.table_name();
            Ok(Table::Stamp(StampTable {
                name: name
                    .ok_or(FormatError::MissingRecord {
                        table,
                        record: NAME_KEY,
                    })?
                    .to_string(),
                stamp: Stamp::new(stamp.ok_or(FormatError::MissingRecord {
                    table,
                    record: STAMP_KEY,
                })?),
            }))
        }
        TableKind::Classes => read_classes(body).map(Table::Classes),
        TableKind::Targets => read_targets(body).map(Table::Targets),
        TableKind::Details => read_details(body).map(Table::Details),
        TableKind::Containers => {
            let mut containers = ContainersTable::new();
            let mut pending = None;
            for line in body {
                match line.key_value()? {
                    (CONTAINER_KEY, value) if pending.is_none() => pending = Some(value),
                    (POLICY_KEY, value) => {
                        let name = pending
                            .take()
                            .ok_or_else(|| unexpected(line, POLICY_KEY, kind))?;
                        let policy = ScanPolicy::parse(value).ok_or_else(|| {
                            malformed(line.number, format!("unknown scan policy `{value}`"))
                        })?;
                        containers.push(name, policy);
                    }
                    (key, _) => return Err(unexpected(line, key, kind)),
                }
            }
            if pending.is_some() {
                return Err(FormatError::MissingRecord {
                    table: kind.table_name(),
                    record: POLICY_KEY,
                });
            }
            Ok(Table::Containers(containers))
        }
        TableKind::Resolved | TableKind::Unresolved => {
            let mut references = ReferencesTable::new();
            for line in body {
                match line.key_value()? {
                    (CLASS_KEY, value) => {
                        references.insert(value);
                    }
                    (key, _) => return Err(unexpected(line, key, kind)),
                }
            }
            Ok(if kind == TableKind::Resolved {
                Table::Resolved(references)
            } else {
                Table::Unresolved(references)
            })
        }
    }
}

fn read_classes(body: &[Line<'_>]) -> Result<ClassTable, FormatError> {
    let kind = TableKind::Classes;
    let mut classes = ClassTable::new();
    let mut current: Option<(&str, Option<ClassRecord>)> = None;

    for line in body {
        let (key, value) = line.key_value()?;
        match key {
            PACKAGE_KEY => {
                finish_class(&mut classes, current.take())?;
                classes.add_package(value);
                continue;
            }
            CLASS_KEY => {
                finish_class(&mut classes, current.take())?;
                current = Some((value, None));
                continue;
            }
            _ => {}
        }
        match (key, current.as_mut().map(|(_, record)| record)) {
            (CLASS_SOURCE_KEY, Some(record)) if record.is_none() => {
                *record = Some(ClassRecord::new(value));
            }
            (SUPERCLASS_KEY, Some(Some(record))) if record.superclass.is_none() => {
                record.superclass = Some(value.to_string());
            }
            (INTERFACE_KEY, Some(Some(record))) => record.add_interface(value),
            (MODIFIERS_KEY, Some(Some(record))) => {
                record.modifiers = parse_modifiers(value)
                    .ok_or_else(|| malformed(line.number, format!("bad modifiers `{value}`")))?;
            }
            _ => return Err(unexpected(line, key, kind)),
        }
    }
    finish_class(&mut classes, current)?;
    Ok(classes)
}

fn finish_class(
    classes: &mut ClassTable,
    current: Option<(&str, Option<ClassRecord>)>,
) -> Result<(), FormatError> {
    match current {
        None => Ok(()),
        Some((name, Some(record))) => {
            classes.add_class(name, record);
            Ok(())
        }
        Some((_, None)) => Err(FormatError::MissingRecord {
            table: TableKind::Classes.table_name(),
            record: CLASS_SOURCE_KEY,
        }),
    }
}

fn parse_modifiers(value: &str) -> Option<u32> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))?;
    u32::from_str_radix(digits, 16).ok()
}

/// Tracks the element named by `Package`, `Class`, `Field` and `Method` lines.
#[derive(Default)]
struct ElementCursor {
    scope: Option<String>,
    current: Option<Target>,
}

impl ElementCursor {
    /// Consumes an element line; returns false if `key` is not an element key.
    fn accept(&mut self, line: &Line<'_>, key: &str, value: &str) -> Result<bool, FormatError> {
        let target = match key {
            PACKAGE_KEY => Target::package(value),
            CLASS_KEY => {
                self.scope = Some(value.to_string());
                Target::class(value)
            }
            FIELD_KEY | METHOD_KEY => {
                let class = self.scope.as_deref().ok_or_else(|| {
                    malformed(line.number, format!("`{key}` before any `Class` line"))
                })?;
                if key == FIELD_KEY {
                    Target::field(class, value)
                } else {
                    Target::method(class, value)
                }
            }
            _ => return Ok(false),
        };
        self.current = Some(target);
        Ok(true)
    }
}

fn read_targets(body: &[Line<'_>]) -> Result<TargetsTable, FormatError> {
    let kind = TableKind::Targets;
    let mut targets = TargetsTable::new();
    let mut cursor = ElementCursor::default();
    for line in body {
        let (key, value) = line.key_value()?;
        if cursor.accept(line, key, value)? {
            continue;
        }
        let target = match (key, &cursor.current) {
            (PACKAGE_ANNOTATION_KEY, Some(target @ Target::Package(_)))
            | (CLASS_ANNOTATION_KEY, Some(target @ Target::Class(_)))
            | (FIELD_ANNOTATION_KEY, Some(target @ Target::Field { .. }))
            | (METHOD_ANNOTATION_KEY, Some(target @ Target::Method { .. })) => target.clone(),
            _ => return Err(unexpected(line, key, kind)),
        };
        targets.add(value, target);
    }
    Ok(targets)
}

fn read_details(body: &[Line<'_>]) -> Result<DetailsTable, FormatError> {
    let kind = TableKind::Details;
    let mut details = DetailsTable::new();
    let mut cursor = ElementCursor::default();
    let mut annotation: Option<&str> = None;
    for line in body {
        let (key, value) = line.key_value()?;
        if annotation.is_none() && cursor.accept(line, key, value)? {
            continue;
        }
        match (key, &cursor.current) {
            (ANNOTATION_KEY, Some(_)) if annotation.is_none() => annotation = Some(value),
            (DETAIL_KEY, Some(target)) => {
                let name = annotation
                    .take()
                    .ok_or_else(|| unexpected(line, key, kind))?;
                let bytes = hex::decode(value)
                    .map_err(|err| malformed(line.number, format!("bad detail hex: {err}")))?;
                details.add(target.clone(), name, bytes);
            }
            _ => return Err(unexpected(line, key, kind)),
        }
    }
    if annotation.is_some() {
        return Err(FormatError::MissingRecord {
            table: kind.table_name(),
            record: DETAIL_KEY,
        });
    }
    Ok(details)
}
