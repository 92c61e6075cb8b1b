//! Binary table format.
//!
//! ```text
//! MAGIC_BEGIN  C0 CA 01 01
//! 0x01 Header   4 x (tag byte + 60-byte space-padded slot): Encoding, Table, Version, Written
//! 0x02 Data     tagged records; strings referenced by u32 index into the Strings region
//! 0x03 Strings  u32 count, then (u32 length, UTF-8 bytes) per string
//! 0x04 Trailer  u32 record count, u32 string count
//! MAGIC_END    C0 CA A0 A0
//! ```
//!
//! All integers are little-endian. The header has a fixed width so it can be rewritten in
//! place once the rest of the file is known.

use super::{SeekWrite, TableCodec, TableHeader};
use crate::error::{CacheError, FormatError};
use crate::model::{
    ClassRecord, ClassTable, ContainersTable, DetailsTable, ReferencesTable, ScanPolicy,
    StampTable, Table, TableKind, Target, TargetsTable,
};
use crate::stamp::Stamp;
use crate::util::now_millis;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, SeekFrom};

pub const MAGIC_BEGIN: [u8; 4] = [0xC0, 0xCA, 0x01, 0x01];
pub const MAGIC_END: [u8; 4] = [0xC0, 0xCA, 0xA0, 0xA0];

pub const HEADER_BYTE: u8 = 0x01;
pub const DATA_BYTE: u8 = 0x02;
pub const STRINGS_BYTE: u8 = 0x03;
pub const TRAILER_BYTE: u8 = 0x04;

pub const ENCODING_BYTE: u8 = 0x11;
pub const TABLE_BYTE: u8 = 0x12;
pub const VERSION_BYTE: u8 = 0x13;
pub const WRITTEN_BYTE: u8 = 0x14;

pub const NAME_BYTE: u8 = 0x15;
pub const STAMP_BYTE: u8 = 0x16;

pub const PACKAGE_BYTE: u8 = 0x31;
pub const CLASS_BYTE: u8 = 0x32;
pub const CLASS_SOURCE_BYTE: u8 = 0x33;
pub const SUPERCLASS_BYTE: u8 = 0x41;
pub const INTERFACE_BYTE: u8 = 0x42;
/// Distinct from `INTERFACE_BYTE`; the legacy layout assigned both 0x42.
pub const MODIFIERS_BYTE: u8 = 0x43;

pub const PACKAGE_ANNOTATION_BYTE: u8 = 0x51;
pub const CLASS_ANNOTATION_BYTE: u8 = 0x52;
pub const FIELD_ANNOTATION_BYTE: u8 = 0x53;
pub const METHOD_ANNOTATION_BYTE: u8 = 0x54;

pub const PACKAGE_DETAIL_BYTE: u8 = 0x61;
pub const CLASS_DETAIL_BYTE: u8 = 0x62;
pub const FIELD_DETAIL_BYTE: u8 = 0x63;
pub const METHOD_DETAIL_BYTE: u8 = 0x64;

pub const CONTAINER_BYTE: u8 = 0x71;
pub const POLICY_BYTE: u8 = 0x72;

pub const REFERENCE_BYTE: u8 = 0x81;

/// Width of one header value slot.
pub const HEADER_WIDTH: usize = 60;
/// Offset of the header region within a file.
pub const HEADER_OFFSET: u64 = MAGIC_BEGIN.len() as u64;
/// Region marker plus four tagged slots.
pub const HEADER_REGION_LEN: usize = 1 + 4 * (1 + HEADER_WIDTH);

const HEADER_PAD: u8 = b' ';

#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    /// Overwrites the header of an already written table in place.
    ///
    /// Only the fixed-width header region is touched; the output position is restored to the
    /// end of the stream afterwards.
    pub fn rewrite_header(out: &mut dyn SeekWrite, header: &TableHeader) -> Result<(), CacheError> {
        out.seek(SeekFrom::Start(HEADER_OFFSET))?;
        write_header(out, header)?;
        out.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

impl TableCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn read(&self, bytes: &[u8]) -> Result<Table, FormatError> {
        let mut reader = Reader::new(bytes);
        let header = read_header(&mut reader)?;
        let kind = header.validate()?;

        reader.expect_region(DATA_BYTE)?;
        let mut records = Vec::new();
        while reader.peek_u8()? != STRINGS_BYTE {
            records.push(read_record(&mut reader, kind)?);
        }

        reader.expect_region(STRINGS_BYTE)?;
        let strings = read_strings(&mut reader)?;

        reader.expect_region(TRAILER_BYTE)?;
        let record_count = reader.read_u32()?;
        check_count("records", record_count, records.len())?;
        let string_count = reader.read_u32()?;
        check_count("strings", string_count, strings.len())?;

        reader.expect_magic(MAGIC_END)?;
        if reader.remaining() > 0 {
            return Err(FormatError::TrailingBytes(reader.remaining()));
        }

        build_table(kind, &records, &strings)
    }

    fn read_header(&self, bytes: &[u8]) -> Result<TableHeader, FormatError> {
        read_header(&mut Reader::new(bytes))
    }

    fn write(&self, table: &Table, out: &mut dyn SeekWrite) -> Result<(), CacheError> {
        let kind = table.kind();

        // Placeholder header; patched once everything else is on disk.
        out.write_all(&MAGIC_BEGIN)?;
        write_header(out, &TableHeader::for_kind(kind, String::new()))?;

        let mut data = DataWriter::default();
        data.encode(table)?;

        out.write_u8(DATA_BYTE)?;
        out.write_all(&data.buf)?;

        out.write_u8(STRINGS_BYTE)?;
        out.write_u32::<LittleEndian>(data.pool.len_u32()?)?;
        for string in &data.pool.strings {
            out.write_u32::<LittleEndian>(len_u32(string.len())?)?;
            out.write_all(string.as_bytes())?;
        }

        out.write_u8(TRAILER_BYTE)?;
        out.write_u32::<LittleEndian>(data.records)?;
        out.write_u32::<LittleEndian>(data.pool.len_u32()?)?;
        out.write_all(&MAGIC_END)?;

        Self::rewrite_header(out, &TableHeader::for_kind(kind, now_millis().to_string()))?;
        out.flush()?;
        Ok(())
    }
}

fn write_header(out: &mut dyn SeekWrite, header: &TableHeader) -> Result<(), CacheError> {
    let mut buf = Vec::with_capacity(HEADER_REGION_LEN);
    buf.push(HEADER_BYTE);
    for (tag, field, value) in [
        (ENCODING_BYTE, "Encoding", &header.encoding),
        (TABLE_BYTE, "Table", &header.table),
        (VERSION_BYTE, "Version", &header.version),
        (WRITTEN_BYTE, "Written", &header.written),
    ] {
        buf.push(tag);
        buf.extend_from_slice(&header_slot(field, value)?);
    }
    debug_assert_eq!(buf.len(), HEADER_REGION_LEN);
    out.write_all(&buf)?;
    Ok(())
}

/// Pads `value` to the fixed header width; values that do not fit are rejected.
pub fn header_slot(field: &'static str, value: &str) -> Result<[u8; HEADER_WIDTH], FormatError> {
    let bytes = value.as_bytes();
    if bytes.len() > HEADER_WIDTH {
        return Err(FormatError::HeaderValueTooLong {
            field,
            len: bytes.len(),
            width: HEADER_WIDTH,
        });
    }
    let mut slot = [HEADER_PAD; HEADER_WIDTH];
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(slot)
}

fn read_header(reader: &mut Reader<'_>) -> Result<TableHeader, FormatError> {
    reader.expect_magic(MAGIC_BEGIN)?;
    reader.expect_region(HEADER_BYTE)?;

    let mut values: [String; 4] = Default::default();
    for (slot, tag) in values
        .iter_mut()
        .zip([ENCODING_BYTE, TABLE_BYTE, VERSION_BYTE, WRITTEN_BYTE])
    {
        let offset = reader.pos;
        let found = reader.read_u8()?;
        if found != tag {
            return Err(FormatError::UnexpectedTag {
                offset,
                tag: found,
                table: "Header",
            });
        }
        let raw = reader.read_slice(HEADER_WIDTH)?;
        let text = std::str::from_utf8(raw).map_err(|_| FormatError::InvalidUtf8("header"))?;
        *slot = text.trim_end_matches(HEADER_PAD as char).to_string();
    }

    let [encoding, table, version, written] = values;
    Ok(TableHeader {
        encoding,
        table,
        version,
        written,
    })
}

#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringPool {
    fn intern(&mut self, value: &str) -> io::Result<u32> {
        if let Some(&idx) = self.index.get(value) {
            return Ok(idx);
        }
        let idx = self.len_u32()?;
        self.strings.push(value.to_string());
        self.index.insert(value.to_string(), idx);
        Ok(idx)
    }

    fn len_u32(&self) -> io::Result<u32> {
        len_u32(self.strings.len())
    }
}

fn len_u32(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| io::Error::other("cache table exceeds u32 limits"))
}

#[derive(Default)]
struct DataWriter {
    buf: Vec<u8>,
    pool: StringPool,
    records: u32,
}

impl DataWriter {
    fn record(&mut self, tag: u8, strings: &[&str]) -> io::Result<()> {
        self.buf.push(tag);
        self.records += 1;
        for value in strings {
            let idx = self.pool.intern(value)?;
            self.buf.write_u32::<LittleEndian>(idx)?;
        }
        Ok(())
    }

    fn encode(&mut self, table: &Table) -> io::Result<()> {
        match table {
            Table::Stamp(stamp) => {
                self.record(NAME_BYTE, &[stamp.name.as_str()])?;
                self.record(STAMP_BYTE, &[stamp.stamp.as_str()])?;
            }
            Table::Classes(classes) => {
                for package in classes.packages() {
                    self.record(PACKAGE_BYTE, &[package])?;
                }
                for (name, class) in classes.classes() {
                    self.record(CLASS_BYTE, &[name])?;
                    self.record(CLASS_SOURCE_BYTE, &[class.class_source.as_str()])?;
                    if let Some(superclass) = &class.superclass {
                        self.record(SUPERCLASS_BYTE, &[superclass.as_str()])?;
                    }
                    for interface in &class.interfaces {
                        self.record(INTERFACE_BYTE, &[interface.as_str()])?;
                    }
                    self.record(MODIFIERS_BYTE, &[])?;
                    self.buf.write_u32::<LittleEndian>(class.modifiers)?;
                }
            }
            Table::Targets(targets) => {
                for (annotation, target) in targets.iter() {
                    let (offset, mut refs) = target_operands(target);
                    refs.push(annotation);
                    self.record(PACKAGE_ANNOTATION_BYTE + offset, &refs)?;
                }
            }
            Table::Details(details) => {
                for (target, detail) in details.iter() {
                    let (offset, mut refs) = target_operands(target);
                    refs.push(detail.annotation.as_str());
                    self.record(PACKAGE_DETAIL_BYTE + offset, &refs)?;
                    self.buf
                        .write_u32::<LittleEndian>(len_u32(detail.detail.len())?)?;
                    self.buf.extend_from_slice(&detail.detail);
                }
            }
            Table::Containers(containers) => {
                for (name, policy) in containers.iter() {
                    self.record(CONTAINER_BYTE, &[name])?;
                    self.record(POLICY_BYTE, &[])?;
                    self.buf.push(policy.code());
                }
            }
            Table::Resolved(references) | Table::Unresolved(references) => {
                for class in references.iter() {
                    self.record(REFERENCE_BYTE, &[class])?;
                }
            }
        }
        Ok(())
    }
}

/// Tag offset from the package variant, and the strings naming the target.
fn target_operands(target: &Target) -> (u8, Vec<&str>) {
    match target {
        Target::Package(package) => (0, vec![package.as_str()]),
        Target::Class(class) => (1, vec![class.as_str()]),
        Target::Field { class, name } => (2, vec![class.as_str(), name.as_str()]),
        Target::Method { class, signature } => (3, vec![class.as_str(), signature.as_str()]),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.remaining() < len {
            return Err(FormatError::Truncated {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn peek_u8(&self) -> Result<u8, FormatError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(FormatError::Truncated {
                offset: self.pos,
                needed: 1,
            })
    }

    fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FormatError> {
        Ok(LittleEndian::read_u32(self.read_slice(4)?))
    }

    fn expect_region(&mut self, expected: u8) -> Result<(), FormatError> {
        let offset = self.pos;
        let found = self.read_u8()?;
        if found != expected {
            return Err(FormatError::UnknownRegion {
                offset,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn expect_magic(&mut self, expected: [u8; 4]) -> Result<(), FormatError> {
        let offset = self.pos;
        let available = self.remaining().min(expected.len());
        let found = &self.bytes[self.pos..self.pos + available];
        if found != expected {
            return Err(FormatError::BadMagic {
                offset,
                expected,
                found: found.to_vec(),
            });
        }
        self.pos += expected.len();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Operand {
    None,
    U32,
    U8,
    Blob,
}

fn operand_layout(tag: u8) -> Option<(usize, Operand)> {
    Some(match tag {
        NAME_BYTE | STAMP_BYTE | PACKAGE_BYTE | CLASS_BYTE | CLASS_SOURCE_BYTE
        | SUPERCLASS_BYTE | INTERFACE_BYTE | CONTAINER_BYTE | REFERENCE_BYTE => {
            (1, Operand::None)
        }
        MODIFIERS_BYTE => (0, Operand::U32),
        POLICY_BYTE => (0, Operand::U8),
        PACKAGE_ANNOTATION_BYTE | CLASS_ANNOTATION_BYTE => (2, Operand::None),
        FIELD_ANNOTATION_BYTE | METHOD_ANNOTATION_BYTE => (3, Operand::None),
        PACKAGE_DETAIL_BYTE | CLASS_DETAIL_BYTE => (2, Operand::Blob),
        FIELD_DETAIL_BYTE | METHOD_DETAIL_BYTE => (3, Operand::Blob),
        _ => return None,
    })
}

#[derive(Clone, Copy, Debug)]
struct Record<'a> {
    tag: u8,
    offset: usize,
    refs: [u32; 3],
    value: u32,
    blob: &'a [u8],
}

fn read_record<'a>(reader: &mut Reader<'a>, kind: TableKind) -> Result<Record<'a>, FormatError> {
    let offset = reader.pos;
    let tag = reader.read_u8()?;
    let (ref_count, operand) = operand_layout(tag).ok_or(FormatError::UnexpectedTag {
        offset,
        tag,
        table: kind.table_name(),
    })?;

    let mut record = Record {
        tag,
        offset,
        refs: [0; 3],
        value: 0,
        blob: &[],
    };
    for slot in record.refs.iter_mut().take(ref_count) {
        *slot = reader.read_u32()?;
    }
    match operand {
        Operand::None => {}
        Operand::U32 => record.value = reader.read_u32()?,
        Operand::U8 => record.value = u32::from(reader.read_u8()?),
        Operand::Blob => {
            let len = reader.read_u32()? as usize;
            record.blob = reader.read_slice(len)?;
        }
    }
    Ok(record)
}

fn read_strings(reader: &mut Reader<'_>) -> Result<Vec<String>, FormatError> {
    let count = reader.read_u32()? as usize;
    // Each string needs at least its length prefix; don't trust the count for allocation.
    let mut strings = Vec::with_capacity(count.min(reader.remaining() / 4));
    for _ in 0..count {
        let len = reader.read_u32()? as usize;
        let raw = reader.read_slice(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| FormatError::InvalidUtf8("strings"))?;
        strings.push(text.to_string());
    }
    Ok(strings)
}

fn check_count(what: &'static str, expected: u32, found: usize) -> Result<(), FormatError> {
    if u32::try_from(found).ok() != Some(expected) {
        return Err(FormatError::CountMismatch {
            what,
            expected,
            found: u32::try_from(found).unwrap_or(u32::MAX),
        });
    }
    Ok(())
}

struct Resolver<'s> {
    strings: &'s [String],
}

impl<'s> Resolver<'s> {
    fn get(&self, record: &Record<'_>, slot: usize) -> Result<&'s str, FormatError> {
        let index = record.refs[slot];
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or(FormatError::StringIndexOutOfBounds {
                index,
                len: self.strings.len(),
            })
    }
}

fn build_table(
    kind: TableKind,
    records: &[Record<'_>],
    strings: &[String],
) -> Result<Table, FormatError> {
    let resolver = Resolver { strings };
    let table = kind.table_name();
    let unexpected = |record: &Record<'_>| FormatError::UnexpectedTag {
        offset: record.offset,
        tag: record.tag,
        table,
    };

    match kind {
        TableKind::Stamp => {
            let mut name = None;
            let mut stamp = None;
            for record in records {
                match record.tag {
                    NAME_BYTE if name.is_none() => name = Some(resolver.get(record, 0)?),
                    STAMP_BYTE if stamp.is_none() => stamp = Some(resolver.get(record, 0)?),
                    _ => return Err(unexpected(record)),
                }
            }
            let name = name.ok_or(FormatError::MissingRecord {
                table,
                record: "Name",
            })?;
            let stamp = stamp.ok_or(FormatError::MissingRecord {
                table,
                record: "Stamp",
            })?;
            Ok(Table::Stamp(StampTable {
                name: name.to_string(),
                stamp: Stamp::new(stamp),
            }))
        }
        TableKind::Classes => {
            let mut classes = ClassTable::new();
            let mut current: Option<(&str, Option<ClassRecord>)> = None;
            for record in records {
                match record.tag {
                    PACKAGE_BYTE => {
                        finish_class(&mut classes, current.take(), table)?;
                        classes.add_package(resolver.get(record, 0)?);
                    }
                    CLASS_BYTE => {
                        finish_class(&mut classes, current.take(), table)?;
                        current = Some((resolver.get(record, 0)?, None));
                    }
                    CLASS_SOURCE_BYTE => match &mut current {
                        Some((_, class)) if class.is_none() => {
                            *class = Some(ClassRecord::new(resolver.get(record, 0)?));
                        }
                        _ => return Err(unexpected(record)),
                    },
                    SUPERCLASS_BYTE => match &mut current {
                        Some((_, Some(class))) if class.superclass.is_none() => {
                            class.superclass = Some(resolver.get(record, 0)?.to_string());
                        }
                        _ => return Err(unexpected(record)),
                    },
                    INTERFACE_BYTE => match &mut current {
                        Some((_, Some(class))) => class.add_interface(resolver.get(record, 0)?),
                        _ => return Err(unexpected(record)),
                    },
                    MODIFIERS_BYTE => match &mut current {
                        Some((_, Some(class))) => class.modifiers = record.value,
                        _ => return Err(unexpected(record)),
                    },
                    _ => return Err(unexpected(record)),
                }
            }
            finish_class(&mut classes, current.take(), table)?;
            Ok(Table::Classes(classes))
        }
        TableKind::Targets => {
            let mut targets = TargetsTable::new();
            for record in records {
                let (target, annotation) = match record.tag {
                    PACKAGE_ANNOTATION_BYTE => (
                        Target::package(resolver.get(record, 0)?),
                        resolver.get(record, 1)?,
                    ),
                    CLASS_ANNOTATION_BYTE => (
                        Target::class(resolver.get(record, 0)?),
                        resolver.get(record, 1)?,
                    ),
                    FIELD_ANNOTATION_BYTE => (
                        Target::field(resolver.get(record, 0)?, resolver.get(record, 1)?),
                        resolver.get(record, 2)?,
                    ),
                    METHOD_ANNOTATION_BYTE => (
                        Target::method(resolver.get(record, 0)?, resolver.get(record, 1)?),
                        resolver.get(record, 2)?,
                    ),
                    _ => return Err(unexpected(record)),
                };
                targets.add(annotation, target);
            }
            Ok(Table::Targets(targets))
        }
        TableKind::Details => {
            let mut details = DetailsTable::new();
            for record in records {
                let (target, annotation) = match record.tag {
                    PACKAGE_DETAIL_BYTE => (
                        Target::package(resolver.get(record, 0)?),
                        resolver.get(record, 1)?,
                    ),
                    CLASS_DETAIL_BYTE => (
                        Target::class(resolver.get(record, 0)?),
                        resolver.get(record, 1)?,
                    ),
                    FIELD_DETAIL_BYTE => (
                        Target::field(resolver.get(record, 0)?, resolver.get(record, 1)?),
                        resolver.get(record, 2)?,
                    ),
                    METHOD_DETAIL_BYTE => (
                        Target::method(resolver.get(record, 0)?, resolver.get(record, 1)?),
                        resolver.get(record, 2)?,
                    ),
                    _ => return Err(unexpected(record)),
                };
                details.add(target, annotation, record.blob.to_vec());
            }
            Ok(Table::Details(details))
        }
        TableKind::Containers => {
            let mut containers = ContainersTable::new();
            let mut pending: Option<&str> = None;
            for record in records {
                match record.tag {
                    CONTAINER_BYTE if pending.is_none() => {
                        pending = Some(resolver.get(record, 0)?)
                    }
                    POLICY_BYTE => {
                        let name = pending.take().ok_or_else(|| unexpected(record))?;
                        let code = record.value as u8;
                        let policy = ScanPolicy::from_code(code)
                            .ok_or(FormatError::UnknownPolicy(code))?;
                        containers.push(name, policy);
                    }
                    _ => return Err(unexpected(record)),
                }
            }
            if pending.is_some() {
                return Err(FormatError::MissingRecord {
                    table,
                    record: "Policy",
                });
            }
            Ok(Table::Containers(containers))
        }
        TableKind::Resolved | TableKind::Unresolved => {
            let mut references = ReferencesTable::new();
            for record in records {
                match record.tag {
                    REFERENCE_BYTE => {
                        references.insert(resolver.get(record, 0)?);
                    }
                    _ => return Err(unexpected(record)),
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

fn finish_class(
    classes: &mut ClassTable,
    current: Option<(&str, Option<ClassRecord>)>,
    table: &'static str,
) -> Result<(), FormatError> {
    match current {
        None => Ok(()),
        Some((name, Some(record))) => {
            classes.add_class(name, record);
            Ok(())
        }
        Some((_, None)) => Err(FormatError::MissingRecord {
            table,
            record: "ClassSource",
        }),
    }
}
