//! Encoders and decoders for persisted tables.
//!
//! Both formats carry the same header fields (`Encoding`, `Table`, `Version`, `Written`) and
//! the same logical records; [`TableCodec`] is the seam the store dispatches through.

pub mod binary;
pub mod text;

use crate::error::{CacheError, FormatError};
use crate::model::{Table, TableKind};
use crate::options::Format;
use std::io::{Cursor, Seek, Write};

pub use binary::BinaryCodec;
pub use text::TextCodec;

/// The only encoding ever written.
pub const ENCODING_UTF8: &str = "UTF-8";

/// Output a codec can write to and later patch in place.
pub trait SeekWrite: Write + Seek {}

impl<T: Write + Seek> SeekWrite for T {}

/// Capability interface shared by the on-disk formats.
pub trait TableCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decodes one complete table file.
    fn read(&self, bytes: &[u8]) -> Result<Table, FormatError>;

    /// Decodes only the header, for inspection.
    fn read_header(&self, bytes: &[u8]) -> Result<TableHeader, FormatError>;

    fn write(&self, table: &Table, out: &mut dyn SeekWrite) -> Result<(), CacheError>;
}

/// Header fields common to both formats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableHeader {
    pub encoding: String,
    pub table: String,
    pub version: String,
    pub written: String,
}

impl TableHeader {
    pub(crate) fn for_kind(kind: TableKind, written: String) -> Self {
        Self {
            encoding: ENCODING_UTF8.to_string(),
            table: kind.table_name().to_string(),
            version: kind.version().to_string(),
            written,
        }
    }

    /// Checks encoding and the table/version pair, returning the declared table kind.
    pub(crate) fn validate(&self) -> Result<TableKind, FormatError> {
        if self.encoding != ENCODING_UTF8 {
            return Err(FormatError::UnsupportedEncoding(self.encoding.clone()));
        }
        match TableKind::from_table_name(&self.table) {
            Some(kind) if kind.version() == self.version => Ok(kind),
            _ => Err(FormatError::UnsupportedVersion {
                table: self.table.clone(),
                version: self.version.clone(),
            }),
        }
    }
}

static BINARY: BinaryCodec = BinaryCodec;
static TEXT: TextCodec = TextCodec;

/// The codec backing a format. Jandex-format stores use binary records.
pub fn codec_for(format: Format) -> &'static dyn TableCodec {
    match format {
        Format::Binary | Format::Jandex => &BINARY,
        Format::Text => &TEXT,
    }
}

/// Picks a codec by sniffing the leading bytes of a file.
pub fn detect(bytes: &[u8]) -> &'static dyn TableCodec {
    if bytes.starts_with(&binary::MAGIC_BEGIN) {
        &BINARY
    } else {
        &TEXT
    }
}

pub fn encode_to_vec(codec: &dyn TableCodec, table: &Table) -> Result<Vec<u8>, CacheError> {
    let mut cursor = Cursor::new(Vec::new());
    codec.write(table, &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Small but complete tables shared by the codec tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use crate::model::{
        ClassRecord, ClassTable, ContainersTable, DetailsTable, ReferencesTable, ScanPolicy,
        StampTable, Table, Target, TargetsTable, ACC_ABSTRACT, ACC_INTERFACE,
    };
    use crate::stamp::Stamp;

    pub(crate) fn classes() -> ClassTable {
        let mut table = ClassTable::new();
        for package in ["com.acme.api", "com.acme.web", "com.acme.util"] {
            table.add_package(package);
        }
        table.add_class(
            "com.acme.api.Handler",
            ClassRecord::new("WEB-INF/lib/api.jar")
                .with_modifiers(0x0001 | ACC_INTERFACE | ACC_ABSTRACT),
        );
        table.add_class(
            "com.acme.web.BaseServlet",
            ClassRecord::new("WEB-INF/classes")
                .with_superclass("javax.servlet.http.HttpServlet")
                .with_modifiers(0x0001 | ACC_ABSTRACT),
        );
        table.add_class(
            "com.acme.web.OrderServlet",
            ClassRecord::new("WEB-INF/classes")
                .with_superclass("com.acme.web.BaseServlet")
                .with_interface("java.io.Serializable")
                .with_interface("com.acme.api.Handler")
                .with_modifiers(0x0001),
        );
        table.add_class(
            "com.acme.web.OrderServlet$Line",
            ClassRecord::new("WEB-INF/classes").with_superclass("java.lang.Object"),
        );
        table.add_class(
            "com.acme.util.Strings",
            ClassRecord::new("WEB-INF/lib/util.jar")
                .with_superclass("java.lang.Object")
                .with_modifiers(0x0011),
        );
        table
    }

    pub(crate) fn targets() -> TargetsTable {
        let mut table = TargetsTable::new();
        table.add("javax.annotation.Generated", Target::package("com.acme.util"));
        table.add(
            "javax.servlet.annotation.WebServlet",
            Target::class("com.acme.web.OrderServlet"),
        );
        table.add("javax.inject.Inject", Target::field("com.acme.web.OrderServlet", "handler"));
        table.add(
            "javax.inject.Inject",
            Target::method("com.acme.web.OrderServlet", "setStrings(Lcom/acme/util/Strings;)V"),
        );
        table.add("javax.inject.Inject", Target::field("com.acme.web.BaseServlet", "log"));
        table
    }

    pub(crate) fn details() -> DetailsTable {
        let mut table = DetailsTable::new();
        table.add(
            Target::class("com.acme.web.OrderServlet"),
            "javax.servlet.annotation.WebServlet",
            b"urlPatterns=/orders".to_vec(),
        );
        table.add(
            Target::field("com.acme.web.OrderServlet", "handler"),
            "javax.inject.Inject",
            Vec::new(),
        );
        table.add(
            Target::method("com.acme.web.OrderServlet", "setStrings(Lcom/acme/util/Strings;)V"),
            "javax.inject.Inject",
            vec![0x00, 0xFF, 0x0A, 0x3D],
        );
        table
    }

    pub(crate) fn containers() -> ContainersTable {
        let mut table = ContainersTable::new();
        table.push("WEB-INF/classes", ScanPolicy::Seed);
        table.push("WEB-INF/lib/api.jar", ScanPolicy::Partial);
        table.push("WEB-INF/lib/util.jar", ScanPolicy::Excluded);
        table.push("rt.jar", ScanPolicy::External);
        table
    }

    pub(crate) fn references() -> ReferencesTable {
        ["java.lang.Object", "javax.servlet.http.HttpServlet", "java.io.Serializable"]
            .into_iter()
            .collect()
    }

    pub(crate) fn stamp() -> StampTable {
        StampTable {
            name: "WEB-INF/classes".to_string(),
            stamp: Stamp::new("meta:4096:1700000000000000000"),
        }
    }

    pub(crate) fn all_tables() -> Vec<Table> {
        vec![
            Table::Stamp(stamp()),
            Table::Classes(classes()),
            Table::Targets(targets()),
            Table::Details(details()),
            Table::Containers(containers()),
            Table::Resolved(references()),
            Table::Unresolved(["com.acme.missing.Gone"].into_iter().collect()),
        ]
    }
}
