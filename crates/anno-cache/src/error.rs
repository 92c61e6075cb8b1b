pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache management and persistence.
///
/// Read paths never surface these to the scanner: `CacheStore::try_read` folds every failure
/// into a cache miss. They are returned from the lower-level codec, option and layout APIs.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("{table} tables are never persisted for the external policy")]
    ExternalNotPersisted { table: &'static str },

    #[error("stamp for {dir} withheld after a failed table write")]
    StampWithheld { dir: String },
}

/// Malformed, truncated or incompatible on-disk data.
///
/// Always recovered locally: the entry is treated as absent and the container is rescanned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("truncated input: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic bytes at offset {offset}: expected {expected:02X?}, found {found:02X?}")]
    BadMagic {
        offset: usize,
        expected: [u8; 4],
        found: Vec<u8>,
    },

    #[error("unknown region marker 0x{found:02X} at offset {offset} (expected 0x{expected:02X})")]
    UnknownRegion {
        offset: usize,
        expected: u8,
        found: u8,
    },

    #[error("unexpected record tag 0x{tag:02X} at offset {offset} for table {table}")]
    UnexpectedTag {
        offset: usize,
        tag: u8,
        table: &'static str,
    },

    #[error("string index {index} out of bounds (string table has {len} entries)")]
    StringIndexOutOfBounds { index: u32, len: usize },

    #[error("unsupported table {table:?} version {version:?}")]
    UnsupportedVersion { table: String, version: String },

    #[error("table {found:?} does not match the expected table {expected:?}")]
    WrongTable { expected: &'static str, found: String },

    #[error("unsupported encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("header field {field} is {len} bytes, which does not fit a {width}-byte slot")]
    HeaderValueTooLong {
        field: &'static str,
        len: usize,
        width: usize,
    },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after the end marker")]
    TrailingBytes(usize),

    #[error("trailer count mismatch for {what}: trailer says {expected}, found {found}")]
    CountMismatch {
        what: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("{table} table is missing a {record} record")]
    MissingRecord {
        table: &'static str,
        record: &'static str,
    },

    #[error("unknown scan policy code {0}")]
    UnknownPolicy(u8),

    #[error("line {line}: {message}")]
    MalformedLine { line: usize, message: String },

    #[error("missing end delimiter")]
    MissingEndDelimiter,

    #[error("{field} value {value:?} does not fit on one text line")]
    MultiLineValue { field: &'static str, value: String },
}

/// Invalid operator-supplied configuration; surfaced at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: write threads must be -1 (unbounded) or between 1 and {max}, got {value}")]
    WriteThreadsOutOfRange { key: String, value: i64, max: i64 },

    #[error("{key}: write limit must not be negative, got {value}")]
    NegativeWriteLimit { key: String, value: i64 },

    #[error("{key}: expected a boolean, got {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("{key}: expected an integer, got {value:?}")]
    InvalidInt { key: String, value: String },

    #[error("failed to read options file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse toml options: {0}")]
    Toml(String),
}
