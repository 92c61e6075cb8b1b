use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Prefix shared by every recognised property key.
pub const PROPERTY_PREFIX: &str = "anno.cache.";

pub const DISABLED_KEY: &str = "anno.cache.disabled";
pub const DIR_KEY: &str = "anno.cache.dir";
pub const READ_ONLY_KEY: &str = "anno.cache.readOnly";
pub const ALWAYS_VALID_KEY: &str = "anno.cache.alwaysValid";
pub const WRITE_THREADS_KEY: &str = "anno.cache.writeThreads";
pub const WRITE_LIMIT_KEY: &str = "anno.cache.writeLimit";
pub const JANDEX_FORMAT_KEY: &str = "anno.cache.jandexFormat";
pub const BINARY_FORMAT_KEY: &str = "anno.cache.binaryFormat";
pub const LOG_QUERIES_KEY: &str = "anno.cache.logQueries";

pub const DEFAULT_DIR: &str = "./anno";
pub const DEFAULT_WRITE_THREADS: i32 = 1;
pub const MAX_WRITE_THREADS: i32 = 64;
/// Sentinel for "one writer per submission".
pub const UNBOUNDED_WRITE_THREADS: i32 = -1;
pub const DEFAULT_WRITE_LIMIT: i32 = 16;

/// On-disk representation selected once per store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Binary,
    Text,
    /// Binary records, with annotation targets stored under the `jandex.idx` leaf.
    Jandex,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Binary => "binary",
            Format::Text => "text",
            Format::Jandex => "jandex",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated size of the write-back pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteThreads {
    Bounded(usize),
    Unbounded,
}

/// Options controlling the annotation cache.
///
/// Built once at startup and handed to [`crate::CacheStore`]; nothing reads options from
/// ambient process state after that.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CacheOptions {
    /// Disk cache off: every read misses and nothing is written.
    pub disabled: bool,
    /// Root of the cache tree.
    pub dir: PathBuf,
    /// Reads are served but writes are silently dropped.
    pub read_only: bool,
    /// Trust any stored stamp without recomputing the container's current stamp.
    pub always_valid: bool,
    /// `1` for a single background writer, `N` for a bounded pool, `-1` for unbounded.
    pub write_threads: i32,
    /// Minimum class count below which annotation details are not persisted.
    pub write_limit: i32,
    #[serde(alias = "jandexFormat")]
    pub use_jandex_format: bool,
    #[serde(alias = "binaryFormat")]
    pub use_binary_format: bool,
    pub log_queries: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            disabled: false,
            dir: PathBuf::from(DEFAULT_DIR),
            read_only: false,
            always_valid: false,
            write_threads: DEFAULT_WRITE_THREADS,
            write_limit: DEFAULT_WRITE_LIMIT,
            use_jandex_format: false,
            use_binary_format: true,
            log_queries: false,
        }
    }
}

impl CacheOptions {
    /// Build options from `anno.cache.*` property pairs.
    ///
    /// Keys outside the prefix are ignored. Unknown keys inside the prefix are logged and
    /// ignored so that newer configuration does not break older servers.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in properties {
            options.apply_property(key.as_ref(), value.as_ref())?;
        }
        options.validate()?;
        Ok(options)
    }

    /// Build options from the process environment.
    ///
    /// Each property key is looked up upper-cased with `.` replaced by `_`, e.g.
    /// `anno.cache.writeThreads` is read from `ANNO_CACHE_WRITETHREADS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pairs = ALL_KEYS.iter().filter_map(|key| {
            std::env::var(env_var_name(key))
                .ok()
                .map(|value| (key.to_string(), value))
        });
        Self::from_properties(pairs)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: Self =
            toml::from_str(text).map_err(|err| ConfigError::Toml(err.message().to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.checked_write_threads()?;
        if self.write_limit < 0 {
            return Err(ConfigError::NegativeWriteLimit {
                key: WRITE_LIMIT_KEY.to_string(),
                value: i64::from(self.write_limit),
            });
        }
        Ok(())
    }

    /// The codec selected by the format flags. Jandex wins over binary, binary over text.
    pub fn format(&self) -> Format {
        if self.use_jandex_format {
            Format::Jandex
        } else if self.use_binary_format {
            Format::Binary
        } else {
            Format::Text
        }
    }

    pub fn write_threads(&self) -> WriteThreads {
        self.checked_write_threads()
            .unwrap_or(WriteThreads::Bounded(DEFAULT_WRITE_THREADS as usize))
    }

    pub fn write_limit(&self) -> usize {
        usize::try_from(self.write_limit).unwrap_or(0)
    }

    fn checked_write_threads(&self) -> Result<WriteThreads, ConfigError> {
        match self.write_threads {
            UNBOUNDED_WRITE_THREADS => Ok(WriteThreads::Unbounded),
            n if (1..=MAX_WRITE_THREADS).contains(&n) => Ok(WriteThreads::Bounded(n as usize)),
            n => Err(ConfigError::WriteThreadsOutOfRange {
                key: WRITE_THREADS_KEY.to_string(),
                value: i64::from(n),
                max: i64::from(MAX_WRITE_THREADS),
            }),
        }
    }

    fn apply_property(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let Some(name) = key.strip_prefix(PROPERTY_PREFIX) else {
            return Ok(());
        };
        match name {
            "disabled" => self.disabled = parse_bool(key, value)?,
            "dir" => self.dir = PathBuf::from(value.trim()),
            "readOnly" => self.read_only = parse_bool(key, value)?,
            "alwaysValid" => self.always_valid = parse_bool(key, value)?,
            "writeThreads" => self.write_threads = parse_int(key, value)?,
            "writeLimit" => self.write_limit = parse_int(key, value)?,
            "jandexFormat" => self.use_jandex_format = parse_bool(key, value)?,
            "binaryFormat" => self.use_binary_format = parse_bool(key, value)?,
            "logQueries" => self.log_queries = parse_bool(key, value)?,
            _ => {
                tracing::warn!(
                    target = "anno.cache",
                    key,
                    "ignoring unknown annotation cache option"
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Disabled:      [ {} ]", self.disabled)?;
        writeln!(f, "Directory:     [ {} ]", self.dir.display())?;
        writeln!(f, "Read-Only:     [ {} ]", self.read_only)?;
        writeln!(f, "Always Valid:  [ {} ]", self.always_valid)?;
        writeln!(f, "Write Threads: [ {} ]", self.write_threads)?;
        writeln!(f, "Write Limit:   [ {} ]", self.write_limit)?;
        writeln!(f, "Format:        [ {} ]", self.format())?;
        write!(f, "Log Queries:   [ {} ]", self.log_queries)
    }
}

const ALL_KEYS: [&str; 9] = [
    DISABLED_KEY,
    DIR_KEY,
    READ_ONLY_KEY,
    ALWAYS_VALID_KEY,
    WRITE_THREADS_KEY,
    WRITE_LIMIT_KEY,
    JANDEX_FORMAT_KEY,
    BINARY_FORMAT_KEY,
    LOG_QUERIES_KEY,
];

/// Environment variable consulted for a property key.
pub fn env_var_name(key: &str) -> String {
    key.to_ascii_uppercase().replace('.', "_")
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int(key: &str, value: &str) -> Result<i32, ConfigError> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
}
