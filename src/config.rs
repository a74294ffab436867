/// Cache configuration.
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::shm::layout;

/// Default lease protecting a just-accessed entry from eviction.
pub const DEFAULT_ENTRY_LOCK_EXPIRATION: Duration = Duration::from_secs(5);

/// Default lease protecting a recently used cache from a crash reset.
pub const DEFAULT_CACHE_LOCK_EXPIRATION: Duration = Duration::from_secs(5);

/// Entry records kept free between the entries and buffers regions.
pub const DEFAULT_ENTRIES_MARGIN: u32 = 1024;

/// Settings for one shared buffer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Arena name; also the backing file name.
    pub name: String,
    /// Total arena size in bytes.
    pub size: usize,
    /// Informational expiration hint, recorded in the header.
    pub expiration: Duration,
    pub entry_lock_expiration: Duration,
    pub cache_lock_expiration: Duration,
    /// Entry records reserved ahead of the buffers region.
    pub entries_margin: u32,
    /// Directory for the backing file. `None` picks the platform default.
    pub dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        CacheConfig {
            name: name.into(),
            size,
            expiration: Duration::ZERO,
            entry_lock_expiration: DEFAULT_ENTRY_LOCK_EXPIRATION,
            cache_lock_expiration: DEFAULT_CACHE_LOCK_EXPIRATION,
            entries_margin: DEFAULT_ENTRIES_MARGIN,
            dir: None,
        }
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_entry_lock_expiration(mut self, expiration: Duration) -> Self {
        self.entry_lock_expiration = expiration;
        self
    }

    pub fn with_cache_lock_expiration(mut self, expiration: Duration) -> Self {
        self.cache_lock_expiration = expiration;
        self
    }

    pub fn with_entries_margin(mut self, margin: u32) -> Self {
        self.entries_margin = margin;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Parse a zone directive of the form `<name> <size>`.
    ///
    /// `off` disables the cache and yields `None`.
    pub fn from_directive(directive: &str) -> Result<Option<Self>> {
        let mut args = directive.split_whitespace();
        let name = args
            .next()
            .ok_or_else(|| Error::InvalidConfig("empty cache directive".into()))?;
        if name == "off" {
            return Ok(None);
        }
        let size = args
            .next()
            .ok_or_else(|| Error::InvalidConfig(format!("size not specified for \"{name}\"")))?;
        if let Some(extra) = args.next() {
            return Err(Error::InvalidConfig(format!(
                "unexpected argument \"{extra}\" for \"{name}\""
            )));
        }
        let size = parse_size(size)?;
        let config = CacheConfig::new(name, size);
        config.validate()?;
        Ok(Some(config))
    }

    /// Smallest arena that can hold the header, the entries margin and one value.
    pub fn minimum_size(&self) -> usize {
        layout::entries_offset()
            + (self.entries_margin as usize + 1) * layout::ENTRY_SIZE
            + 2 * layout::BUFFER_ALIGNMENT
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("cache name is empty".into()));
        }
        if self.name.contains('/') || self.name.contains('\0') {
            return Err(Error::InvalidConfig(format!(
                "cache name \"{}\" contains a path separator",
                self.name
            )));
        }
        if self.entry_lock_expiration.as_secs() == 0 {
            return Err(Error::InvalidConfig(
                "entry lock expiration must be at least one second".into(),
            ));
        }
        if self.cache_lock_expiration.as_secs() == 0 {
            return Err(Error::InvalidConfig(
                "cache lock expiration must be at least one second".into(),
            ));
        }
        let minimum = self.minimum_size();
        if self.size < minimum {
            return Err(Error::ArenaTooSmall {
                size: self.size,
                minimum,
            });
        }
        Ok(())
    }
}

/// Parse a size such as `1024`, `512k`, `64m` or `1G`.
pub fn parse_size(text: &str) -> Result<usize> {
    let invalid = || Error::InvalidConfig(format!("invalid size \"{text}\""));
    let text = text.trim();
    let (digits, scale) = match text.as_bytes().last() {
        Some(b'k' | b'K') => (&text[..text.len() - 1], 1usize << 10),
        Some(b'm' | b'M') => (&text[..text.len() - 1], 1 << 20),
        Some(b'g' | b'G') => (&text[..text.len() - 1], 1 << 30),
        Some(_) => (text, 1),
        None => return Err(invalid()),
    };
    let value: usize = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(scale).ok_or_else(invalid)
}
