//! Typed configuration: a fixed set of fields instead of a dynamic
//! key/value list, so an unrecognized option is a compile error rather
//! than a silently-ignored runtime one. Flag bitsets use `bitflags` for
//! POSIX-style flag sets.

use bitflags::bitflags;

bitflags! {
    /// Environment-level flags (`create`/`open`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        const IN_MEMORY          = 0b0000_0001;
        const READ_ONLY          = 0b0000_0010;
        const ENABLE_RECOVERY    = 0b0000_0100;
        const ENABLE_TRANSACTIONS = 0b0000_1000;
        const ENABLE_FSYNC       = 0b0001_0000;
        const CACHE_STRICT       = 0b0010_0000;
        const AUTO_RECOVERY      = 0b0100_0000;
        const AUTO_CLEANUP       = 0b1000_0000;
        const DONT_CLEAR_LOG     = 0b0001_0000_0000;
    }
}

bitflags! {
    /// Per-database flags (`create_db`/`open_db`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        const RECORD_NUMBER      = 0b0000_0001;
        const ENABLE_DUPLICATES  = 0b0000_0010;
        const DISABLE_VAR_KEYLEN = 0b0000_0100;
        const ENABLE_EXTENDED_KEYS = 0b0000_1000;
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_DATABASES: u16 = 16;
pub const DEFAULT_CHUNK_SIZE: u64 = 64;

#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub page_size: u32,
    pub cache_size: u64,
    pub max_databases: u16,
    pub filemode: u32,
    pub flags: EnvFlags,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            filemode: 0o644,
            flags: EnvFlags::empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenConfig {
    pub cache_size: u64,
    pub flags: EnvFlags,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            flags: EnvFlags::empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub key_size: u16,
    pub flags: DbFlags,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            key_size: 0,
            flags: DbFlags::empty(),
        }
    }
}

impl DbConfig {
    pub fn record_number(&self) -> bool {
        self.flags.contains(DbFlags::RECORD_NUMBER)
    }

    /// `record_number` requires an 8-byte key, per the parameter table's
    /// "combinations invalid for the operation" rule.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.record_number() && self.key_size != 0 && self.key_size != 8 {
            return Err(crate::error::Error::InvalidParameter(
                "record_number requires an 8-byte keysize",
            ));
        }
        Ok(())
    }
}

/// Snapshot returned by `Environment::get_parameters()`: the subset of
/// `CreateConfig`/`OpenConfig` still meaningful once the environment is
/// open.
#[derive(Debug, Clone, Copy)]
pub struct EnvParameters {
    pub page_size: u32,
    pub max_databases: u16,
    pub cache_size: u64,
    pub flags: EnvFlags,
}
