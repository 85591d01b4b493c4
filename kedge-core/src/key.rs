//! Cache key types.
//!
//! Entries are addressed by a two-level `(table, key)` pair; the provider
//! id that completes the three-level address space lives in the registry
//! layer of `kedge-backend`.

use std::fmt;

/// Table used when a request does not name one.
pub const DEFAULT_TABLE: &str = "Cached";

/// Address of a cached entry within one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    table: String,
    key: String,
}

impl CacheKey {
    /// Key in an explicit table.
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        CacheKey {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Key in the [`DEFAULT_TABLE`].
    pub fn in_default_table(key: impl Into<String>) -> Self {
        Self::new(DEFAULT_TABLE, key)
    }

    /// The table component.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The key component.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}
