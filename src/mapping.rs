//! Key-prefix → collection mappings and prefix routing.
//!
//! A [`Mapping`] ties cache keys under `key_prefix` to documents in
//! `collection`, identified by `primary_key_field`. The primary-key value is
//! whatever follows the prefix in the cache key.
//!
//! # Example
//!
//! ```
//! use cache_sync::{Mapping, MappingTable};
//!
//! let table = MappingTable::new(vec![
//!     Mapping::new("UserEntity:", "users", "userID"),
//!     Mapping::new("TransactionEntity:", "transactions", "transactionID"),
//! ]).unwrap();
//!
//! let (_, mapping) = table.route("UserEntity:u1").unwrap();
//! assert_eq!(mapping.collection, "users");
//! assert_eq!(mapping.primary_key("UserEntity:u1"), Some("u1"));
//! assert!(table.route("Session:abc").is_none());
//! ```

use serde::Deserialize;
use std::sync::Arc;

use crate::config::ConfigError;

/// How cache writes under a mapping reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Queue cache writes and persist them asynchronously.
    #[default]
    Behind,
    /// Writes go through [`SyncEngine::write_through`](crate::SyncEngine::write_through);
    /// cache change events are not queued.
    Through,
    /// Cache writes are never mirrored to the store.
    Disabled,
}

/// One key-prefix → collection binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mapping {
    pub key_prefix: String,
    pub collection: String,
    pub primary_key_field: String,
    /// Fill the cache from the store on misses.
    #[serde(default = "default_read_through")]
    pub read_through: bool,
    #[serde(default)]
    pub write_mode: WriteMode,
}

fn default_read_through() -> bool { true }

impl Mapping {
    /// Read-through + write-behind mapping.
    pub fn new(
        key_prefix: impl Into<String>,
        collection: impl Into<String>,
        primary_key_field: impl Into<String>,
    ) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            collection: collection.into(),
            primary_key_field: primary_key_field.into(),
            read_through: true,
            write_mode: WriteMode::Behind,
        }
    }

    #[must_use]
    pub fn with_read_through(mut self, enabled: bool) -> Self {
        self.read_through = enabled;
        self
    }

    #[must_use]
    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// Strip the prefix. `None` if the key is not under this mapping or the
    /// remainder is empty.
    #[must_use]
    pub fn primary_key<'a>(&self, cache_key: &'a str) -> Option<&'a str> {
        cache_key
            .strip_prefix(self.key_prefix.as_str())
            .filter(|pk| !pk.is_empty())
    }

    #[must_use]
    pub fn cache_key(&self, primary_key: &str) -> String {
        format!("{}{}", self.key_prefix, primary_key)
    }

    #[must_use]
    pub fn matches(&self, cache_key: &str) -> bool {
        cache_key.starts_with(self.key_prefix.as_str())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidMapping {
                prefix: self.key_prefix.clone(),
                reason: "key_prefix must not be empty".into(),
            });
        }
        if self.collection.is_empty() {
            return Err(ConfigError::InvalidMapping {
                prefix: self.key_prefix.clone(),
                reason: "collection must not be empty".into(),
            });
        }
        if self.primary_key_field.is_empty() {
            return Err(ConfigError::InvalidMapping {
                prefix: self.key_prefix.clone(),
                reason: "primary_key_field must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Validated, immutable set of mappings with longest-prefix routing.
#[derive(Debug, Clone)]
pub struct MappingTable {
    /// In configuration order (index = lane id).
    mappings: Vec<Arc<Mapping>>,
    /// Indices sorted by prefix length, longest first.
    by_length: Vec<usize>,
}

impl MappingTable {
    /// Validate and build. Rejects empty fields, duplicate prefixes and
    /// prefixes that are prefixes of one another.
    pub fn new(mappings: Vec<Mapping>) -> Result<Self, ConfigError> {
        if mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }
        for m in &mappings {
            m.validate()?;
        }
        for (i, a) in mappings.iter().enumerate() {
            for b in mappings.iter().skip(i + 1) {
                if a.key_prefix == b.key_prefix {
                    return Err(ConfigError::DuplicatePrefix(a.key_prefix.clone()));
                }
                if a.key_prefix.starts_with(&b.key_prefix) || b.key_prefix.starts_with(&a.key_prefix) {
                    return Err(ConfigError::AmbiguousPrefix {
                        first: a.key_prefix.clone(),
                        second: b.key_prefix.clone(),
                    });
                }
            }
        }

        let mut by_length: Vec<usize> = (0..mappings.len()).collect();
        by_length.sort_by_key(|&i| std::cmp::Reverse(mappings[i].key_prefix.len()));

        Ok(Self {
            mappings: mappings.into_iter().map(Arc::new).collect(),
            by_length,
        })
    }

    /// Longest-prefix match. Returns the mapping's index and the mapping.
    #[must_use]
    pub fn route(&self, cache_key: &str) -> Option<(usize, &Arc<Mapping>)> {
        self.by_length
            .iter()
            .map(|&i| (i, &self.mappings[i]))
            .find(|(_, m)| m.matches(cache_key))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Mapping>> {
        self.mappings.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mapping>> {
        self.mappings.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Longest prefix shared by every mapping; used as the cache subscription filter.
    #[must_use]
    pub fn common_prefix(&self) -> String {
        let mut iter = self.mappings.iter();
        let Some(first) = iter.next() else { return String::new() };
        let mut common: &str = &first.key_prefix;
        for m in iter {
            let shared = common
                .char_indices()
                .zip(m.key_prefix.chars())
                .take_while(|((_, a), b)| a == b)
                .last()
                .map_or(0, |((idx, c), _)| idx + c.len_utf8());
            common = &common[..shared];
        }
        common.to_string()
    }
}
