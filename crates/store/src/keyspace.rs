//! Logical-to-physical key mapping.
//!
//! Every logical key handed to a [`StoreClient`](crate::StoreClient) is
//! namespaced by a prefix and, when hashing is enabled, replaced by the
//! lowercase hex SHA-256 digest of the logical key. Hashing keeps raw API
//! tokens out of key names, so `KEYS` output or a memory dump does not leak
//! credentials.
//!
//! ```
//! use tollgate_store::KeySpace;
//!
//! let plain = KeySpace::new("apikey-", false);
//! assert_eq!(plain.fix_key("1234"), "apikey-1234");
//! assert_eq!(plain.clean_key("apikey-1234"), "1234");
//!
//! let hashed = KeySpace::new("apikey-", true);
//! assert_eq!(hashed.fix_key("1234").len(), "apikey-".len() + 64);
//! ```

use sha2::{Digest, Sha256};

/// Prefix for API session records.
pub const SESSION_PREFIX: &str = "apikey-";

/// Prefix for API health counters.
pub const HEALTH_PREFIX: &str = "apihealth.";

/// Prefix for organisation records.
pub const ORG_PREFIX: &str = "orgKey.";

/// Prefix for shared quota counters.
pub const QUOTA_PREFIX: &str = "quota-";

/// Prefix for sliding-window rate-limit sets.
pub const RATE_LIMIT_PREFIX: &str = "rate-limit-";

/// A key namespace: a prefix plus an optional hashing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    hash_keys: bool,
}

impl KeySpace {
    /// Creates a key space with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, hash_keys: bool) -> Self {
        Self { prefix: prefix.into(), hash_keys }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether logical keys are hashed before storage.
    #[must_use]
    pub fn hashes_keys(&self) -> bool {
        self.hash_keys
    }

    /// Hashes `key` if hashing is enabled, otherwise returns it unchanged.
    #[must_use]
    pub fn hash_key(&self, key: &str) -> String {
        if self.hash_keys { sha256_hex(key) } else { key.to_owned() }
    }

    /// Maps a logical key to its physical key.
    #[must_use]
    pub fn fix_key(&self, key: &str) -> String {
        let mut physical = String::with_capacity(self.prefix.len() + 64);
        physical.push_str(&self.prefix);
        physical.push_str(&self.hash_key(key));
        physical
    }

    /// Strips the prefix from a physical key.
    ///
    /// Only the first occurrence is removed. A key without the prefix is
    /// returned unchanged. When hashing is enabled the result is the hash,
    /// not the original logical key.
    #[must_use]
    pub fn clean_key(&self, physical: &str) -> String {
        if self.prefix.is_empty() {
            return physical.to_owned();
        }
        physical.replacen(&self.prefix, "", 1)
    }

    /// The `KEYS` pattern matching every logical key starting with `filter`.
    ///
    /// An empty filter selects the whole namespace. A non-empty filter is
    /// mapped through [`fix_key`](Self::fix_key), so with hashing enabled it
    /// only matches the exact logical key.
    ///
    /// The filter is a literal prefix: glob metacharacters in it are escaped,
    /// so `tyk.keys.*` matches keys starting with that exact text rather than
    /// acting as a wildcard.
    #[must_use]
    pub fn pattern(&self, filter: &str) -> String {
        let base = if filter.is_empty() { self.prefix.clone() } else { self.fix_key(filter) };
        format!("{}*", escape_glob(&base))
    }
}

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Escapes glob metacharacters so a prefix is matched literally by `KEYS`.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
