//! Message headers and the well-known header names used on the wire.
//!
//! Headers travel with every envelope, inbound and outbound. The map is
//! ordered (insertion order is preserved on the wire), case-insensitive on
//! lookup, and multi-valued: appending the same name twice keeps both values.
//!
//! # Example
//!
//! ```
//! use silverback_core::headers::{HeaderMap, names};
//!
//! let mut headers = HeaderMap::new();
//! headers.set(names::MESSAGE_TYPE, "OrderPlaced");
//! headers.set_u32(names::CHUNK_INDEX, 2);
//!
//! assert_eq!(headers.get("X-Message-Type"), Some("OrderPlaced"));
//! assert_eq!(headers.get_u32(names::CHUNK_INDEX).unwrap(), Some(2));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known header names.
///
/// All of these are optional on the wire except [`MESSAGE_TYPE`][names::MESSAGE_TYPE]
/// when polymorphic dispatch is needed.
pub mod names {
    /// Fully-qualified name of the serialized message type.
    pub const MESSAGE_TYPE: &str = "x-message-type";

    /// Stable identifier shared by every fragment of a chunked message, and
    /// more generally the sequence identifier of an envelope.
    pub const MESSAGE_ID: &str = "x-message-id";

    /// 0-based index of a chunk within its group.
    pub const CHUNK_INDEX: &str = "x-chunk-index";

    /// Total number of chunks in the group, when known.
    pub const CHUNKS_COUNT: &str = "x-chunks-count";

    /// `"true"` on the terminal chunk of a group.
    pub const LAST_CHUNK: &str = "x-last-chunk";

    /// Broker offset of chunk index 0, stamped on later fragments as a
    /// reassembly hint.
    pub const FIRST_CHUNK_OFFSET: &str = "x-first-chunk-offset";

    /// Identifier of the key that encrypted the payload.
    pub const ENCRYPTION_KEY_ID: &str = "x-encryption-key-id";

    /// Number of failed processing attempts so far; survives consumer
    /// restarts because it rides on the message itself.
    pub const FAILED_ATTEMPTS: &str = "x-failed-attempts";

    /// Partitioning key of the record, persisted with outbox rows and
    /// restored by the relay worker.
    pub const RECORD_KEY: &str = "x-record-key";

    /// Endpoint an envelope was moved from by a move error policy.
    pub const SOURCE_ENDPOINT: &str = "x-source-endpoint";

    /// Failure reason recorded by a move error policy.
    pub const FAILURE_REASON: &str = "x-failure-reason";
}

/// Error raised when a header value cannot be parsed as the requested type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("header '{name}' has invalid value '{value}': expected {expected}")]
pub struct HeaderValueError {
    /// The offending header name.
    pub name: String,
    /// The raw value found.
    pub value: String,
    /// Description of the expected format.
    pub expected: &'static str,
}

/// An ordered, case-insensitive, multi-valued mapping from header name to
/// string value.
///
/// Lookup ignores ASCII case; storage preserves the name as first written and
/// the insertion order of all entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of entries, counting repeated names once per value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value.
    ///
    /// The new entry takes the position of the first replaced entry, or the
    /// end of the map when the name was absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let first = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name));
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        match first {
            Some(index) => self.entries.insert(index, (name, value.into())),
            None => self.entries.push((name, value.into())),
        }
    }

    /// First value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` when at least one value exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Iterate over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Set an integer-valued header.
    pub fn set_u32(&mut self, name: &str, value: u32) {
        self.set(name, value.to_string());
    }

    /// Set a 64-bit integer-valued header.
    pub fn set_i64(&mut self, name: &str, value: i64) {
        self.set(name, value.to_string());
    }

    /// Set a boolean flag header (stored as `"true"` / `"false"`).
    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.set(name, if value { "true" } else { "false" });
    }

    /// Read an integer-valued header.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderValueError`] when the value is present but not a
    /// non-negative integer.
    pub fn get_u32(&self, name: &str) -> Result<Option<u32>, HeaderValueError> {
        self.get(name)
            .map(|raw| {
                raw.trim().parse().map_err(|_| HeaderValueError {
                    name: name.to_string(),
                    value: raw.to_string(),
                    expected: "a non-negative integer",
                })
            })
            .transpose()
    }

    /// Read a 64-bit integer-valued header.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderValueError`] when the value is present but not an
    /// integer.
    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, HeaderValueError> {
        self.get(name)
            .map(|raw| {
                raw.trim().parse().map_err(|_| HeaderValueError {
                    name: name.to_string(),
                    value: raw.to_string(),
                    expected: "an integer",
                })
            })
            .transpose()
    }

    /// Read a boolean flag header. Absent headers read as `false`.
    #[must_use]
    pub fn get_flag(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    /// Serialize the map to compact bytes for storage (outbox rows).
    ///
    /// # Errors
    ///
    /// Returns the bincode error message when serialization fails, which does
    /// not happen for string data in practice.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&self.entries).map_err(|e| e.to_string())
    }

    /// Deserialize a map previously written by [`HeaderMap::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns the bincode error message when the bytes are not a valid
    /// serialized header map.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let entries = bincode::deserialize(bytes).map_err(|e| e.to_string())?;
        Ok(Self { entries })
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
