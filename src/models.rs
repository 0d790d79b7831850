//! Core data models for entity records.
//!
//! A raw entity is the JSON object exactly as it appeared in the metadata
//! feed, plus the injected `id`. An [`EntityDocument`] is the projection of
//! that object that gets indexed; it is rebuilt on every indexing pass and
//! never stored back into the raw record.

use anyhow::{bail, Result};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// A raw entity object from the metadata feed, with `id` injected.
pub type RawEntity = Map<String, Value>;

/// Source fields concatenated into the derived `content` blob, in order.
pub const CONTENT_FIELDS: [&str; 4] = ["title", "scope", "keywords", "domain"];

/// Stable document ID for an entity: hex SHA-1 of its `entityID`.
pub fn sha1_id(entity_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(entity_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// The indexed projection of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDocument {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub title: String,
    pub content: String,
}

impl EntityDocument {
    /// Projects a raw entity into its indexed form.
    ///
    /// `type` and `title` may be absent (they index as empty strings) but
    /// must be strings when present. An empty `entityID` is a valid
    /// identifier like any other.
    pub fn from_raw(raw: &RawEntity) -> Result<Self> {
        Ok(Self {
            id: string_field(raw, "id")?.unwrap_or_default(),
            entity_id: string_field(raw, "entityID")?.unwrap_or_default(),
            entity_type: string_field(raw, "type")?.unwrap_or_default(),
            title: string_field(raw, "title")?.unwrap_or_default(),
            content: derive_content(raw),
        })
    }
}

fn string_field(raw: &RawEntity, key: &str) -> Result<Option<String>> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => bail!("field '{}' must be a string, got {}", key, other),
    }
}

/// Builds the full-text blob for an entity from [`CONTENT_FIELDS`].
///
/// Each present field contributes its text followed by a space; commas,
/// periods and plus signs become spaces so that `example.org` indexes as
/// `example org`.
pub fn derive_content(raw: &RawEntity) -> String {
    let mut content = String::new();
    for key in CONTENT_FIELDS {
        if let Some(value) = raw.get(key) {
            flatten_into(value, &mut content);
            content.push(' ');
        }
    }
    content.replace([',', '.', '+'], " ")
}

fn flatten_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                flatten_into(item, out);
            }
        }
        other => out.push_str(&other.to_string()),
    }
}
