//! The in-memory entity store.
//!
//! An [`EntityStore`] is one generation of the metadata feed: a map from
//! document ID to raw entity. It is built from scratch on every reload and
//! never mutated afterwards; readers hold it behind an `Arc` while the next
//! generation is being loaded.
//!
//! Loading streams the source: entities are parsed and keyed one at a time
//! so the feed is never held as a single JSON tree. The load is
//! all-or-nothing. One malformed entity fails the whole generation.

use anyhow::{Context, Result};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::models::{sha1_id, RawEntity};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntityStore {
    entities: HashMap<String, RawEntity>,
}

impl EntityStore {
    /// Loads a generation from the JSON feed at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open metadata source: {}", path.display()))?;
        let store = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse metadata source: {}", path.display()))?;
        info!(path = %path.display(), entities = store.len(), "loaded metadata");
        Ok(store)
    }

    /// Parses a feed from any reader.
    ///
    /// The feed is a top-level JSON array of entity objects, or a top-level
    /// object whose values are entity objects. Entities sharing an
    /// `entityID` collapse to the last one read.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut entities = HashMap::new();
        let mut deserializer = serde_json::Deserializer::from_reader(reader);
        deserializer.deserialize_any(FeedVisitor {
            entities: &mut entities,
        })?;
        deserializer.end()?;
        Ok(Self { entities })
    }

    pub fn get(&self, id: &str) -> Option<&RawEntity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RawEntity)> {
        self.entities.iter()
    }
}

/// Keys a single entity by the SHA-1 of its `entityID` and injects `id`.
fn ingest(
    entities: &mut HashMap<String, RawEntity>,
    position: usize,
    value: Value,
) -> std::result::Result<(), String> {
    let mut entity = match value {
        Value::Object(map) => map,
        other => {
            return Err(format!(
                "entry {} is not an object (found {})",
                position,
                kind_of(&other)
            ))
        }
    };

    let id = match entity.get("entityID") {
        Some(Value::String(entity_id)) => sha1_id(entity_id),
        Some(other) => {
            return Err(format!(
                "entry {}: entityID must be a string (found {})",
                position,
                kind_of(other)
            ))
        }
        None => return Err(format!("entry {}: missing entityID", position)),
    };

    entity.insert("id".to_string(), Value::String(id.clone()));
    entities.insert(id, entity);
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct FeedVisitor<'a> {
    entities: &'a mut HashMap<String, RawEntity>,
}

impl<'de> Visitor<'de> for FeedVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an array or object of entity objects")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut position = 0;
        while let Some(value) = seq.next_element::<Value>()? {
            ingest(self.entities, position, value).map_err(de::Error::custom)?;
            position += 1;
        }
        Ok(())
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut position = 0;
        while let Some((_key, value)) = map.next_entry::<String, Value>()? {
            ingest(self.entities, position, value).map_err(de::Error::custom)?;
            position += 1;
        }
        Ok(())
    }
}
