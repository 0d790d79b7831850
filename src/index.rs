//! The full-text index capability.
//!
//! [`SearchIndex`] is the narrow surface the rest of the crate consumes:
//! batch indexing, deletion, search and a document count.
//! [`EntityIndex`] satisfies it on top of tantivy, with the field layout and
//! analyzers from [`crate::analysis`].
//!
//! # Fields
//!
//! | Field | Indexing | Stored |
//! |-------|----------|--------|
//! | `id` | raw (exact) | yes |
//! | `entityID` | no | yes |
//! | `type` | raw (exact) | yes |
//! | `title` | standard analyzer | yes |
//! | `content` | edge n-gram analyzer | no |

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, RegexQuery, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::warn;

use crate::analysis::{register_analyzers, NGRAM_ANALYZER, STANDARD_ANALYZER};
use crate::models::EntityDocument;

/// File written next to the index once a rebuild has completed.
pub const READY_MARKER: &str = ".mdq-ready";

/// A queued set of documents applied to the index in one commit.
#[derive(Debug, Default)]
pub struct Batch {
    docs: Vec<EntityDocument>,
}

impl Batch {
    pub fn add(&mut self, doc: EntityDocument) {
        self.docs.push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// A query against the entity index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// Every document.
    MatchAll,
    /// Documents of exactly `entity_type` whose content has a term starting
    /// with `prefix`. Content terms starting with any of `optional` are not
    /// required but rank a document higher.
    ContentPrefix {
        prefix: String,
        optional: Vec<String>,
        entity_type: String,
    },
}

/// One search hit with its stored fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHit {
    pub id: String,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub title: Option<String>,
}

/// Full-text index operations needed by the synchronizer and the query
/// service.
///
/// Implementations must be safe to search from request handlers while a
/// reconcile pass deletes documents.
pub trait SearchIndex: Send + Sync {
    fn new_batch(&self) -> Batch {
        Batch::default()
    }

    /// Indexes every document in the batch, replacing documents that share
    /// an ID, and makes them visible to searches.
    fn apply_batch(&self, batch: Batch) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Deletes every listed document and makes the removal visible at once.
    fn delete_many(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete(id)?;
        }
        Ok(())
    }

    /// Returns at most `limit` hits, best first.
    fn search(&self, query: &IndexQuery, limit: usize) -> Result<Vec<IndexHit>>;

    fn doc_count(&self) -> Result<u64>;
}

#[derive(Clone, Copy)]
struct EntityFields {
    id: Field,
    entity_id: Field,
    entity_type: Field,
    title: Field,
    content: Field,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    let title_options = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(STANDARD_ANALYZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let content_options = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(NGRAM_ANALYZER)
            .set_index_option(IndexRecordOption::WithFreqs),
    );

    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("entityID", STORED);
    builder.add_text_field("type", STRING | STORED);
    builder.add_text_field("title", title_options);
    builder.add_text_field("content", content_options);
    builder.build()
}

/// The tantivy-backed entity index.
pub struct EntityIndex {
    fields: EntityFields,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
}

impl EntityIndex {
    /// Opens the index stored at `path`, creating an empty one if no
    /// usable index exists.
    ///
    /// An index only counts as usable once [`EntityIndex::mark_ready`] has
    /// been called for it, i.e. a rebuild finished. A directory holding an
    /// index without the marker is left over from a failed start; it is
    /// wiped and created again.
    ///
    /// # Arguments
    ///
    /// - `path`: index directory, created if missing.
    /// - `writer_heap_bytes`: memory budget of the index writer.
    ///
    /// # Returns
    ///
    /// The index, and whether a ready index was already there. A caller
    /// that gets `false` must rebuild before calling `mark_ready`.
    pub fn open(path: &Path, writer_heap_bytes: usize) -> Result<(Self, bool)> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create index directory: {}", path.display()))?;
        let directory = MmapDirectory::open(path)
            .with_context(|| format!("Failed to open index directory: {}", path.display()))?;

        let present = Index::exists(&directory)?;
        let ready = present && path.join(READY_MARKER).exists();
        let index = if ready {
            Index::open(directory)
                .with_context(|| format!("Failed to open index: {}", path.display()))?
        } else {
            let directory = if present {
                warn!(path = %path.display(), "discarding unfinished index");
                drop(directory);
                std::fs::remove_dir_all(path).with_context(|| {
                    format!("Failed to remove unfinished index: {}", path.display())
                })?;
                std::fs::create_dir_all(path).with_context(|| {
                    format!("Failed to create index directory: {}", path.display())
                })?;
                MmapDirectory::open(path).with_context(|| {
                    format!("Failed to open index directory: {}", path.display())
                })?
            } else {
                directory
            };
            Index::create(directory, build_schema(), Default::default())
                .with_context(|| format!("Failed to create index: {}", path.display()))?
        };

        Ok((Self::from_index(index, writer_heap_bytes)?, ready))
    }

    /// Records that the index at `path` holds a complete rebuild, so the
    /// next [`EntityIndex::open`] keeps it.
    pub fn mark_ready(path: &Path) -> Result<()> {
        std::fs::write(path.join(READY_MARKER), b"")
            .with_context(|| format!("Failed to mark index ready: {}", path.display()))
    }

    /// Creates an empty index that lives only in memory.
    pub fn create_in_ram(writer_heap_bytes: usize) -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()), writer_heap_bytes)
    }

    fn from_index(index: Index, writer_heap_bytes: usize) -> Result<Self> {
        register_analyzers(&index)?;

        let schema = index.schema();
        let fields = EntityFields {
            id: schema.get_field("id")?,
            entity_id: schema.get_field("entityID")?,
            entity_type: schema.get_field("type")?,
            title: schema.get_field("title")?,
            content: schema.get_field("content")?,
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index
            .writer(writer_heap_bytes)
            .context("Failed to create index writer")?;

        Ok(Self {
            fields,
            reader,
            writer: Mutex::new(writer),
        })
    }

    fn to_document(&self, doc: &EntityDocument) -> TantivyDocument {
        let mut out = TantivyDocument::default();
        out.add_text(self.fields.id, &doc.id);
        out.add_text(self.fields.entity_id, &doc.entity_id);
        out.add_text(self.fields.entity_type, &doc.entity_type);
        out.add_text(self.fields.title, &doc.title);
        out.add_text(self.fields.content, &doc.content);
        out
    }

    fn build_query(&self, query: &IndexQuery) -> Result<Box<dyn Query>> {
        Ok(match query {
            IndexQuery::MatchAll => Box::new(AllQuery),
            IndexQuery::ContentPrefix {
                prefix,
                optional,
                entity_type,
            } => {
                let mut clauses: Vec<(Occur, Box<dyn Query>)> =
                    vec![(Occur::Must, self.content_prefix_query(prefix)?)];
                for word in optional {
                    clauses.push((Occur::Should, self.content_prefix_query(word)?));
                }
                let entity_type = TermQuery::new(
                    Term::from_field_text(self.fields.entity_type, entity_type),
                    IndexRecordOption::Basic,
                );
                clauses.push((Occur::Must, Box::new(entity_type)));
                Box::new(BooleanQuery::new(clauses))
            }
        })
    }

    fn content_prefix_query(&self, prefix: &str) -> Result<Box<dyn Query>> {
        let pattern = format!("{}.*", regex::escape(prefix));
        let query = RegexQuery::from_pattern(&pattern, self.fields.content)
            .with_context(|| format!("invalid content prefix: {}", prefix))?;
        Ok(Box::new(query))
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit().context("Failed to commit index changes")?;
        self.reader.reload().context("Failed to reload index reader")?;
        Ok(())
    }
}

impl SearchIndex for EntityIndex {
    fn apply_batch(&self, batch: Batch) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("index writer lock poisoned"))?;
        for doc in &batch.docs {
            writer.delete_term(Term::from_field_text(self.fields.id, &doc.id));
            writer
                .add_document(self.to_document(doc))
                .with_context(|| format!("Failed to index document {}", doc.id))?;
        }
        self.commit(&mut writer)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("index writer lock poisoned"))?;
        writer.delete_term(Term::from_field_text(self.fields.id, id));
        self.commit(&mut writer)
    }

    fn delete_many(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("index writer lock poisoned"))?;
        for id in ids {
            writer.delete_term(Term::from_field_text(self.fields.id, id));
        }
        self.commit(&mut writer)
    }

    fn search(&self, query: &IndexQuery, limit: usize) -> Result<Vec<IndexHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = self.build_query(query)?;
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(query.as_ref(), &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
            };
            let Some(id) = text(self.fields.id) else {
                continue;
            };
            hits.push(IndexHit {
                id,
                entity_id: text(self.fields.entity_id),
                entity_type: text(self.fields.entity_type),
                title: text(self.fields.title),
            });
        }
        Ok(hits)
    }

    fn doc_count(&self) -> Result<u64> {
        Ok(self.reader.searcher().num_docs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_WRITER_HEAP_BYTES;

    fn doc(id: &str, entity_type: &str, title: &str, content: &str) -> EntityDocument {
        EntityDocument {
            id: id.to_string(),
            entity_id: format!("https://{}.example.org", id),
            entity_type: entity_type.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        }
    }

    fn populated() -> EntityIndex {
        let index = EntityIndex::create_in_ram(MIN_WRITER_HEAP_BYTES).unwrap();
        let mut batch = index.new_batch();
        batch.add(doc("a", "idp", "Example IdP", "Example IdP example org "));
        batch.add(doc("b", "sp", "Example SP", "Example SP example org "));
        batch.add(doc("c", "idp", "Other Place", "Other Place other net "));
        index.apply_batch(batch).unwrap();
        index
    }

    fn ids(hits: &[IndexHit]) -> Vec<String> {
        let mut ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_empty_index() {
        let index = EntityIndex::create_in_ram(MIN_WRITER_HEAP_BYTES).unwrap();
        assert_eq!(index.doc_count().unwrap(), 0);
        assert!(index.search(&IndexQuery::MatchAll, 10).unwrap().is_empty());
    }

    #[test]
    fn test_apply_batch_and_match_all() {
        let index = populated();
        assert_eq!(index.doc_count().unwrap(), 3);
        let hits = index.search(&IndexQuery::MatchAll, 3).unwrap();
        assert_eq!(ids(&hits), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stored_fields_returned() {
        let index = populated();
        let hits = index.search(&IndexQuery::MatchAll, 10).unwrap();
        let a = hits.iter().find(|h| h.id == "a").unwrap();
        assert_eq!(a.entity_id.as_deref(), Some("https://a.example.org"));
        assert_eq!(a.entity_type.as_deref(), Some("idp"));
        assert_eq!(a.title.as_deref(), Some("Example IdP"));
    }

    #[test]
    fn test_zero_limit() {
        let index = populated();
        assert!(index.search(&IndexQuery::MatchAll, 0).unwrap().is_empty());
    }

    #[test]
    fn test_content_prefix_restricted_to_type() {
        let index = populated();
        let query = IndexQuery::ContentPrefix {
            prefix: "exam".to_string(),
            optional: Vec::new(),
            entity_type: "idp".to_string(),
        };
        assert_eq!(ids(&index.search(&query, 10).unwrap()), vec!["a"]);
    }

    #[test]
    fn test_content_prefix_shorter_than_ngram_min() {
        let index = populated();
        let query = IndexQuery::ContentPrefix {
            prefix: "ot".to_string(),
            optional: Vec::new(),
            entity_type: "idp".to_string(),
        };
        assert_eq!(ids(&index.search(&query, 10).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_content_prefix_escapes_regex() {
        let index = populated();
        let query = IndexQuery::ContentPrefix {
            prefix: "ex(".to_string(),
            optional: Vec::new(),
            entity_type: "idp".to_string(),
        };
        assert!(index.search(&query, 10).unwrap().is_empty());
    }

    #[test]
    fn test_content_prefix_optional_words_do_not_filter() {
        let index = populated();
        let query = IndexQuery::ContentPrefix {
            prefix: "other".to_string(),
            optional: vec!["nomatch".to_string(), "exam".to_string()],
            entity_type: "idp".to_string(),
        };
        assert_eq!(ids(&index.search(&query, 10).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_type_is_exact_match() {
        let index = populated();
        let query = IndexQuery::ContentPrefix {
            prefix: "exam".to_string(),
            optional: Vec::new(),
            entity_type: "IDP".to_string(),
        };
        assert!(index.search(&query, 10).unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let index = populated();
        index.delete("b").unwrap();
        assert_eq!(index.doc_count().unwrap(), 2);
        let hits = index.search(&IndexQuery::MatchAll, 10).unwrap();
        assert_eq!(ids(&hits), vec!["a", "c"]);
    }

    #[test]
    fn test_delete_many() {
        let index = populated();
        index
            .delete_many(&["a".to_string(), "c".to_string(), "missing".to_string()])
            .unwrap();
        let hits = index.search(&IndexQuery::MatchAll, 10).unwrap();
        assert_eq!(ids(&hits), vec!["b"]);
        index.delete_many(&[]).unwrap();
        assert_eq!(index.doc_count().unwrap(), 1);
    }

    #[test]
    fn test_delete_unknown_id_is_noop() {
        let index = populated();
        index.delete("missing").unwrap();
        assert_eq!(index.doc_count().unwrap(), 3);
    }

    #[test]
    fn test_reindexing_same_id_replaces() {
        let index = populated();
        let mut batch = index.new_batch();
        batch.add(doc("a", "idp", "Renamed", "Renamed "));
        index.apply_batch(batch).unwrap();
        assert_eq!(index.doc_count().unwrap(), 3);
        let hits = index.search(&IndexQuery::MatchAll, 10).unwrap();
        let a = hits.iter().find(|h| h.id == "a").unwrap();
        assert_eq!(a.title.as_deref(), Some("Renamed"));
    }

    #[test]
    fn test_open_reports_existence() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index");

        let (index, existed) = EntityIndex::open(&path, MIN_WRITER_HEAP_BYTES).unwrap();
        assert!(!existed);
        let mut batch = index.new_batch();
        batch.add(doc("a", "idp", "Example", "Example "));
        index.apply_batch(batch).unwrap();
        drop(index);
        EntityIndex::mark_ready(&path).unwrap();

        let (index, existed) = EntityIndex::open(&path, MIN_WRITER_HEAP_BYTES).unwrap();
        assert!(existed);
        assert_eq!(index.doc_count().unwrap(), 1);
    }

    #[test]
    fn test_open_discards_index_never_marked_ready() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index");

        let (index, _) = EntityIndex::open(&path, MIN_WRITER_HEAP_BYTES).unwrap();
        let mut batch = index.new_batch();
        batch.add(doc("a", "idp", "Example", "Example "));
        index.apply_batch(batch).unwrap();
        drop(index);

        let (index, existed) = EntityIndex::open(&path, MIN_WRITER_HEAP_BYTES).unwrap();
        assert!(!existed);
        assert_eq!(index.doc_count().unwrap(), 0);
    }
}
