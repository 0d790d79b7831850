//! Query construction and response shaping.
//!
//! The [`QueryService`] turns discovery requests into index queries and maps
//! hits back to raw entities through the same [`Generation`] snapshot, so a
//! request never mixes two generations. Hits whose ID is missing from the
//! snapshot's store (a stale index entry, or a race with reconciliation) are
//! logged and skipped.
//!
//! [`Generation`]: crate::reload::Generation

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::index::IndexQuery;
use crate::models::RawEntity;
use crate::reload::ReloadCoordinator;

/// Prefix of a templated entity identifier: `{sha1}<digest>[.<suffix>]`.
pub const SHA1_ID_PREFIX: &str = "{sha1}";

/// Link relation used for every webfinger link.
pub const DISCO_REL: &str = "disco-json";

/// Only entities of this type are returned by term searches.
pub const SEARCH_ENTITY_TYPE: &str = "idp";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub size: u64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Webfinger {
    pub expires: DateTime<Utc>,
    pub subject: String,
    pub links: Vec<Link>,
}

/// Answers discovery requests against the published generation.
pub struct QueryService {
    coordinator: Arc<ReloadCoordinator>,
    search_limit: usize,
    webfinger_ttl: Duration,
}

impl QueryService {
    /// # Arguments
    ///
    /// - `coordinator`: source of the generation each request reads.
    /// - `search_limit`: maximum hits for a term search.
    /// - `webfinger_ttl_secs`: lifetime advertised in webfinger `expires`.
    pub fn new(
        coordinator: Arc<ReloadCoordinator>,
        search_limit: usize,
        webfinger_ttl_secs: i64,
    ) -> Self {
        Self {
            coordinator,
            search_limit,
            webfinger_ttl: Duration::seconds(webfinger_ttl_secs),
        }
    }

    /// Number of documents in the current index.
    pub fn doc_count(&self) -> Result<u64> {
        self.coordinator.snapshot().index.doc_count()
    }

    /// Document count and `"<name> - <version>"` of this service.
    pub fn summary(&self) -> Result<ServiceSummary> {
        Ok(ServiceSummary {
            size: self.doc_count()?,
            version: format!("{} - {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        })
    }

    /// Healthy once at least one document is indexed.
    pub fn is_healthy(&self) -> Result<bool> {
        Ok(self.doc_count()? >= 1)
    }

    /// Lists every indexed entity as a link under `base_url`.
    ///
    /// # Arguments
    ///
    /// - `base_url`: `<scheme>://<authority>` the links and subject are
    ///   built from.
    ///
    /// # Returns
    ///
    /// One `disco-json` link per indexed document, expiring after the
    /// configured TTL.
    pub fn webfinger(&self, base_url: &str) -> Result<Webfinger> {
        let generation = self.coordinator.snapshot();
        let count = generation.index.doc_count()?;
        let hits = generation
            .index
            .search(&IndexQuery::MatchAll, count as usize)?;

        let links = hits
            .into_iter()
            .map(|hit| Link {
                rel: DISCO_REL.to_string(),
                href: entity_url(base_url, &hit.id),
            })
            .collect();

        Ok(Webfinger {
            expires: Utc::now() + self.webfinger_ttl,
            subject: base_url.to_string(),
            links,
        })
    }

    /// Raw entities matching `term`, or every indexed entity without one.
    ///
    /// # Arguments
    ///
    /// - `term`: free text from the `q` parameter. Blank counts as absent.
    ///
    /// # Returns
    ///
    /// Raw entities from the current store, best match first. Indexed IDs
    /// missing from the store are skipped, so the result may be shorter
    /// than the hit list.
    pub fn search(&self, term: Option<&str>) -> Result<Vec<RawEntity>> {
        let generation = self.coordinator.snapshot();
        let (query, limit) = match build_search(term) {
            Some(query) => (query, self.search_limit),
            None => (
                IndexQuery::MatchAll,
                generation.index.doc_count()? as usize,
            ),
        };

        let hits = generation.index.search(&query, limit)?;
        let mut entities = Vec::with_capacity(hits.len());
        for hit in hits {
            match generation.store.get(&hit.id) {
                Some(entity) => entities.push(entity.clone()),
                None => warn!(id = %hit.id, "indexed entity missing from store"),
            }
        }
        Ok(entities)
    }

    /// Looks up an entity by templated identifier.
    ///
    /// # Arguments
    ///
    /// - `identifier`: `{sha1}<digest>`, optionally followed by `.<suffix>`.
    ///
    /// # Returns
    ///
    /// The raw entity, or `None` for an unknown digest or a malformed
    /// identifier.
    pub fn lookup(&self, identifier: &str) -> Option<RawEntity> {
        let id = parse_entity_identifier(identifier)?;
        self.coordinator.snapshot().store.get(id).cloned()
    }
}

/// Builds the term query, or `None` when no usable term was supplied.
///
/// The term is lowercased and split on whitespace. The first word must match
/// as a prefix of a content term; later words are optional and only affect
/// ranking. Results are restricted to identity providers.
pub fn build_search(term: Option<&str>) -> Option<IndexQuery> {
    let term = term?.to_lowercase();
    let mut words = term.split_whitespace().map(str::to_string);
    let prefix = words.next()?;
    Some(IndexQuery::ContentPrefix {
        prefix,
        optional: words.collect(),
        entity_type: SEARCH_ENTITY_TYPE.to_string(),
    })
}

/// Extracts the digest from `{sha1}<digest>[.<suffix>]`.
pub fn parse_entity_identifier(identifier: &str) -> Option<&str> {
    let rest = identifier.strip_prefix(SHA1_ID_PREFIX)?;
    let digest = rest.split('.').next().unwrap_or_default();
    if digest.is_empty() {
        None
    } else {
        Some(digest)
    }
}

pub fn entity_url(base_url: &str, id: &str) -> String {
    format!(
        "{}/entities/{}{}",
        base_url.trim_end_matches('/'),
        SHA1_ID_PREFIX,
        id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_WRITER_HEAP_BYTES;
    use crate::index::{EntityIndex, SearchIndex};
    use crate::models::sha1_id;
    use crate::sync::SyncMode;
    use std::fs;
    use tempfile::TempDir;

    const FEED: &str = r#"[
        {"entityID": "https://idp.example.org", "title": "Example IdP", "type": "idp", "scope": "example.org"},
        {"entityID": "https://sp.example.org", "title": "Example SP", "type": "sp"},
        {"entityID": "https://idp.other.net", "title": "Other University", "type": "idp", "domain": "other.net"}
    ]"#;

    async fn service(feed: &str) -> (TempDir, Arc<ReloadCoordinator>, QueryService) {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("metadata.json");
        fs::write(&source, feed).unwrap();
        let index: Arc<dyn SearchIndex> =
            Arc::new(EntityIndex::create_in_ram(MIN_WRITER_HEAP_BYTES).unwrap());
        let coordinator = Arc::new(
            ReloadCoordinator::with_index(&source, 100, index, SyncMode::Rebuild)
                .await
                .unwrap(),
        );
        let service = QueryService::new(coordinator.clone(), 100, 3600);
        (tmp, coordinator, service)
    }

    fn entity_ids(entities: &[RawEntity]) -> Vec<String> {
        let mut ids: Vec<String> = entities
            .iter()
            .map(|e| e["entityID"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_parse_entity_identifier() {
        assert_eq!(parse_entity_identifier("{sha1}abcdef"), Some("abcdef"));
        assert_eq!(parse_entity_identifier("{sha1}abcdef.json"), Some("abcdef"));
        assert_eq!(parse_entity_identifier("abcdef"), None);
        assert_eq!(parse_entity_identifier("{sha1}"), None);
        assert_eq!(parse_entity_identifier("{md5}abcdef"), None);
    }

    #[test]
    fn test_build_search() {
        assert_eq!(
            build_search(Some("  ExAm ")),
            Some(IndexQuery::ContentPrefix {
                prefix: "exam".to_string(),
                optional: Vec::new(),
                entity_type: "idp".to_string(),
            })
        );
        assert_eq!(build_search(Some("")), None);
        assert_eq!(build_search(Some(" \t ")), None);
        assert_eq!(build_search(None), None);
    }

    #[test]
    fn test_entity_url() {
        assert_eq!(
            entity_url("https://md.example.org/", "abc"),
            "https://md.example.org/entities/{sha1}abc"
        );
    }

    #[tokio::test]
    async fn test_summary_and_health() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let summary = service.summary().unwrap();
        assert_eq!(summary.size, 3);
        assert!(summary.version.starts_with("json-mdq - "));
        assert!(service.is_healthy().unwrap());
    }

    #[tokio::test]
    async fn test_empty_feed_is_unhealthy() {
        let (_tmp, _coordinator, service) = service("[]").await;
        assert!(!service.is_healthy().unwrap());
    }

    #[tokio::test]
    async fn test_search_term_matches_prefix_of_idps_only() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let hits = service.search(Some("exam")).unwrap();
        assert_eq!(entity_ids(&hits), vec!["https://idp.example.org"]);
        assert!(hits[0].contains_key("id"));
    }

    #[test]
    fn test_build_search_splits_words() {
        assert_eq!(
            build_search(Some("Example  IdP org")),
            Some(IndexQuery::ContentPrefix {
                prefix: "example".to_string(),
                optional: vec!["idp".to_string(), "org".to_string()],
                entity_type: "idp".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_search_with_several_words() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let hits = service.search(Some("example idp")).unwrap();
        assert_eq!(entity_ids(&hits), vec!["https://idp.example.org"]);

        // only the first word is required
        let hits = service.search(Some("exam nomatch")).unwrap();
        assert_eq!(entity_ids(&hits), vec!["https://idp.example.org"]);
        assert!(service.search(Some("nomatch example")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_uses_domain_field() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let hits = service.search(Some("OTHER")).unwrap();
        assert_eq!(entity_ids(&hits), vec!["https://idp.other.net"]);
    }

    #[tokio::test]
    async fn test_search_without_term_returns_everything() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        assert_eq!(service.search(None).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_search_skips_entities_missing_from_store() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("metadata.json");
        fs::write(&source, FEED).unwrap();

        // A stale document left over from an earlier generation.
        let index = EntityIndex::create_in_ram(MIN_WRITER_HEAP_BYTES).unwrap();
        let mut batch = index.new_batch();
        batch.add(crate::models::EntityDocument {
            id: sha1_id("https://gone.example.org"),
            entity_id: "https://gone.example.org".to_string(),
            entity_type: "idp".to_string(),
            title: "Gone".to_string(),
            content: "Gone example ".to_string(),
        });
        index.apply_batch(batch).unwrap();

        let coordinator = Arc::new(
            ReloadCoordinator::with_index(&source, 100, Arc::new(index), SyncMode::Rebuild)
                .await
                .unwrap(),
        );
        let service = QueryService::new(coordinator, 100, 3600);

        assert_eq!(service.doc_count().unwrap(), 4);
        assert_eq!(service.search(None).unwrap().len(), 3);
        assert_eq!(
            entity_ids(&service.search(Some("exam")).unwrap()),
            vec!["https://idp.example.org"]
        );
    }

    #[tokio::test]
    async fn test_lookup() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let id = sha1_id("https://idp.example.org");

        let entity = service.lookup(&format!("{{sha1}}{}", id)).unwrap();
        assert_eq!(entity["id"], serde_json::Value::String(id.clone()));
        assert_eq!(entity["scope"], "example.org");

        assert!(service.lookup(&format!("{{sha1}}{}.json", id)).is_some());
        assert!(service.lookup(&id).is_none());
        assert!(service.lookup("{sha1}0000").is_none());
    }

    #[tokio::test]
    async fn test_webfinger_links_every_document() {
        let (_tmp, _coordinator, service) = service(FEED).await;
        let doc = service.webfinger("http://localhost:3000").unwrap();
        assert_eq!(doc.subject, "http://localhost:3000");
        assert_eq!(doc.links.len(), 3);
        assert!(doc.links.iter().all(|l| l.rel == "disco-json"));
        let href = entity_url("http://localhost:3000", &sha1_id("https://sp.example.org"));
        assert!(doc.links.iter().any(|l| l.href == href));
        assert!(doc.expires > Utc::now() + Duration::seconds(3500));
    }
}
