//! Elasticsearch backend.
//!
//! Version guarding uses external versioning: every write is sent as
//! `PUT /<index>/_doc/<id>?version=N&version_type=external`, which
//! Elasticsearch accepts only when `N` is greater than the stored
//! `_version`. A rejected write comes back as 409 and is reported as
//! [`WriteOutcome::Stale`]. Deletes are written the same way as a tombstone
//! document (`{"deleted": true}`) so the version survives the delete.

use crate::{IndexDocument, IndexError, IndexResult, SearchIndex, StoredDocument, WriteOutcome};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Source field marking a tombstone.
const DELETED_FIELD: &str = "deleted";

/// Connection settings for [`ElasticsearchIndex`].
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    pub url: String,
    /// Physical index names are `<index_prefix>-<aggregate_type>`.
    pub index_prefix: String,
    pub request_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index_prefix: "outbox".to_string(),
            request_timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

/// [`SearchIndex`] over the Elasticsearch REST API.
///
/// The top-level source field `deleted` is reserved for the tombstone marker.
/// Documents that carry their own `deleted` field are rejected.
#[derive(Clone)]
pub struct ElasticsearchIndex {
    http_client: Client,
    base_url: Url,
    index_prefix: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticsearchIndex {
    pub fn new(config: ElasticsearchConfig) -> IndexResult<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| IndexError::Config(format!("invalid Elasticsearch URL {}: {e}", config.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(IndexError::Config(format!(
                "Elasticsearch URL {} cannot be a base URL",
                config.url
            )));
        }

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            index_prefix: config.index_prefix,
            username: config.username,
            password: config.password,
        })
    }

    /// Physical index name for a logical index (lowercased, as
    /// Elasticsearch requires).
    pub fn physical_index(&self, index: &str) -> String {
        if self.index_prefix.is_empty() {
            index.to_lowercase()
        } else {
            format!("{}-{}", self.index_prefix, index).to_lowercase()
        }
    }

    fn document_url(&self, index: &str, id: &str) -> IndexResult<Url> {
        let physical = self.physical_index(index);
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend([physical.as_str(), "_doc", id]);
        Ok(url)
    }

    fn versioned_url(&self, index: &str, id: &str, version: i64) -> IndexResult<Url> {
        let mut url = self.document_url(index, id)?;
        url.query_pairs_mut()
            .append_pair("version", &version.to_string())
            .append_pair("version_type", "external");
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(username) => builder.basic_auth(username, self.password.as_ref()),
            None => builder,
        }
    }

    async fn write(&self, index: &str, id: &str, version: i64, body: Value) -> IndexResult<WriteOutcome> {
        let url = self.versioned_url(index, id, version)?;

        debug!(index, id, version, "Writing document to Elasticsearch");

        let response = self
            .authorized(self.http_client.put(url))
            .json(&body)
            .send()
            .await
            .map_err(IndexError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            debug!(index, id, version, "Document written to Elasticsearch");
            return Ok(WriteOutcome::Applied);
        }

        let text = response.text().await.unwrap_or_default();
        if status != StatusCode::CONFLICT {
            return Err(IndexError::from_status(status.as_u16(), text));
        }

        if let Some(current_version) = parse_conflict_version(&text) {
            return Ok(WriteOutcome::Stale { current_version });
        }

        // Older clusters phrase the conflict differently; read the version back.
        match self.get(index, id).await? {
            Some(current) if current.version >= version => Ok(WriteOutcome::Stale {
                current_version: current.version,
            }),
            _ => {
                warn!(index, id, version, "Version conflict without a newer stored version");
                Err(IndexError::VersionConflict {
                    index: index.to_string(),
                    id: id.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn get(&self, index: &str, id: &str) -> IndexResult<Option<StoredDocument>> {
        let url = self.document_url(index, id)?;

        let response = self
            .authorized(self.http_client.get(url))
            .send()
            .await
            .map_err(IndexError::from_transport)?;

        let status = response.status();
        // Covers both a missing document and a missing index.
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let text = response.text().await.map_err(IndexError::from_transport)?;
        if !status.is_success() {
            return Err(IndexError::from_status(status.as_u16(), text));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| IndexError::MalformedResponse(format!("GET {index}/{id}: {e}")))?;
        parse_get_response(&body)
    }

    async fn put_if_newer(&self, document: IndexDocument) -> IndexResult<WriteOutcome> {
        let body = document_body(document.source)?;
        self.write(&document.index, &document.id, document.version, body)
            .await
    }

    async fn tombstone_if_newer(
        &self,
        index: &str,
        id: &str,
        version: i64,
    ) -> IndexResult<WriteOutcome> {
        self.write(index, id, version, json!({ DELETED_FIELD: true }))
            .await
    }
}

/// Add the live marker to a document source.
fn document_body(source: Value) -> IndexResult<Value> {
    match source {
        Value::Object(fields) if fields.contains_key(DELETED_FIELD) => Err(IndexError::Rejected {
            status: 400,
            message: format!("document source may not use the reserved field `{DELETED_FIELD}`"),
        }),
        Value::Object(mut fields) => {
            fields.insert(DELETED_FIELD.to_string(), Value::Bool(false));
            Ok(Value::Object(fields))
        }
        other => Err(IndexError::Rejected {
            status: 400,
            message: format!("document source must be a JSON object, got {other}"),
        }),
    }
}

fn parse_get_response(body: &Value) -> IndexResult<Option<StoredDocument>> {
    if body.get("found").and_then(Value::as_bool) == Some(false) {
        return Ok(None);
    }

    let version = body
        .get("_version")
        .and_then(Value::as_i64)
        .ok_or_else(|| IndexError::MalformedResponse("missing _version".to_string()))?;
    let mut source: Map<String, Value> = body
        .get("_source")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| IndexError::MalformedResponse("missing _source".to_string()))?;

    let deleted = source
        .remove(DELETED_FIELD)
        .and_then(|value| value.as_bool())
        .unwrap_or(false);

    Ok(Some(StoredDocument {
        version,
        deleted,
        source: if deleted {
            Value::Null
        } else {
            Value::Object(source)
        },
    }))
}

/// Extract `N` from "current version [N] is higher or equal to ...".
fn parse_conflict_version(body: &str) -> Option<i64> {
    let marker = "current version [";
    let start = body.find(marker)? + marker.len();
    let end = body[start..].find(']')? + start;
    body[start..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ElasticsearchIndex {
        ElasticsearchIndex::new(ElasticsearchConfig {
            url: "http://search.internal:9200/".to_string(),
            index_prefix: "breakin-dev".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = ElasticsearchConfig::default();
        assert_eq!(config.url, "http://localhost:9200");
        assert_eq!(config.index_prefix, "outbox");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.username.is_none());
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = ElasticsearchIndex::new(ElasticsearchConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(IndexError::Config(_))));
    }

    #[test]
    fn test_physical_index_name() {
        let es = index();
        assert_eq!(es.physical_index("job"), "breakin-dev-job");
        assert_eq!(es.physical_index("Order"), "breakin-dev-order");

        let bare = ElasticsearchIndex::new(ElasticsearchConfig {
            index_prefix: String::new(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bare.physical_index("job"), "job");
    }

    #[test]
    fn test_versioned_url() {
        let url = index().versioned_url("job", "42", 7).unwrap();
        assert_eq!(
            url.as_str(),
            "http://search.internal:9200/breakin-dev-job/_doc/42?version=7&version_type=external"
        );
    }

    #[test]
    fn test_document_url_escapes_id() {
        let url = index().document_url("job", "a/b c").unwrap();
        assert_eq!(
            url.as_str(),
            "http://search.internal:9200/breakin-dev-job/_doc/a%2Fb%20c"
        );
    }

    #[test]
    fn test_parse_found_document() {
        let body = json!({
            "_index": "breakin-dev-job",
            "_id": "42",
            "_version": 3,
            "found": true,
            "_source": { "title": "Rust engineer", "deleted": false }
        });
        let doc = parse_get_response(&body).unwrap().unwrap();
        assert_eq!(doc.version, 3);
        assert!(!doc.deleted);
        assert_eq!(doc.source, json!({ "title": "Rust engineer" }));
    }

    #[test]
    fn test_parse_tombstone_and_missing() {
        let tombstone = json!({ "_version": 5, "found": true, "_source": { "deleted": true } });
        let doc = parse_get_response(&tombstone).unwrap().unwrap();
        assert!(doc.deleted);
        assert_eq!(doc.live_source(), None);

        let missing = json!({ "_id": "42", "found": false });
        assert!(parse_get_response(&missing).unwrap().is_none());
    }

    #[test]
    fn test_parse_malformed_response() {
        let body = json!({ "found": true, "_source": {} });
        assert!(matches!(
            parse_get_response(&body),
            Err(IndexError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_conflict_version() {
        let body = r#"{"error":{"type":"version_conflict_engine_exception","reason":"[42]: version conflict, current version [3] is higher or equal to the one provided [2]"},"status":409}"#;
        assert_eq!(parse_conflict_version(body), Some(3));
        assert_eq!(parse_conflict_version(r#"{"status":409}"#), None);
    }

    #[test]
    fn test_document_body_marks_live() {
        let body = document_body(json!({ "title": "Rust engineer" })).unwrap();
        assert_eq!(body, json!({ "title": "Rust engineer", "deleted": false }));

        let err = document_body(json!([1, 2])).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_document_body_rejects_reserved_field() {
        let err = document_body(json!({ "title": "Archived role", "deleted": true })).unwrap_err();
        assert!(matches!(err, IndexError::Rejected { status: 400, .. }));
        assert!(!err.is_transient());
    }
}
