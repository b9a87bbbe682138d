//! Syndex core types: documents, transformed values, index objects, hits.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A repository document: an arbitrary JSON object carrying a stable `id`.
/// The engine only reads documents; derived records are always new values.
pub type Document = Value;

/// Extract the stable identity of a document, stringified.
/// Empty-string and non-scalar ids are treated as missing.
pub fn document_id(doc: &Document) -> Option<String> {
    match doc.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Index-safe value produced by a field transformer.
/// Absence (transformed-to-null) is expressed as `Option::None` at the
/// transformer boundary, never as a variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformedValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    TextList(Vec<String>),
}

impl From<TransformedValue> for Value {
    fn from(v: TransformedValue) -> Self {
        match v {
            TransformedValue::Bool(b) => Value::Bool(b),
            TransformedValue::Number(n) => Value::Number(n),
            TransformedValue::Text(s) => Value::String(s),
            TransformedValue::TextList(items) => {
                Value::Array(items.into_iter().map(Value::String).collect())
            }
        }
    }
}

/// Flat dotted-path -> transformed value mapping for one document.
/// Keys are exactly the requested paths that were present and non-null.
pub type TransformedRecord = serde_json::Map<String, Value>;

/// A transformed record stamped with its stable identity and origin
/// collection, ready to be sent to the hosted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexObject {
    #[serde(rename = "objectID")]
    pub object_id: String,
    pub collection: String,
    #[serde(flatten)]
    pub attributes: TransformedRecord,
}

/// One search-result entry returned by the hosted index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "objectID")]
    pub object_id: String,
    /// Origin collection tag; hits written before the tag existed may lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, Value>,
}

/// Whether repository lookups run under normal access rules or bypass them.
/// Static per process; never elevated per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Enforce,
    Bypass,
}

/// Credentials for the hosted index. The API key is the write-capable one;
/// hosts expose a search-only key to clients themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub app_id: String,
    pub api_key: String,
    pub index_name: String,
}

/// Per-collection sync settings: which dotted field paths get indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSync {
    pub slug: String,
    pub index_fields: Vec<String>,
}

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Backoff policy for rate-limited batch submissions: the wait doubles per
/// attempt, capped at `max_delay_ms`, for at most `max_retries` retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 1_000, max_delay_ms: 15_000 }
    }
}

impl RetryPolicy {
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Process-wide sync configuration, constructed once and passed to the
/// engine. No ambient global lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub credentials: Credentials,
    pub collections: Vec<CollectionSync>,
    pub access_mode: AccessMode,
    pub page_size: usize,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn new(credentials: Credentials, collections: Vec<CollectionSync>) -> Self {
        let page_size = std::env::var("SYNDEX_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let max_retries = std::env::var("SYNDEX_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or_else(|| RetryPolicy::default().max_retries);
        Self {
            credentials,
            collections,
            access_mode: AccessMode::Enforce,
            page_size,
            retry: RetryPolicy { max_retries, ..RetryPolicy::default() },
        }
    }

    pub fn collection(&self, slug: &str) -> Option<&CollectionSync> {
        self.collections.iter().find(|c| c.slug == slug)
    }

    /// Union of every collection's index fields, first-seen order preserved.
    /// Used for index settings (searchable/highlight attributes).
    pub fn all_index_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.collections {
            for f in &c.index_fields {
                if !out.iter().any(|s| s == f) {
                    out.push(f.clone());
                }
            }
        }
        out
    }
}
