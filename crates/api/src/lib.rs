//! Syndex engine: keeps a hosted search index synchronized with a content
//! repository and answers queries by combining index hits with freshly
//! fetched repository records.
//!
//! This crate defines the capability traits the engine consumes (repository,
//! hosted index) and the `SyncEngine` hosts embed. Concrete capability
//! implementations live with the host; mocks are provided for tests.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use syndex_schema::validate_field_path;
use syndex_transform::flatten;

pub use syndex_core::{
    document_id, AccessMode, CollectionSync, Credentials, Document, Hit, IndexObject,
    RetryPolicy, SyncConfig, TransformedRecord, TransformedValue,
};
pub use syndex_schema::{CollectionSchema, FieldDescriptor, FieldType};
pub use syndex_transform::{Transformer, TransformerRegistry};

/// Engine errors suitable for transport to hosts.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Failure modes of the hosted index. Rate limiting is the only transient
/// case the engine retries locally.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("rate limited")]
    RateLimited,
    #[error("index service: {0}")]
    Service(String),
}

// ---- capabilities ----

/// One repository lookup: either id-constrained (enrichment) or paginated
/// (reindex). `select` limits the returned field projection.
#[derive(Debug, Clone, Default)]
pub struct FindRequest {
    pub ids: Option<Vec<String>>,
    pub page: Option<u32>,
    pub page_size: Option<usize>,
    pub select: Option<Vec<String>>,
    pub access: AccessMode,
}

#[derive(Debug, Clone, Default)]
pub struct FindResult {
    pub documents: Vec<Document>,
    pub has_next_page: bool,
    pub total: u64,
}

/// The content repository, as the engine sees it.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find(&self, collection: &str, request: FindRequest) -> anyhow::Result<FindResult>;
    async fn get_schema(&self, collection: &str) -> anyhow::Result<CollectionSchema>;
}

/// Index parameters forwarded untouched alongside the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits_per_page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<Hit>,
    pub page: u32,
    pub total_hits: u64,
    pub total_pages: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSettings {
    pub searchable_fields: Vec<String>,
    pub highlight_fields: Vec<String>,
}

/// The hosted search index, as the engine sees it. `upsert_if_exists` is
/// batch and all-or-nothing per call; it may fail with `RateLimited`.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert_if_exists(&self, index: &str, objects: Vec<IndexObject>) -> Result<(), IndexError>;
    async fn upsert_or_create(&self, index: &str, object: IndexObject) -> Result<(), IndexError>;
    async fn delete_by_id(&self, index: &str, object_id: &str) -> Result<(), IndexError>;
    async fn search(&self, index: &str, query: &str, params: &SearchParams) -> Result<SearchResults, IndexError>;
    async fn configure_settings(&self, index: &str, settings: IndexSettings) -> Result<(), IndexError>;
}

// ---- cancellation ----

/// Caller side of reindex cancellation.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Engine side: checked before every page fetch. In-flight retries finish
/// before cancellation is honored.
pub struct CancelToken {
    rx: oneshot::Receiver<()>,
}

impl CancelToken {
    fn is_cancelled(&mut self) -> bool {
        matches!(self.rx.try_recv(), Ok(()))
    }
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = oneshot::channel();
    (CancelHandle { tx: Some(tx) }, CancelToken { rx })
}

// ---- engine ----

/// Per-request search options. Enrichment is opt-in; `selection` limits the
/// repository field projection per collection.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub enrich: bool,
    pub selection: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: SearchResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched: Option<HashMap<String, Document>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexReport {
    pub indexed: u64,
}

/// Composition root: owns the immutable configuration and the transformer
/// registry, and drives the write, delete, search, and reindex paths
/// against the two capabilities.
pub struct SyncEngine {
    repo: Arc<dyn Repository>,
    index: Arc<dyn SearchIndex>,
    config: SyncConfig,
    registry: Arc<TransformerRegistry>,
}

impl SyncEngine {
    /// Field paths are validated here, once, so per-request traversal can
    /// assume well-formed segments.
    pub fn new(
        repo: Arc<dyn Repository>,
        index: Arc<dyn SearchIndex>,
        config: SyncConfig,
        registry: TransformerRegistry,
    ) -> SyncResult<Self> {
        for collection in &config.collections {
            for path in &collection.index_fields {
                if !validate_field_path(path) {
                    return Err(SyncError::Validation(format!(
                        "malformed index field path '{}' in collection '{}'",
                        path, collection.slug
                    )));
                }
            }
        }
        Ok(Self { repo, index, config, registry: Arc::new(registry) })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn index_name(&self) -> &str {
        &self.config.credentials.index_name
    }

    /// Apply searchable/highlight attributes derived from the union of all
    /// collections' index fields. Failure is logged, never fatal: the index
    /// keeps serving with its previous settings.
    pub async fn configure_index(&self) {
        let fields = self.config.all_index_fields();
        let settings = IndexSettings {
            searchable_fields: fields.clone(),
            highlight_fields: fields,
        };
        match self.index.configure_settings(self.index_name(), settings).await {
            Ok(()) => info!("index settings updated"),
            Err(e) => warn!(error = %e, "failed to configure index settings"),
        }
    }

    /// Write path: flatten and upsert one changed document. Fire-and-forget;
    /// failures are logged and must never fail the originating write.
    pub async fn on_document_written(
        &self,
        collection: &str,
        document: &Document,
        schema: &CollectionSchema,
    ) {
        let Some(object_id) = document_id(document) else {
            warn!(collection = %collection, "document missing id; skipping index write");
            return;
        };
        let Some(sync) = self.config.collection(collection) else {
            warn!(collection = %collection, "collection not configured for indexing; skipping");
            return;
        };
        let attributes = flatten(document, &sync.index_fields, schema, &self.registry);
        let object = IndexObject {
            object_id: object_id.clone(),
            collection: collection.to_string(),
            attributes,
        };
        match self.index.upsert_or_create(self.index_name(), object).await {
            Ok(()) => info!(collection = %collection, id = %object_id, "document indexed"),
            Err(e) => warn!(
                collection = %collection,
                id = %object_id,
                error = %e,
                "index write failed; content change unaffected"
            ),
        }
    }

    /// Deletion path: same failure policy as the write path.
    pub async fn on_document_deleted(&self, collection: &str, object_id: &str) {
        match self.index.delete_by_id(self.index_name(), object_id).await {
            Ok(()) => info!(collection = %collection, id = %object_id, "document removed from index"),
            Err(e) => warn!(
                collection = %collection,
                id = %object_id,
                error = %e,
                "index delete failed; content change unaffected"
            ),
        }
    }

    /// Read path: query the index, optionally enriching hits with fresh
    /// repository records. An empty query is a client error.
    pub async fn search(
        &self,
        query: &str,
        params: &SearchParams,
        opts: &SearchOptions,
    ) -> SyncResult<SearchOutcome> {
        let t0 = Instant::now();
        if query.trim().is_empty() {
            return Err(SyncError::Validation("search query is required".into()));
        }
        let results = self
            .index
            .search(self.index_name(), query, params)
            .await
            .map_err(|e| SyncError::Upstream(format!("search failed: {e}")))?;
        let enriched = if opts.enrich {
            Some(self.enrich(&results.hits, opts.selection.as_ref()).await)
        } else {
            None
        };
        info!(hits = results.hits.len(), enriched = opts.enrich, took_ms = %t0.elapsed().as_millis(), "search ok");
        Ok(SearchOutcome { results, enriched })
    }

    /// Group hits by origin collection, fetch each group's documents with
    /// one bounded lookup (issued concurrently), and merge into an
    /// identity -> record map. A failing collection contributes nothing;
    /// the rest of the response is unaffected.
    pub async fn enrich(
        &self,
        hits: &[Hit],
        selection: Option<&HashMap<String, Vec<String>>>,
    ) -> HashMap<String, Document> {
        if hits.is_empty() {
            return HashMap::new();
        }
        let mut by_collection: FxHashMap<&str, Vec<String>> = FxHashMap::default();
        for hit in hits {
            match hit.collection.as_deref() {
                Some(slug) if !slug.is_empty() => {
                    by_collection.entry(slug).or_default().push(hit.object_id.clone());
                }
                _ => {}
            }
        }
        let access = self.config.access_mode;
        let lookups = by_collection.into_iter().map(|(slug, ids)| {
            let select = selection.and_then(|s| s.get(slug)).cloned();
            async move {
                let request = FindRequest {
                    page_size: Some(ids.len()),
                    ids: Some(ids),
                    select,
                    access,
                    ..Default::default()
                };
                (slug.to_string(), self.repo.find(slug, request).await)
            }
        });
        let mut out: HashMap<String, Document> = HashMap::new();
        for (slug, result) in futures::future::join_all(lookups).await {
            match result {
                Ok(found) => {
                    // identities are globally unique in practice; on a
                    // collision the later-processed collection wins
                    for doc in found.documents {
                        if let Some(id) = document_id(&doc) {
                            out.insert(id, doc);
                        }
                    }
                }
                Err(e) => {
                    metrics::counter!("syndex_enrich_lookup_failures_total", 1u64);
                    warn!(collection = %slug, error = %e, "enrichment lookup failed; contributing no records");
                }
            }
        }
        out
    }

    /// Bulk path: page through the collection and refresh existing index
    /// records batch by batch. Pages already submitted stay applied on
    /// failure; re-running is the recovery path since object ids are stable.
    pub async fn reindex<F>(
        &self,
        collection: &str,
        authorize: F,
        mut cancel: Option<CancelToken>,
    ) -> SyncResult<ReindexReport>
    where
        F: Fn() -> bool,
    {
        let t0 = Instant::now();
        if !authorize() {
            return Err(SyncError::Forbidden(format!("reindex of '{collection}' denied")));
        }
        let sync = self.config.collection(collection).ok_or_else(|| {
            SyncError::NotFound(format!("collection '{collection}' is not configured for indexing"))
        })?;
        let schema = self
            .repo
            .get_schema(collection)
            .await
            .map_err(|e| SyncError::Upstream(format!("schema fetch failed: {e}")))?;

        let mut page: u32 = 1;
        let mut indexed: u64 = 0;
        loop {
            if let Some(token) = cancel.as_mut() {
                if token.is_cancelled() {
                    info!(collection = %collection, indexed, "reindex cancelled");
                    break;
                }
            }
            let p0 = Instant::now();
            let request = FindRequest {
                page: Some(page),
                page_size: Some(self.config.page_size),
                access: self.config.access_mode,
                ..Default::default()
            };
            let result = self
                .repo
                .find(collection, request)
                .await
                .map_err(|e| SyncError::Upstream(format!("page fetch failed: {e}")))?;
            if result.documents.is_empty() {
                break;
            }
            let objects: Vec<IndexObject> = result
                .documents
                .iter()
                .filter_map(|doc| {
                    let object_id = document_id(doc)?;
                    Some(IndexObject {
                        object_id,
                        collection: collection.to_string(),
                        attributes: flatten(doc, &sync.index_fields, &schema, &self.registry),
                    })
                })
                .collect();
            let batch_len = objects.len() as u64;
            self.submit_with_retry(objects).await?;
            indexed += batch_len;
            metrics::counter!("syndex_reindex_docs_total", batch_len);
            metrics::histogram!("syndex_reindex_page_ms", p0.elapsed().as_secs_f64() * 1000.0);
            info!(collection = %collection, page, indexed, total = result.total, "reindex progress");
            if !result.has_next_page {
                break;
            }
            page += 1;
        }
        info!(collection = %collection, indexed, took_ms = %t0.elapsed().as_millis(), "reindex ok");
        Ok(ReindexReport { indexed })
    }

    /// Submit one batch, retrying on rate limit with doubling waits up to
    /// the policy's ceiling and attempt cap. Anything else escalates.
    async fn submit_with_retry(&self, objects: Vec<IndexObject>) -> SyncResult<()> {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            match self.index.upsert_if_exists(self.index_name(), objects.clone()).await {
                Ok(()) => return Ok(()),
                Err(IndexError::RateLimited) if attempt < retry.max_retries => {
                    let wait = retry.wait_for(attempt);
                    attempt += 1;
                    metrics::counter!("syndex_reindex_batch_retries_total", 1u64);
                    warn!(
                        attempt,
                        max = retry.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited; retrying batch"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(IndexError::RateLimited) => {
                    return Err(SyncError::Upstream(format!(
                        "rate limit retries exhausted after {} attempts",
                        retry.max_retries
                    )));
                }
                Err(e) => {
                    return Err(SyncError::Upstream(format!("batch submit failed: {e}")));
                }
            }
        }
    }
}

// ---- mock capabilities ----

/// In-memory repository for tests: pages over fixed document lists and can
/// be told to fail whole collections (access denial and the like).
#[derive(Default)]
pub struct MockRepository {
    schemas: HashMap<String, CollectionSchema>,
    documents: HashMap<String, Vec<Document>>,
    failing: Vec<String>,
    pub find_log: std::sync::Mutex<Vec<(String, FindRequest)>>,
}

impl MockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(
        mut self,
        schema: CollectionSchema,
        documents: Vec<Document>,
    ) -> Self {
        let slug = schema.slug.clone();
        self.schemas.insert(slug.clone(), schema);
        self.documents.insert(slug, documents);
        self
    }

    pub fn failing(mut self, slug: &str) -> Self {
        self.failing.push(slug.to_string());
        self
    }

    pub fn find_calls(&self) -> usize {
        self.find_log.lock().map(|log| log.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn find(&self, collection: &str, request: FindRequest) -> anyhow::Result<FindResult> {
        if let Ok(mut log) = self.find_log.lock() {
            log.push((collection.to_string(), request.clone()));
        }
        if self.failing.iter().any(|s| s == collection) {
            anyhow::bail!("access denied to '{collection}'");
        }
        let docs = self.documents.get(collection).cloned().unwrap_or_default();
        if let Some(ids) = &request.ids {
            let documents: Vec<Document> = docs
                .into_iter()
                .filter(|d| document_id(d).map(|id| ids.contains(&id)).unwrap_or(false))
                .collect();
            let total = documents.len() as u64;
            return Ok(FindResult { documents, has_next_page: false, total });
        }
        let total = docs.len() as u64;
        let page = request.page.unwrap_or(1).max(1) as usize;
        let page_size = request.page_size.unwrap_or(docs.len().max(1));
        let start = (page - 1) * page_size;
        let documents: Vec<Document> = docs.into_iter().skip(start).take(page_size).collect();
        let has_next_page = start + documents.len() < total as usize;
        Ok(FindResult { documents, has_next_page, total })
    }

    async fn get_schema(&self, collection: &str) -> anyhow::Result<CollectionSchema> {
        self.schemas
            .get(collection)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown collection '{collection}'"))
    }
}

/// Scriptable hosted index for tests: records every write and can serve a
/// fixed number of rate-limit responses before accepting a batch.
#[derive(Default)]
pub struct MockIndex {
    rate_limits: std::sync::atomic::AtomicU32,
    fail_writes: bool,
    results: SearchResults,
    pub batch_attempts: std::sync::atomic::AtomicU32,
    pub batches: std::sync::Mutex<Vec<Vec<IndexObject>>>,
    pub upserts: std::sync::Mutex<Vec<IndexObject>>,
    pub deletes: std::sync::Mutex<Vec<String>>,
    pub settings: std::sync::Mutex<Option<IndexSettings>>,
}

impl MockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `n` rate-limit errors before the next batch succeeds.
    pub fn with_rate_limits(self, n: u32) -> Self {
        self.rate_limits.store(n, std::sync::atomic::Ordering::SeqCst);
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn with_results(mut self, results: SearchResults) -> Self {
        self.results = results;
        self
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SearchIndex for MockIndex {
    async fn upsert_if_exists(&self, _index: &str, objects: Vec<IndexObject>) -> Result<(), IndexError> {
        use std::sync::atomic::Ordering;
        self.batch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes {
            return Err(IndexError::Service("batch rejected".into()));
        }
        let remaining = self.rate_limits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.rate_limits.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexError::RateLimited);
        }
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(objects);
        }
        Ok(())
    }

    async fn upsert_or_create(&self, _index: &str, object: IndexObject) -> Result<(), IndexError> {
        if self.fail_writes {
            return Err(IndexError::Service("write rejected".into()));
        }
        if let Ok(mut upserts) = self.upserts.lock() {
            upserts.push(object);
        }
        Ok(())
    }

    async fn delete_by_id(&self, _index: &str, object_id: &str) -> Result<(), IndexError> {
        if self.fail_writes {
            return Err(IndexError::Service("delete rejected".into()));
        }
        if let Ok(mut deletes) = self.deletes.lock() {
            deletes.push(object_id.to_string());
        }
        Ok(())
    }

    async fn search(&self, _index: &str, _query: &str, _params: &SearchParams) -> Result<SearchResults, IndexError> {
        Ok(self.results.clone())
    }

    async fn configure_settings(&self, _index: &str, settings: IndexSettings) -> Result<(), IndexError> {
        if let Ok(mut slot) = self.settings.lock() {
            *slot = Some(settings);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn posts_schema() -> CollectionSchema {
        CollectionSchema {
            slug: "posts".into(),
            fields: vec![
                FieldDescriptor::new("title", FieldType::Text),
                FieldDescriptor::new("tags", FieldType::Array),
                FieldDescriptor::new("author", FieldType::Relationship),
            ],
        }
    }

    fn pages_schema() -> CollectionSchema {
        CollectionSchema {
            slug: "pages".into(),
            fields: vec![FieldDescriptor::new("title", FieldType::Text)],
        }
    }

    fn test_config(collections: Vec<CollectionSync>) -> SyncConfig {
        SyncConfig {
            credentials: Credentials {
                app_id: "app".into(),
                api_key: "key".into(),
                index_name: "main".into(),
            },
            collections,
            access_mode: AccessMode::Enforce,
            page_size: 500,
            retry: RetryPolicy { max_retries: 5, base_delay_ms: 1, max_delay_ms: 4 },
        }
    }

    fn posts_sync() -> CollectionSync {
        CollectionSync {
            slug: "posts".into(),
            index_fields: vec!["title".into(), "tags".into(), "author".into()],
        }
    }

    fn pages_sync() -> CollectionSync {
        CollectionSync { slug: "pages".into(), index_fields: vec!["title".into()] }
    }

    fn engine(repo: Arc<MockRepository>, index: Arc<MockIndex>, collections: Vec<CollectionSync>) -> SyncEngine {
        SyncEngine::new(repo, index, test_config(collections), TransformerRegistry::defaults())
            .expect("engine config should be valid")
    }

    fn post_doc(i: usize) -> Document {
        json!({ "id": format!("p{i}"), "title": format!("Post {i}") })
    }

    #[test]
    fn malformed_index_field_path_is_rejected() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let bad = CollectionSync { slug: "posts".into(), index_fields: vec!["meta..tags".into()] };
        let err = SyncEngine::new(repo, index, test_config(vec![bad]), TransformerRegistry::defaults())
            .err()
            .expect("malformed path must fail");
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn reindex_pages_through_501_documents() {
        let docs: Vec<Document> = (0..501).map(post_doc).collect();
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), docs));
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index.clone(), vec![posts_sync()]);

        let report = eng.reindex("posts", || true, None).await.expect("reindex should succeed");
        assert_eq!(report.indexed, 501);
        let batches = index.batches.lock().expect("lock");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 500);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].object_id, "p500");
        assert_eq!(batches[0][0].collection, "posts");
        // two page fetches, increasing page order
        let log = repo.find_log.lock().expect("lock");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].1.page, Some(1));
        assert_eq!(log[1].1.page, Some(2));
    }

    #[tokio::test]
    async fn reindex_is_idempotent_on_object_ids() {
        let docs: Vec<Document> = (0..3).map(post_doc).collect();
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), docs));
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index.clone(), vec![posts_sync()]);

        eng.reindex("posts", || true, None).await.expect("first run");
        eng.reindex("posts", || true, None).await.expect("second run");
        let batches = index.batches.lock().expect("lock");
        let ids = |batch: &Vec<IndexObject>| {
            let mut v: Vec<String> = batch.iter().map(|o| o.object_id.clone()).collect();
            v.sort();
            v
        };
        assert_eq!(ids(&batches[0]), ids(&batches[1]));
    }

    #[tokio::test]
    async fn reindex_retries_rate_limits_then_succeeds() {
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), vec![post_doc(0)]));
        let index = Arc::new(MockIndex::new().with_rate_limits(3));
        let eng = engine(repo, index.clone(), vec![posts_sync()]);

        let report = eng.reindex("posts", || true, None).await.expect("should recover");
        assert_eq!(report.indexed, 1);
        // 3 rate-limited attempts plus the successful one
        assert_eq!(index.batch_attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(index.batch_count(), 1);
    }

    #[tokio::test]
    async fn reindex_fails_after_exhausting_retries() {
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), vec![post_doc(0)]));
        let index = Arc::new(MockIndex::new().with_rate_limits(100));
        let mut config = test_config(vec![posts_sync()]);
        config.retry.max_retries = 2;
        let eng = SyncEngine::new(repo, index.clone(), config, TransformerRegistry::defaults())
            .expect("valid config");

        let err = eng.reindex("posts", || true, None).await.err().expect("must fail");
        assert!(matches!(err, SyncError::Upstream(_)));
        // initial attempt + 2 retries
        assert_eq!(index.batch_attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(index.batch_count(), 0);
    }

    #[tokio::test]
    async fn reindex_requires_authorization_before_any_read() {
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), vec![post_doc(0)]));
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index, vec![posts_sync()]);

        let err = eng.reindex("posts", || false, None).await.err().expect("must be forbidden");
        assert!(matches!(err, SyncError::Forbidden(_)));
        assert_eq!(repo.find_calls(), 0);
    }

    #[tokio::test]
    async fn reindex_of_unconfigured_collection_is_not_found() {
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), vec![]));
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index, vec![posts_sync()]);

        let err = eng.reindex("users", || true, None).await.err().expect("must be not found");
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn reindex_honors_cancellation_before_next_page() {
        let docs: Vec<Document> = (0..2).map(post_doc).collect();
        let repo = Arc::new(MockRepository::new().with_collection(posts_schema(), docs));
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index, vec![posts_sync()]);

        let (handle, token) = cancellation();
        handle.cancel();
        let report = eng.reindex("posts", || true, Some(token)).await.expect("cancel is not an error");
        assert_eq!(report.indexed, 0);
        assert_eq!(repo.find_calls(), 0);
    }

    #[tokio::test]
    async fn enrich_empty_hits_issues_no_lookups() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index, vec![posts_sync()]);

        let out = eng.enrich(&[], None).await;
        assert!(out.is_empty());
        assert_eq!(repo.find_calls(), 0);
    }

    fn hit(id: &str, collection: Option<&str>) -> Hit {
        Hit {
            object_id: id.to_string(),
            collection: collection.map(|s| s.to_string()),
            attributes: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn enrich_groups_hits_and_merges_per_collection() {
        let repo = Arc::new(
            MockRepository::new()
                .with_collection(posts_schema(), vec![json!({ "id": "1", "title": "A post" })])
                .with_collection(pages_schema(), vec![json!({ "id": "2", "title": "A page" })]),
        );
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index, vec![posts_sync(), pages_sync()]);

        let hits = vec![hit("1", Some("posts")), hit("2", Some("pages")), hit("9", None)];
        let out = eng.enrich(&hits, None).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out["1"]["title"], "A post");
        assert_eq!(out["2"]["title"], "A page");
        // exactly one lookup per tagged collection, each id-constrained
        let log = repo.find_log.lock().expect("lock");
        assert_eq!(log.len(), 2);
        for (_, request) in log.iter() {
            assert!(request.ids.is_some());
        }
    }

    #[tokio::test]
    async fn enrich_isolates_a_failing_collection() {
        let repo = Arc::new(
            MockRepository::new()
                .with_collection(pages_schema(), vec![json!({ "id": "2", "title": "A page" })])
                .failing("posts"),
        );
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index, vec![posts_sync(), pages_sync()]);

        let hits = vec![hit("1", Some("posts")), hit("2", Some("pages"))];
        let out = eng.enrich(&hits, None).await;
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("2"));
    }

    #[tokio::test]
    async fn enrich_passes_per_collection_selection() {
        let repo = Arc::new(
            MockRepository::new().with_collection(posts_schema(), vec![json!({ "id": "1" })]),
        );
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo.clone(), index, vec![posts_sync()]);

        let mut selection = HashMap::new();
        selection.insert("posts".to_string(), vec!["title".to_string()]);
        eng.enrich(&[hit("1", Some("posts"))], Some(&selection)).await;
        let log = repo.find_log.lock().expect("lock");
        assert_eq!(log[0].1.select.as_deref(), Some(&["title".to_string()][..]));
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index, vec![posts_sync()]);

        let err = eng
            .search("  ", &SearchParams::default(), &SearchOptions::default())
            .await
            .err()
            .expect("must be a validation error");
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn search_enriches_on_request() {
        let results = SearchResults {
            hits: vec![hit("1", Some("posts"))],
            page: 0,
            total_hits: 1,
            total_pages: 1,
        };
        let repo = Arc::new(
            MockRepository::new().with_collection(posts_schema(), vec![json!({ "id": "1", "title": "A post" })]),
        );
        let index = Arc::new(MockIndex::new().with_results(results));
        let eng = engine(repo, index, vec![posts_sync()]);

        let plain = eng
            .search("foo", &SearchParams::default(), &SearchOptions::default())
            .await
            .expect("search ok");
        assert!(plain.enriched.is_none());

        let opts = SearchOptions { enrich: true, selection: None };
        let enriched = eng
            .search("foo", &SearchParams::default(), &opts)
            .await
            .expect("search ok");
        let map = enriched.enriched.expect("enrichment requested");
        assert_eq!(map["1"]["title"], "A post");
    }

    #[tokio::test]
    async fn write_path_flattens_and_stamps_identity() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index.clone(), vec![posts_sync()]);

        let doc = json!({
            "id": "p1",
            "title": "Hello",
            "tags": ["a", "b"],
            "author": { "id": "u1", "name": "Alice" }
        });
        eng.on_document_written("posts", &doc, &posts_schema()).await;
        let upserts = index.upserts.lock().expect("lock");
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].object_id, "p1");
        assert_eq!(upserts[0].collection, "posts");
        assert_eq!(upserts[0].attributes.get("tags"), Some(&json!("a, b")));
        assert_eq!(upserts[0].attributes.get("author"), Some(&json!("Alice")));
    }

    #[tokio::test]
    async fn write_path_skips_documents_without_id_and_swallows_failures() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index.clone(), vec![posts_sync()]);
        eng.on_document_written("posts", &json!({ "title": "no id" }), &posts_schema()).await;
        assert!(index.upserts.lock().expect("lock").is_empty());

        // a failing index must not surface to the caller
        let repo = Arc::new(MockRepository::new());
        let failing = Arc::new(MockIndex::new().failing_writes());
        let eng = engine(repo, failing.clone(), vec![posts_sync()]);
        eng.on_document_written("posts", &post_doc(1), &posts_schema()).await;
        eng.on_document_deleted("posts", "p1").await;
        assert!(failing.upserts.lock().expect("lock").is_empty());
        assert!(failing.deletes.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn delete_path_removes_by_identity() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index.clone(), vec![posts_sync()]);
        eng.on_document_deleted("posts", "p1").await;
        assert_eq!(index.deletes.lock().expect("lock").as_slice(), &["p1".to_string()]);
    }

    #[tokio::test]
    async fn configure_index_unions_all_field_lists() {
        let repo = Arc::new(MockRepository::new());
        let index = Arc::new(MockIndex::new());
        let eng = engine(repo, index.clone(), vec![posts_sync(), pages_sync()]);
        eng.configure_index().await;
        let settings = index.settings.lock().expect("lock").clone().expect("settings applied");
        assert_eq!(settings.searchable_fields, vec!["title", "tags", "author"]);
        assert_eq!(settings.highlight_fields, settings.searchable_fields);
    }
}
