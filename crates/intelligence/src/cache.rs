use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::SearchScope;
use crate::backends::{EmbeddingBackend, SearchHit, cosine_similarity};
use crate::config::CacheConfig;

/// One cached semantic search result set.
struct CacheEntry {
    embedding: Vec<f32>,
    results: Vec<SearchHit>,
    created_at: Instant,
    scope: SearchScope,
    query: String,
}

/// Short-TTL, similarity-gated cache of semantic-search results, shared by
/// the analysis phases of one session so they reuse a single search.
///
/// At most one entry exists per active session, so memory stays bounded by
/// the number of live sessions. Entries must be discarded with
/// `clear_session` when the session ends.
pub struct SharedSearchCache {
    embedder: Arc<dyn EmbeddingBackend>,
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SharedSearchCache {
    pub fn new(embedder: Arc<dyn EmbeddingBackend>, config: CacheConfig) -> Self {
        Self {
            embedder,
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns cached results when the session's entry is fresh, scope-matched
    /// and similar enough to `query`; otherwise embeds the query, runs
    /// `search` and stores the fresh entry.
    ///
    /// Never a hard error: any failure along the way degrades to a miss (and
    /// an empty result set if the fresh search itself fails).
    pub async fn get_or_search<F, Fut>(
        &self,
        session_id: &str,
        query: &str,
        scope: &SearchScope,
        search: F,
    ) -> Vec<SearchHit>
    where
        F: FnOnce(Vec<f32>) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<SearchHit>>>,
    {
        let embedding = match self.embedder.embed(query).await {
            Ok(e) => e,
            Err(e) => {
                warn!(%session_id, %e, "Query embedding failed, returning empty result set");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        if let Some(results) = self.lookup(session_id, scope, &embedding) {
            debug!(%session_id, %query, "Search cache hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return results;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);

        let results = match search(embedding.clone()).await {
            Ok(r) => r,
            Err(e) => {
                warn!(%session_id, %e, "Search call failed, returning empty result set");
                return Vec::new();
            }
        };

        self.entries.insert(
            session_id.to_string(),
            CacheEntry {
                embedding,
                results: results.clone(),
                created_at: Instant::now(),
                scope: scope.clone(),
                query: query.to_string(),
            },
        );

        results
    }

    /// Removes a session's entry. Required at session teardown.
    pub fn clear_session(&self, session_id: &str) {
        if self.entries.remove(session_id).is_some() {
            debug!(%session_id, "Search cache entry released");
        }
    }

    /// Drops every entry.
    pub fn clear_all(&self) {
        self.entries.clear();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// (hits, misses) since startup.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn lookup(&self, session_id: &str, scope: &SearchScope, embedding: &[f32]) -> Option<Vec<SearchHit>> {
        let entry = self.entries.get(session_id)?;

        if entry.created_at.elapsed() >= Duration::from_secs(self.config.ttl_secs) {
            debug!(%session_id, "Cache entry expired");
            return None;
        }

        if entry.scope != *scope {
            return None;
        }

        let similarity = cosine_similarity(&entry.embedding, embedding);
        if similarity < self.config.reuse_threshold {
            debug!(%session_id, similarity, stored = %entry.query, "Cache entry too dissimilar");
            return None;
        }

        Some(entry.results.clone())
    }
}
