//! Similarity retrieval over memories and skills.
//!
//! The core does not mandate an algorithm; it consumes the [`RetrievalIndex`]
//! contract. [`InMemoryIndex`] is a deterministic token-frequency cosine
//! index good enough for tests and single-process deployments; [`NullIndex`]
//! disables retrieval entirely (stores keep working, `search` returns empty).

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Metadata filter applied during search: every listed key must be present
/// with the listed value.
pub type IndexFilter = HashMap<String, String>;

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Indexed document id
    pub id: String,
    /// Similarity in [0, 1]
    pub similarity: f64,
}

/// Nearest-neighbor index contract.
///
/// Invariants: deterministic ordering given identical contents and query;
/// idempotent removal; `add` on an existing id overwrites and re-indexes.
/// Index write failures are non-fatal for store writes; search failures are
/// fatal for `search` operations.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    /// Index or re-index a document.
    async fn add(&self, id: &str, text: &str, metadata: IndexFilter) -> Result<()>;

    /// Remove a document. Removing an absent id is a no-op.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Ranked ids by descending similarity, stable tie-break on id.
    async fn search(
        &self,
        query: &str,
        filter: Option<&IndexFilter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;
}

fn tokenize(text: &str) -> HashMap<String, f64> {
    let mut counts: HashMap<String, f64> = HashMap::new();
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *counts.entry(token.to_string()).or_insert(0.0) += 1.0;
    }
    counts
}

fn norm(vector: &HashMap<String, f64>) -> f64 {
    vector.values().map(|v| v * v).sum::<f64>().sqrt()
}

/// Cosine similarity between two token-frequency vectors, in [0, 1].
#[must_use]
pub fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(token, weight)| large.get(token).map(|other| weight * other))
        .sum();
    let denom = norm(a) * norm(b);
    if denom <= f64::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(0.0, 1.0)
    }
}

/// Cosine similarity between two texts' token-frequency vectors.
#[must_use]
pub fn text_similarity(a: &str, b: &str) -> f64 {
    cosine_similarity(&tokenize(a), &tokenize(b))
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    tokens: HashMap<String, f64>,
    metadata: IndexFilter,
}

/// Deterministic in-process token-cosine index.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    docs: RwLock<HashMap<String, IndexedDoc>>,
}

impl InMemoryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Check whether no documents are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl RetrievalIndex for InMemoryIndex {
    async fn add(&self, id: &str, text: &str, metadata: IndexFilter) -> Result<()> {
        self.docs.write().insert(
            id.to_string(),
            IndexedDoc {
                tokens: tokenize(text),
                metadata,
            },
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docs.write().remove(id);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filter: Option<&IndexFilter>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query_tokens = tokenize(query);
        let docs = self.docs.read();

        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter(|(_, doc)| {
                filter.is_none_or(|wanted| {
                    wanted
                        .iter()
                        .all(|(k, v)| doc.metadata.get(k).is_some_and(|dv| dv == v))
                })
            })
            .map(|(id, doc)| SearchHit {
                id: id.clone(),
                similarity: cosine_similarity(&query_tokens, &doc.tokens),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Index that stores nothing and finds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndex;

#[async_trait]
impl RetrievalIndex for NullIndex {
    async fn add(&self, _id: &str, _text: &str, _metadata: IndexFilter) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn search(
        &self,
        _query: &str,
        _filter: Option<&IndexFilter>,
        _limit: usize,
    ) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}
