//! Hybrid lexical + semantic retrieval.
//!
//! Fuses FTS rank with vector cosine into one score in [0, 1]. Strategy
//! selection can be explicit or adaptive on query shape; the fusion rule
//! is pluggable (`rrf`, `weighted`, `max`, `combined`), and a rerank mode
//! rescores the top-N lexical candidates against the query vector.
//!
//! Missing vectors never fail a search: their semantic score is 0.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use sm_common::{Error, Result};
use sm_embed::Embedder;
use sm_storage::{CodeChunkMeta, Memory, MemoryType, SearchOptions, Store};

use crate::cache::{cache_key, ResultCache};
use crate::index::{VectorIndex, VectorQuery};

/// RRF constant.
const RRF_K: f64 = 60.0;

/// Default rerank candidate pool.
pub const DEFAULT_RERANK_N: usize = 200;

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    KeywordFirst,
    SemanticFirst,
    Balanced,
    #[default]
    Adaptive,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::KeywordFirst => "keyword-first",
            Strategy::SemanticFirst => "semantic-first",
            Strategy::Balanced => "balanced",
            Strategy::Adaptive => "adaptive",
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword-first" => Ok(Strategy::KeywordFirst),
            "semantic-first" => Ok(Strategy::SemanticFirst),
            "balanced" => Ok(Strategy::Balanced),
            "adaptive" => Ok(Strategy::Adaptive),
            other => Err(Error::InputInvalid(format!("unknown strategy '{other}'"))),
        }
    }
}

/// Rule mapping the two per-source scores to one final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    #[default]
    Rrf,
    Weighted,
    Max,
    Combined,
}

impl std::str::FromStr for FusionMethod {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rrf" => Ok(FusionMethod::Rrf),
            "weighted" => Ok(FusionMethod::Weighted),
            "max" => Ok(FusionMethod::Max),
            "combined" => Ok(FusionMethod::Combined),
            other => Err(Error::InputInvalid(format!("unknown fusion method '{other}'"))),
        }
    }
}

/// Options for one hybrid search.
#[derive(Debug, Clone)]
pub struct HybridOptions {
    pub k: usize,
    pub strategy: Strategy,
    pub fusion: FusionMethod,
    pub weight_keyword: f64,
    pub weight_semantic: f64,
    /// `Some(n)`: rerank the top-n FTS candidates by query-vector cosine.
    pub rerank: Option<usize>,
    /// Restrict to one memory type (e.g. code for `search-code`).
    pub kind: Option<MemoryType>,
    pub use_cache: bool,
    pub cache_ttl: Duration,
}

impl Default for HybridOptions {
    fn default() -> Self {
        HybridOptions {
            k: 10,
            strategy: Strategy::Adaptive,
            fusion: FusionMethod::Rrf,
            weight_keyword: 0.5,
            weight_semantic: 0.5,
            rerank: None,
            kind: None,
            use_cache: true,
            cache_ttl: crate::cache::DEFAULT_TTL,
        }
    }
}

impl HybridOptions {
    /// Stable digest of everything that affects ranking (cache key part).
    fn digest(&self) -> String {
        format!(
            "k={};st={};fu={:?};wk={};ws={};rr={:?};ty={}",
            self.k,
            self.strategy.as_str(),
            self.fusion,
            self.weight_keyword,
            self.weight_semantic,
            self.rerank,
            self.kind.as_ref().map(|k| k.as_str()).unwrap_or("*"),
        )
    }
}

/// One fused result row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridResult {
    pub id: i64,
    pub content: String,
    /// Fused score in [0, 1].
    pub score: f64,
    pub keyword_score: f64,
    pub semantic_score: f64,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub context: String,
    pub tags: Vec<String>,
    /// Code metadata for filtering; not part of the wire shape.
    #[serde(skip)]
    pub code_meta: Option<CodeChunkMeta>,
}

/// Hybrid searcher over one project's store and vector index.
pub struct HybridSearch {
    store: Store,
    index: Box<dyn VectorIndex + Send>,
    embedder: Option<Embedder>,
    cache: ResultCache,
}

impl HybridSearch {
    pub fn new(
        store: Store,
        index: Box<dyn VectorIndex + Send>,
        embedder: Option<Embedder>,
    ) -> Self {
        HybridSearch {
            store,
            index,
            embedder,
            cache: ResultCache::default(),
        }
    }

    /// Stats of the underlying vector backend.
    pub fn index_stats(&self) -> crate::index::IndexStats {
        self.index.stats()
    }

    /// Run a hybrid search.
    pub fn search(&mut self, query: &str, opts: &HybridOptions) -> Result<Vec<HybridResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let key = cache_key(query, &opts.digest());
        if opts.use_cache {
            if let Some(hit) = self.cache.get(&key) {
                debug!("hybrid cache hit");
                return Ok(hit);
            }
        }

        let results = if let Some(rerank_n) = opts.rerank {
            self.rerank_search(query, rerank_n.max(1), opts)?
        } else {
            self.fused_search(query, opts)?
        };

        if opts.use_cache {
            self.cache.put(key, results.clone());
        }
        Ok(results)
    }

    fn fused_search(&mut self, query: &str, opts: &HybridOptions) -> Result<Vec<HybridResult>> {
        let strategy = match opts.strategy {
            Strategy::Adaptive => classify_query(query),
            explicit => explicit,
        };
        let fetch_n = (opts.k.max(1)) * 3;

        // Lexical side.
        let keyword_hits = self.store.search_memories(
            query,
            &SearchOptions {
                limit: fetch_n,
                kind: opts.kind.clone(),
                ..Default::default()
            },
        )?;
        let mut memories: HashMap<i64, Memory> = HashMap::new();
        let mut keyword: HashMap<i64, (f64, usize)> = HashMap::new();
        for (rank, hit) in keyword_hits.into_iter().enumerate() {
            keyword.insert(hit.memory.id, (hit.relevance, rank + 1));
            memories.insert(hit.memory.id, hit.memory);
        }

        // Semantic side; tolerant of a missing embedder or backend.
        let mut semantic: HashMap<i64, (f64, usize)> = HashMap::new();
        if let Some(embedder) = &self.embedder {
            let query_vec = embedder.embed(query);
            let matches = self
                .index
                .query(&VectorQuery {
                    vector: Some(&query_vec),
                    k: fetch_n,
                    ..Default::default()
                })
                .unwrap_or_default();
            for (rank, m) in matches.into_iter().enumerate() {
                semantic.insert(m.id, (m.score as f64, rank + 1));
            }
        }

        // Candidate set per strategy.
        let mut candidates: Vec<i64> = match strategy {
            Strategy::KeywordFirst => {
                let mut ids: Vec<i64> = keyword.keys().copied().collect();
                if ids.len() < opts.k {
                    // Underfilled: backfill with semantic matches.
                    for id in semantic.keys() {
                        if !keyword.contains_key(id) {
                            ids.push(*id);
                        }
                    }
                }
                ids
            }
            Strategy::SemanticFirst => semantic.keys().copied().collect(),
            Strategy::Balanced | Strategy::Adaptive => {
                let mut ids: Vec<i64> = keyword.keys().copied().collect();
                for id in semantic.keys() {
                    if !keyword.contains_key(id) {
                        ids.push(*id);
                    }
                }
                ids
            }
        };
        candidates.sort_unstable();
        candidates.dedup();

        let mut results = Vec::with_capacity(candidates.len());
        for id in candidates {
            let memory = match memories.remove(&id) {
                Some(m) => m,
                None => match self.store.get_memory(id)? {
                    Some(m) => m,
                    None => continue, // deleted under us
                },
            };
            if let Some(kind) = &opts.kind {
                if &memory.kind != kind {
                    continue;
                }
            }
            let kw = keyword.get(&id).map(|(s, _)| *s).unwrap_or(0.0);
            let sem = semantic.get(&id).map(|(s, _)| *s).unwrap_or(0.0);
            let kw_rank = keyword.get(&id).map(|(_, r)| *r);
            let sem_rank = semantic.get(&id).map(|(_, r)| *r);
            let score = fuse(opts, kw, sem, kw_rank, sem_rank);
            results.push(to_result(memory, score, kw, sem, strategy.as_str()));
        }

        sort_and_truncate(&mut results, opts.k);
        Ok(results)
    }

    /// Rerank mode: rescore the top-N lexical candidates by
    /// `0.5 · BM25-normalized + 0.5 · cosine(query, chunk)`.
    fn rerank_search(
        &mut self,
        query: &str,
        rerank_n: usize,
        opts: &HybridOptions,
    ) -> Result<Vec<HybridResult>> {
        let keyword_hits = self.store.search_memories(
            query,
            &SearchOptions {
                limit: rerank_n,
                kind: opts.kind.clone(),
                ..Default::default()
            },
        )?;
        let ids: Vec<i64> = keyword_hits.iter().map(|h| h.memory.id).collect();
        let vectors = self.store.get_vectors(&ids)?;

        let query_vec = self.embedder.as_ref().map(|e| e.embed(query));

        let mut results = Vec::with_capacity(keyword_hits.len());
        for hit in keyword_hits {
            let sem = match (&query_vec, vectors.get(&hit.memory.id)) {
                (Some(q), Some(v)) => sm_embed::cosine(q, v) as f64,
                _ => 0.0,
            };
            let kw = hit.relevance;
            let score = 0.5 * kw + 0.5 * sem;
            results.push(to_result(hit.memory, score, kw, sem, "hybrid-rerank"));
        }
        sort_and_truncate(&mut results, opts.k);
        Ok(results)
    }
}

fn to_result(memory: Memory, score: f64, kw: f64, sem: f64, strategy: &str) -> HybridResult {
    let code_meta = memory.metadata.as_code().cloned();
    HybridResult {
        id: memory.id,
        content: memory.content,
        score: score.clamp(0.0, 1.0),
        keyword_score: kw,
        semantic_score: sem,
        strategy: strategy.to_string(),
        timestamp: memory.created_at,
        kind: memory.kind.as_str().to_string(),
        context: memory.context,
        tags: memory.tags,
        code_meta,
    }
}

/// Deterministic ordering: fused score, then vector score, then recency,
/// then lower id.
fn sort_and_truncate(results: &mut Vec<HybridResult>, k: usize) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.semantic_score
                    .partial_cmp(&a.semantic_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.id.cmp(&b.id))
    });
    results.truncate(k.max(1));
}

fn fuse(
    opts: &HybridOptions,
    kw: f64,
    sem: f64,
    kw_rank: Option<usize>,
    sem_rank: Option<usize>,
) -> f64 {
    match opts.fusion {
        FusionMethod::Rrf => {
            let raw = kw_rank.map(|r| 1.0 / (RRF_K + r as f64)).unwrap_or(0.0)
                + sem_rank.map(|r| 1.0 / (RRF_K + r as f64)).unwrap_or(0.0);
            // Normalize against the best case (rank 1 in both lists).
            raw / (2.0 / (RRF_K + 1.0))
        }
        FusionMethod::Weighted => {
            let total = (opts.weight_keyword + opts.weight_semantic).max(f64::EPSILON);
            (opts.weight_keyword * kw + opts.weight_semantic * sem) / total
        }
        FusionMethod::Max => kw.max(sem),
        FusionMethod::Combined => (kw + sem) / 2.0,
    }
}

/// Query-shape heuristics for adaptive strategy selection.
///
/// Identifier-ish queries (dotted tokens, snake/camel case, digits,
/// quoted strings) go keyword-first; interrogative or conceptual queries
/// go semantic-first; everything else is balanced.
pub fn classify_query(query: &str) -> Strategy {
    let has_quote = query.contains('"') || query.contains('\'');
    let has_digit = query.chars().any(|c| c.is_ascii_digit());
    let has_identifier = query.split_whitespace().any(|tok| {
        let inner = tok.trim_matches(|c: char| !c.is_alphanumeric());
        let dotted = inner.contains('.') || tok.contains("::");
        let snake = inner.contains('_');
        let camel = inner
            .as_bytes()
            .windows(2)
            .any(|w| w[0].is_ascii_lowercase() && w[1].is_ascii_uppercase());
        dotted || snake || camel
    });
    if has_quote || has_digit || has_identifier {
        return Strategy::KeywordFirst;
    }

    let lowered = query.to_lowercase();
    let first = lowered.split_whitespace().next().unwrap_or("");
    let interrogative = matches!(
        first,
        "how" | "what" | "why" | "when" | "where" | "which" | "who" | "explain" | "describe"
    );
    let conceptual = ["concept", "approach", "pattern", "architecture", "design", "purpose", "overview"]
        .iter()
        .any(|w| lowered.contains(w));
    if interrogative || conceptual {
        return Strategy::SemanticFirst;
    }
    Strategy::Balanced
}
