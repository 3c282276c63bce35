//! The `VectorIndex` capability set and its two backends.
//!
//! Backend selection never leaks into ranking code: hybrid search talks
//! to the trait only. With `BackendChoice::Auto` the native extension is
//! probed first and the in-process cosine scan takes over on any failure.

use std::collections::HashMap;

use tracing::{debug, info};

use sm_common::{Error, Result};
use sm_embed::Embedder;
use sm_storage::Store;

/// A scored match from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: i64,
    /// Similarity score in [0, 1].
    pub score: f32,
}

/// Query against a vector index: a vector, or text when the backend has
/// an embedder attached.
#[derive(Debug, Clone, Default)]
pub struct VectorQuery<'a> {
    pub vector: Option<&'a [f32]>,
    pub text: Option<&'a str>,
    pub k: usize,
    pub threshold: f32,
}

/// Backend statistics for `vector-status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub backend: &'static str,
    pub count: usize,
    pub dimensions: Option<usize>,
}

/// Capability set shared by all vector backends.
pub trait VectorIndex {
    /// Prepare the backend; fails with `BackendUnavailable` when the
    /// backing engine is absent.
    fn init(&mut self) -> Result<()>;
    fn add(&mut self, id: i64, vec: Vec<f32>) -> Result<()>;
    fn remove(&mut self, id: i64) -> Result<()>;
    fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<VectorMatch>>;
    fn stats(&self) -> IndexStats;
    fn dimensions(&self) -> Option<usize>;
}

/// Requested backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    #[default]
    Auto,
    Native,
    Cosine,
}

impl std::str::FromStr for BackendChoice {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(BackendChoice::Auto),
            "native" => Ok(BackendChoice::Native),
            "cosine" | "local" => Ok(BackendChoice::Cosine),
            other => Err(Error::InputInvalid(format!("unknown vector backend '{other}'"))),
        }
    }
}

/// In-process cosine scan over `{id -> (vec, magnitude)}`.
///
/// Text queries work only when an embedder is attached; otherwise the
/// caller must supply a vector.
pub struct CosineIndex {
    entries: HashMap<i64, (Vec<f32>, f32)>,
    dim: Option<usize>,
    embedder: Option<Embedder>,
}

impl CosineIndex {
    pub fn new(embedder: Option<Embedder>) -> Self {
        CosineIndex {
            entries: HashMap::new(),
            dim: None,
            embedder,
        }
    }

    /// Build from every vector in storage.
    pub fn from_store(store: &Store, embedder: Option<Embedder>) -> Result<Self> {
        let mut index = CosineIndex::new(embedder);
        for (id, vec) in store.all_vectors()? {
            index.add(id, vec)?;
        }
        debug!(count = index.entries.len(), "cosine index loaded");
        Ok(index)
    }
}

impl VectorIndex for CosineIndex {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn add(&mut self, id: i64, vec: Vec<f32>) -> Result<()> {
        if vec.is_empty() {
            return Err(Error::InputInvalid("vector must be non-empty".into()));
        }
        if let Some(dim) = self.dim {
            if dim != vec.len() {
                return Err(Error::InputInvalid(format!(
                    "vector dimension {} does not match index dimension {dim}",
                    vec.len()
                )));
            }
        } else {
            self.dim = Some(vec.len());
        }
        let magnitude = sm_embed::magnitude(&vec);
        self.entries.insert(id, (vec, magnitude));
        Ok(())
    }

    fn remove(&mut self, id: i64) -> Result<()> {
        self.entries.remove(&id);
        Ok(())
    }

    fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<VectorMatch>> {
        let owned;
        let vector: &[f32] = match (query.vector, query.text) {
            (Some(v), _) => v,
            (None, Some(text)) => {
                let Some(embedder) = &self.embedder else {
                    return Err(Error::InputInvalid(
                        "text query requires an embedding function".into(),
                    ));
                };
                owned = embedder.embed(text);
                &owned
            }
            (None, None) => {
                return Err(Error::InputInvalid("vector query needs a vector or text".into()))
            }
        };

        let query_mag = sm_embed::magnitude(vector);
        if query_mag == 0.0 {
            return Ok(Vec::new());
        }

        let mut matches: Vec<VectorMatch> = self
            .entries
            .iter()
            .filter(|(_, (vec, _))| vec.len() == vector.len())
            .map(|(&id, (vec, mag))| {
                let dot: f32 = vec.iter().zip(vector.iter()).map(|(a, b)| a * b).sum();
                let score = if *mag == 0.0 {
                    0.0
                } else {
                    (dot / (mag * query_mag)).clamp(0.0, 1.0)
                };
                VectorMatch { id, score }
            })
            .filter(|m| m.score >= query.threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        matches.truncate(query.k.max(1));
        Ok(matches)
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            backend: "in-process-cosine",
            count: self.entries.len(),
            dimensions: self.dim,
        }
    }

    fn dimensions(&self) -> Option<usize> {
        self.dim
    }
}

/// ANN over the native SQL extension, sharing the storage connection.
///
/// Distance `d` converts to score `1/(1+d)`.
pub struct NativeAnnIndex {
    store: Store,
    embedder: Option<Embedder>,
}

impl NativeAnnIndex {
    pub fn new(store: Store, embedder: Option<Embedder>) -> Self {
        NativeAnnIndex { store, embedder }
    }
}

impl VectorIndex for NativeAnnIndex {
    fn init(&mut self) -> Result<()> {
        if self.store.native_ann_available() {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(
                "native ANN extension not loaded".into(),
            ))
        }
    }

    fn add(&mut self, id: i64, vec: Vec<f32>) -> Result<()> {
        self.store.upsert_vector(id, &vec)
    }

    fn remove(&mut self, id: i64) -> Result<()> {
        self.store.delete_vector(id)?;
        Ok(())
    }

    fn query(&self, query: &VectorQuery<'_>) -> Result<Vec<VectorMatch>> {
        let owned;
        let vector: &[f32] = match (query.vector, query.text) {
            (Some(v), _) => v,
            (None, Some(text)) => {
                let Some(embedder) = &self.embedder else {
                    return Err(Error::InputInvalid(
                        "text query requires an embedding function".into(),
                    ));
                };
                owned = embedder.embed(text);
                &owned
            }
            (None, None) => {
                return Err(Error::InputInvalid("vector query needs a vector or text".into()))
            }
        };
        let matches = self
            .store
            .knn_native(vector, query.k.max(1))?
            .into_iter()
            .map(|(id, distance)| VectorMatch {
                id,
                score: (1.0 / (1.0 + distance.max(0.0))) as f32,
            })
            .filter(|m| m.score >= query.threshold)
            .collect();
        Ok(matches)
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            backend: "native-ann",
            count: self.store.count_vectors().unwrap_or(0) as usize,
            dimensions: self.store.vector_dim().unwrap_or(None),
        }
    }

    fn dimensions(&self) -> Option<usize> {
        self.store.vector_dim().unwrap_or(None)
    }
}

/// Pick and initialize a backend.
///
/// `Auto` tries the native extension first and falls back to the cosine
/// scan on any failure; the chosen backend shows up in `vector-status`.
pub fn select_backend(
    choice: BackendChoice,
    store: &Store,
    embedder: Option<Embedder>,
) -> Result<Box<dyn VectorIndex + Send>> {
    match choice {
        BackendChoice::Native => {
            let mut native = NativeAnnIndex::new(store.clone(), embedder);
            native.init()?;
            Ok(Box::new(native))
        }
        BackendChoice::Cosine => Ok(Box::new(CosineIndex::from_store(store, embedder)?)),
        BackendChoice::Auto => {
            let mut native = NativeAnnIndex::new(store.clone(), embedder.clone());
            match native.init() {
                Ok(()) => {
                    info!("vector backend: native-ann");
                    Ok(Box::new(native))
                }
                Err(e) => {
                    debug!(error = %e, "native ANN unavailable, using cosine scan");
                    Ok(Box::new(CosineIndex::from_store(store, embedder)?))
                }
            }
        }
    }
}
