//! Vector store adapter.
//!
//! The default backend is an in-process store, which keeps local operation
//! and tests free of external services; the `qdrant` feature adds a remote
//! Qdrant implementation of the same trait.  All writes are durable (from
//! the trait's point of view) before the call returns.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::MemoryError;
use crate::schema::JsonMap;

#[cfg(feature = "qdrant")]
pub mod qdrant;
#[cfg(feature = "qdrant")]
pub use qdrant::QdrantStore;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl Distance {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Cosine" => Some(Distance::Cosine),
            "Dot" => Some(Distance::Dot),
            "Euclid" => Some(Distance::Euclid),
            _ => None,
        }
    }
}

/// A point to upsert.  The caller's id is preserved verbatim.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: JsonMap,
}

/// One equality condition over a payload field.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    pub field: String,
    pub value: Value,
}

/// AND-composed equality filter.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub must: Vec<FieldMatch>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(FieldMatch {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, payload: &JsonMap) -> bool {
        self.must
            .iter()
            .all(|m| payload.get(&m.field) == Some(&m.value))
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: JsonMap,
}

/// Payload index kinds for the common filter fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadIndexKind {
    Keyword,
    Float,
    Integer,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub points: usize,
    pub dimension: usize,
}

// ── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if absent; an existing collection keeps its
    /// original distance metric.
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<(), MemoryError>;

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        kind: PayloadIndexKind,
    ) -> Result<(), MemoryError>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), MemoryError>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>, MemoryError>;

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<(), MemoryError>;

    /// OR-of-equalities delete over one field.
    async fn delete_by_filter(
        &self,
        collection: &str,
        field: &str,
        any_of: &[Value],
    ) -> Result<(), MemoryError>;

    async fn clear(&self, collection: &str) -> Result<(), MemoryError>;

    async fn count(&self, collection: &str) -> Result<usize, MemoryError>;

    async fn info(&self, collection: &str) -> Result<CollectionInfo, MemoryError>;

    async fn health_check(&self) -> Result<(), MemoryError>;
}

// ── In-process implementation ────────────────────────────────────────────────

struct Collection {
    dim: usize,
    distance: Distance,
    points: HashMap<String, (Vec<f32>, JsonMap)>,
}

/// In-process vector store.  Thread-safe via `RwLock`; scoring is exact
/// (linear scan), which is the right trade for in-process collection sizes.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Collection) -> T,
    ) -> Result<T, MemoryError> {
        let collections = self.collections.read().expect("vector store lock poisoned");
        collections
            .get(name)
            .map(f)
            .ok_or_else(|| MemoryError::Store(format!("unknown collection: {name}")))
    }
}

fn similarity(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
    match distance {
        Distance::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if mag_a == 0.0 || mag_b == 0.0 {
                0.0
            } else {
                dot / (mag_a * mag_b)
            }
        }
        Distance::Dot => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        // Mapped so that higher is better, like the other metrics.
        Distance::Euclid => {
            let dist: f32 = a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + dist)
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        collections.entry(name.to_string()).or_insert_with(|| {
            debug!(collection = name, dim, "creating vector collection");
            Collection {
                dim,
                distance,
                points: HashMap::new(),
            }
        });
        Ok(())
    }

    /// Filters are evaluated by payload scan, so the index request only has
    /// to validate that the collection exists.
    async fn create_payload_index(
        &self,
        collection: &str,
        _field: &str,
        _kind: PayloadIndexKind,
    ) -> Result<(), MemoryError> {
        self.with_collection(collection, |_| ())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| MemoryError::Store(format!("unknown collection: {collection}")))?;
        for point in points {
            if point.vector.len() != coll.dim {
                return Err(MemoryError::Store(format!(
                    "dimension mismatch in '{collection}': expected {}, got {}",
                    coll.dim,
                    point.vector.len()
                )));
            }
            coll.points.insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        self.with_collection(collection, |coll| {
            let mut hits: Vec<SearchHit> = coll
                .points
                .iter()
                .filter(|(_, (_, payload))| filter.is_none_or(|f| f.matches(payload)))
                .map(|(id, (stored, payload))| SearchHit {
                    id: id.clone(),
                    score: similarity(coll.distance, vector, stored),
                    payload: payload.clone(),
                })
                .filter(|hit| score_threshold.is_none_or(|t| hit.score >= t))
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(limit);
            hits
        })
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        if let Some(coll) = collections.get_mut(collection) {
            for id in ids {
                coll.points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        field: &str,
        any_of: &[Value],
    ) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        if let Some(coll) = collections.get_mut(collection) {
            coll.points
                .retain(|_, (_, payload)| match payload.get(field) {
                    Some(value) => !any_of.contains(value),
                    None => true,
                });
        }
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), MemoryError> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        if let Some(coll) = collections.get_mut(collection) {
            coll.points.clear();
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        self.with_collection(collection, |coll| coll.points.len())
    }

    async fn info(&self, collection: &str) -> Result<CollectionInfo, MemoryError> {
        self.with_collection(collection, |coll| CollectionInfo {
            name: collection.to_string(),
            points: coll.points.len(),
            dimension: coll.dim,
        })
    }

    async fn health_check(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
