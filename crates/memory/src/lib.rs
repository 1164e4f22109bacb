//! Layered memory for conversational agents.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  MemoryManager                                               │
//! │                                                              │
//! │  Working   (capacity-bounded, TTL, in-process only)          │
//! │  Episodic  (session timeline, vector-indexed)                │
//! │  Semantic  (facts/concepts, vector + graph indexed)          │
//! │                                                              │
//! │  VectorStore  (in-process by default, Qdrant via feature)    │
//! │  GraphStore   (entities + typed edges, in-process)           │
//! │  Embedder     (openai / dashscope / simple offline)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The vector payload is the canonical durable projection of a memory item;
//! the in-process maps are caches rebuilt lazily from payloads on read.

pub mod embed;
pub mod episodic;
pub mod graph;
pub mod manager;
pub mod schema;
pub mod semantic;
pub mod vector;
pub mod working;

pub use embed::{Embedder, HttpEmbedder, SimpleEmbedder, embedder_from_config};
pub use episodic::EpisodicMemory;
pub use graph::{Entity, GraphStore, Relation, RelatedEntity};
pub use manager::{MemoryManager, MemoryStats};
pub use schema::{
    ForgetPolicy, MemoryItem, MemoryQuery, MemoryType, RetrievalSource, ScoredMemory, TierStats,
};
pub use semantic::SemanticMemory;
pub use vector::{
    CollectionInfo, Distance, FieldMatch, Filter, MemoryVectorStore, PayloadIndexKind, SearchHit,
    VectorPoint, VectorStore,
};
pub use working::WorkingMemory;

/// Failures inside the memory subsystem.  Store failures are usually
/// degraded at the call site (vector-write → log and continue, vector-read →
/// keyword fallback, graph → empty results) rather than propagated.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("vector store failure: {0}")]
    Store(String),
    #[error("embedding failure: {0}")]
    Embedding(String),
    #[error("graph store failure: {0}")]
    Graph(String),
    #[error("memory item not found: {0}")]
    NotFound(uuid::Uuid),
}
