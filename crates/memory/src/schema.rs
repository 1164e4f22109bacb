//! Shared value types for the memory subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub type JsonMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Working,
    Episodic,
    Semantic,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "working" => Some(MemoryType::Working),
            "episodic" => Some(MemoryType::Episodic),
            "semantic" => Some(MemoryType::Semantic),
            _ => None,
        }
    }
}

/// One stored memory.  `timestamp` is immutable after creation; `importance`
/// is clamped to `[0, 1]` wherever it is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: Uuid,
    pub content: String,
    pub memory_type: MemoryType,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub importance: f32,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl MemoryItem {
    pub fn new(content: impl Into<String>, memory_type: MemoryType, user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            memory_type,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            importance: 0.5,
            metadata: JsonMap::new(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn set_importance(&mut self, importance: f32) {
        self.importance = importance.clamp(0.0, 1.0);
    }
}

/// How a retrieval hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Keyword,
}

impl RetrievalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalSource::Vector => "vector",
            RetrievalSource::Keyword => "keyword",
        }
    }
}

/// A retrieval hit: the item plus its relevance score and provenance.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f32,
    pub source: RetrievalSource,
}

/// Per-tier statistics.  `count` is the live view; `total_count` includes
/// entries hidden by TTL but not yet evicted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
    pub count: usize,
    pub total_count: usize,
    pub avg_importance: f32,
}

/// Forgetting policies shared by the long-term tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForgetPolicy {
    /// Drop items with `importance < threshold`.
    ImportanceBased { threshold: f32 },
    /// Drop items older than `max_age_days`.
    TimeBased { max_age_days: i64 },
    /// Evict lowest-importance items until at most `target` remain.
    CapacityBased { target: usize },
}

/// A retrieval request against a tier or the manager.
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub query: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub min_importance: Option<f32>,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            user_id: None,
            session_id: None,
            min_importance: None,
            limit,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn min_importance(mut self, min: f32) -> Self {
        self.min_importance = Some(min);
        self
    }
}

// ── Payload projection ────────────────────────────────────────────────────────

/// Fields of the canonical payload projection.  Everything else found in a
/// payload on read is re-homed under `metadata`, which keeps the store
/// forward-compatible with new optional fields.
const PAYLOAD_FIELDS: &[&str] = &[
    "memory_id",
    "user_id",
    "memory_type",
    "content",
    "importance",
    "timestamp",
];

/// Project an item into the restart-safe payload.  Metadata entries are
/// flattened beside the core fields so filters can address them directly
/// (`session_id`, `category`, …).
pub fn item_to_payload(item: &MemoryItem) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("memory_id".to_string(), json!(item.id.to_string()));
    payload.insert("user_id".to_string(), json!(item.user_id));
    payload.insert("memory_type".to_string(), json!(item.memory_type.as_str()));
    payload.insert("content".to_string(), json!(item.content));
    payload.insert("importance".to_string(), json!(item.importance));
    payload.insert("timestamp".to_string(), json!(item.timestamp.to_rfc3339()));
    for (key, value) in &item.metadata {
        if !PAYLOAD_FIELDS.contains(&key.as_str()) {
            payload.insert(key.clone(), value.clone());
        }
    }
    payload
}

/// Rebuild an item from a payload.  Lossless for the core fields; unknown
/// payload keys land in `metadata`.
pub fn item_from_payload(payload: &JsonMap) -> Option<MemoryItem> {
    let id = payload
        .get("memory_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())?;
    let content = payload.get("content")?.as_str()?.to_string();
    let memory_type = payload
        .get("memory_type")
        .and_then(|v| v.as_str())
        .and_then(MemoryType::parse)?;
    let user_id = payload
        .get("user_id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let importance = payload
        .get("importance")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5) as f32;
    let timestamp = payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut metadata = JsonMap::new();
    for (key, value) in payload {
        if !PAYLOAD_FIELDS.contains(&key.as_str()) {
            metadata.insert(key.clone(), value.clone());
        }
    }

    Some(MemoryItem {
        id,
        content,
        memory_type,
        user_id,
        timestamp,
        importance: importance.clamp(0.0, 1.0),
        metadata,
    })
}

// ── Shared tier helpers ───────────────────────────────────────────────────────

/// The single-item eviction rule: lowest importance, ties broken by oldest
/// timestamp.
pub(crate) fn eviction_victim<'a, I>(items: I) -> Option<Uuid>
where
    I: Iterator<Item = &'a MemoryItem>,
{
    items
        .min_by(|a, b| {
            a.importance
                .total_cmp(&b.importance)
                .then(a.timestamp.cmp(&b.timestamp))
        })
        .map(|item| item.id)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
