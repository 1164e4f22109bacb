//! `MemoryManager`: the façade over the three tiers.
//!
//! Routes by memory type, auto-classifies unlabeled content, scores
//! importance, fans retrieval out across tiers, and coordinates
//! consolidation and forgetting.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::embed::{Embedder, embedder_from_config};
use crate::episodic::EpisodicMemory;
use crate::graph::{Entity, Relation, RelatedEntity};
use crate::schema::{
    ForgetPolicy, JsonMap, MemoryItem, MemoryQuery, MemoryType, ScoredMemory, TierStats,
};
use crate::semantic::SemanticMemory;
use crate::vector::{MemoryVectorStore, VectorStore};
use crate::working::WorkingMemory;
use crate::MemoryError;

// ── Heuristics ────────────────────────────────────────────────────────────────

/// Temporal / narrative words that mark content as episodic.
const EPISODIC_TRIGGERS: &[&str] = &[
    "yesterday", "today", "tomorrow", "last week", "remember", "happened", "we discussed",
    "earlier", "昨天", "今天", "明天", "上周", "记得", "发生", "之前",
];

/// Definitional words that mark content as semantic.
const SEMANTIC_TRIGGERS: &[&str] = &[
    "definition", "concept", "rule", "principle", "means", "is defined", "refers to", "theory",
    "定义", "概念", "规则", "原理", "意味着", "理论",
];

/// Words that bump the importance heuristic.
pub const IMPORTANCE_KEYWORDS: &[&str] = &[
    "important", "critical", "urgent", "must", "remember", "key", "essential",
    "重要", "关键", "紧急", "必须", "记住",
];

/// Pick a tier for unlabeled content: `metadata.type` wins, then the
/// episodic trigger list, then the semantic one; everything else is working.
pub fn classify_content(content: &str, metadata: &JsonMap) -> MemoryType {
    if let Some(explicit) = metadata
        .get("type")
        .and_then(|v| v.as_str())
        .and_then(MemoryType::parse)
    {
        return explicit;
    }
    let lower = content.to_lowercase();
    if EPISODIC_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return MemoryType::Episodic;
    }
    if SEMANTIC_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return MemoryType::Semantic;
    }
    MemoryType::Working
}

/// Importance heuristic: base 0.5, +0.1 for long content, +0.2 for an
/// importance keyword, ±adjustment from `metadata.priority`, clamped.
pub fn score_importance(content: &str, metadata: &JsonMap) -> f32 {
    let mut score = 0.5f32;
    if content.chars().count() > 100 {
        score += 0.1;
    }
    let lower = content.to_lowercase();
    if IMPORTANCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 0.2;
    }
    match metadata.get("priority").and_then(|v| v.as_str()) {
        Some("low") => score -= 0.2,
        Some("high") => score += 0.3,
        _ => {}
    }
    score.clamp(0.0, 1.0)
}

// ── Stats ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub working: TierStats,
    pub episodic: TierStats,
    pub semantic: TierStats,
}

impl MemoryStats {
    pub fn total(&self) -> usize {
        self.working.count + self.episodic.count + self.semantic.count
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct MemoryManager {
    working: WorkingMemory,
    episodic: EpisodicMemory,
    semantic: SemanticMemory,
}

impl MemoryManager {
    /// Keyword-only manager: no vector index, no embeddings.
    pub fn new(config: &cortex_config::MemoryConfig) -> Self {
        Self {
            working: WorkingMemory::new(
                config.working_memory_capacity,
                config.working_memory_ttl_minutes,
            ),
            episodic: EpisodicMemory::new(&config.episodic_collection, config.episodic_max_capacity),
            semantic: SemanticMemory::new(&config.semantic_collection, config.semantic_max_capacity),
        }
    }

    /// Manager with vector-indexed long-term tiers.  The store and embedder
    /// are shared; pointing two managers at the same store is how restarts
    /// are modelled (and tested).
    pub fn with_stores(
        config: &cortex_config::MemoryConfig,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            working: WorkingMemory::new(
                config.working_memory_capacity,
                config.working_memory_ttl_minutes,
            ),
            episodic: EpisodicMemory::new(&config.episodic_collection, config.episodic_max_capacity)
                .with_vector(Arc::clone(&vector), Arc::clone(&embedder)),
            semantic: SemanticMemory::new(&config.semantic_collection, config.semantic_max_capacity)
                .with_vector(vector, embedder),
        }
    }

    /// Build from the full application config: embedding backend from
    /// `EMBED_*`, in-process vector store unless disabled.
    pub fn from_app_config(config: &cortex_config::AppConfig) -> Result<Self, MemoryError> {
        if !config.memory.vector_storage_enabled {
            return Ok(Self::new(&config.memory));
        }
        let embedder = embedder_from_config(&config.embed)?;
        let vector: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        Ok(Self::with_stores(&config.memory, vector, embedder))
    }

    /// Same wiring against a remote Qdrant deployment.
    #[cfg(feature = "qdrant")]
    pub fn with_qdrant(config: &cortex_config::AppConfig) -> Result<Self, MemoryError> {
        let embedder = embedder_from_config(&config.embed)?;
        let vector: Arc<dyn VectorStore> =
            Arc::new(crate::vector::QdrantStore::connect(&config.qdrant)?);
        Ok(Self::with_stores(&config.memory, vector, embedder))
    }

    // ── Add ──────────────────────────────────────────────────────────────────

    /// Store new content.  Classification and importance scoring run when
    /// the caller leaves them unspecified; the resulting importance is
    /// always clamped to `[0, 1]`.
    pub async fn add_memory(
        &mut self,
        content: &str,
        user_id: &str,
        memory_type: Option<MemoryType>,
        metadata: JsonMap,
    ) -> MemoryItem {
        let memory_type = memory_type.unwrap_or_else(|| classify_content(content, &metadata));
        let importance = match metadata.get("importance").and_then(|v| v.as_f64()) {
            Some(explicit) => (explicit as f32).clamp(0.0, 1.0),
            None => score_importance(content, &metadata),
        };
        let item = MemoryItem::new(content, memory_type, user_id)
            .with_importance(importance)
            .with_metadata(metadata);
        debug!(id = %item.id, tier = memory_type.as_str(), importance, "adding memory");
        self.route_add(item.clone()).await;
        item
    }

    async fn route_add(&mut self, item: MemoryItem) {
        match item.memory_type {
            MemoryType::Working => {
                self.working.add(item);
            }
            MemoryType::Episodic => {
                let session = item
                    .metadata
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let context = item
                    .metadata
                    .get("context")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                self.episodic
                    .add(item, session.as_deref(), context.as_deref())
                    .await;
            }
            MemoryType::Semantic => {
                self.semantic.add(item).await;
            }
        }
    }

    // ── Retrieve ─────────────────────────────────────────────────────────────

    /// Fan out over the tiers with `per_type_limit = ceil(limit / tiers)`,
    /// union, sort by importance descending, truncate.  A failing tier is
    /// logged and skipped; it never aborts the call.
    pub async fn retrieve_memories(&mut self, query: &MemoryQuery) -> Vec<ScoredMemory> {
        let per_type_limit = query.limit.div_ceil(3).max(1);
        let tier_query = MemoryQuery {
            limit: per_type_limit,
            ..query.clone()
        };

        let mut results: Vec<ScoredMemory> = Vec::new();
        results.extend(self.working.retrieve(&tier_query));
        results.extend(self.episodic.retrieve(&tier_query).await);
        results.extend(self.semantic.retrieve(&tier_query).await);

        results.sort_by(|a, b| b.item.importance.total_cmp(&a.item.importance));
        results.truncate(query.limit);
        results
    }

    // ── Update / remove ──────────────────────────────────────────────────────

    pub async fn update_memory(
        &mut self,
        memory_type: MemoryType,
        id: &Uuid,
        content: Option<String>,
        importance: Option<f32>,
    ) -> bool {
        match memory_type {
            MemoryType::Working => self.working.update(id, content, importance),
            MemoryType::Episodic => self.episodic.update(id, content, importance).await,
            MemoryType::Semantic => self.semantic.update(id, content, importance).await,
        }
    }

    pub async fn remove_memory(&mut self, memory_type: MemoryType, id: &Uuid) -> Option<MemoryItem> {
        match memory_type {
            MemoryType::Working => self.working.remove(id),
            MemoryType::Episodic => self.episodic.remove(id).await,
            MemoryType::Semantic => self.semantic.remove(id).await,
        }
    }

    // ── Consolidation ────────────────────────────────────────────────────────

    /// Promote items with `importance ≥ threshold` from one tier to another:
    /// the source item is removed and a fresh item (new id) is created in
    /// the target with importance ×1.1 capped at 1 and a
    /// `consolidated_from` marker.
    pub async fn consolidate(
        &mut self,
        from: MemoryType,
        to: MemoryType,
        threshold: f32,
    ) -> usize {
        if from == to {
            return 0;
        }
        let candidates: Vec<MemoryItem> = match from {
            MemoryType::Working => self.working.get_all().into_iter().cloned().collect(),
            MemoryType::Episodic => self.episodic.get_all().into_iter().cloned().collect(),
            MemoryType::Semantic => self.semantic.get_all().into_iter().cloned().collect(),
        };

        let mut moved = 0;
        for source in candidates {
            if source.importance < threshold {
                continue;
            }
            if self.remove_memory(from, &source.id).await.is_none() {
                continue;
            }
            let mut metadata = source.metadata.clone();
            metadata.insert("consolidated_from".to_string(), json!(from.as_str()));
            let promoted = MemoryItem::new(&source.content, to, &source.user_id)
                .with_importance((source.importance * 1.1).min(1.0))
                .with_metadata(metadata);
            self.route_add(promoted).await;
            moved += 1;
        }
        if moved > 0 {
            info!(from = from.as_str(), to = to.as_str(), moved, "consolidation complete");
        }
        moved
    }

    // ── Forgetting ───────────────────────────────────────────────────────────

    /// Delegate to the tier's forget policy.
    pub async fn forget(&mut self, tier: MemoryType, policy: ForgetPolicy) -> usize {
        match tier {
            MemoryType::Working => self.forget_working(policy),
            MemoryType::Episodic => self.episodic.forget(policy).await,
            MemoryType::Semantic => self.semantic.forget(policy).await,
        }
    }

    fn forget_working(&mut self, policy: ForgetPolicy) -> usize {
        let victims: Vec<Uuid> = match policy {
            ForgetPolicy::ImportanceBased { threshold } => self
                .working
                .get_all()
                .into_iter()
                .filter(|item| item.importance < threshold)
                .map(|item| item.id)
                .collect(),
            ForgetPolicy::TimeBased { max_age_days } => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(max_age_days);
                self.working
                    .get_all()
                    .into_iter()
                    .filter(|item| item.timestamp < cutoff)
                    .map(|item| item.id)
                    .collect()
            }
            ForgetPolicy::CapacityBased { target } => {
                let all = self.working.get_all();
                let excess = all.len().saturating_sub(target);
                let mut pool = all;
                pool.sort_by(|a, b| {
                    a.importance
                        .total_cmp(&b.importance)
                        .then(a.timestamp.cmp(&b.timestamp))
                });
                pool.into_iter().take(excess).map(|item| item.id).collect()
            }
        };
        let dropped = victims.len();
        for id in victims {
            self.working.remove(&id);
        }
        dropped
    }

    // ── Graph pass-through ───────────────────────────────────────────────────

    pub fn add_entity(&self, entity: Entity) -> Result<(), MemoryError> {
        self.semantic.add_entity(entity)
    }

    pub fn add_relation(&self, relation: Relation) -> Result<(), MemoryError> {
        self.semantic.add_relation(relation)
    }

    pub fn find_related_entities(
        &self,
        entity_id: &str,
        max_depth: usize,
        limit: usize,
    ) -> Vec<RelatedEntity> {
        self.semantic.find_related_entities(entity_id, max_depth, limit)
    }

    pub fn search_entities(
        &self,
        name_pattern: &str,
        entity_types: Option<&[String]>,
        limit: usize,
    ) -> Vec<Entity> {
        self.semantic.search_entities(name_pattern, entity_types, limit)
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            working: self.working.stats(),
            episodic: self.episodic.stats(),
            semantic: self.semantic.stats(),
        }
    }

    pub async fn clear_all(&mut self) {
        self.working.clear();
        self.episodic.clear().await;
        self.semantic.clear().await;
    }

    /// Release external resources.  The graph driver is closed here; vector
    /// client pools are torn down by the host.
    pub fn close(&mut self) {
        self.semantic.close();
        info!("memory manager closed");
    }

    pub fn working(&mut self) -> &mut WorkingMemory {
        &mut self.working
    }

    pub fn episodic(&mut self) -> &mut EpisodicMemory {
        &mut self.episodic
    }

    pub fn semantic(&mut self) -> &mut SemanticMemory {
        &mut self.semantic
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
