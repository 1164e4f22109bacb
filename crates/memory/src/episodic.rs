//! Episodic memory: per-event, timestamped, session-scoped, optionally
//! vector-indexed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embed::Embedder;
use crate::schema::{
    self, ForgetPolicy, MemoryItem, MemoryQuery, MemoryType, RetrievalSource, ScoredMemory,
    TierStats, item_from_payload, item_to_payload,
};
use crate::vector::{Distance, Filter, PayloadIndexKind, VectorPoint, VectorStore};

pub const DEFAULT_SESSION: &str = "default_session";

/// Payload fields indexed for filtered search.
const INDEXED_FIELDS: &[&str] = &["memory_type", "user_id", "memory_id", "session_id", "timestamp"];

pub struct EpisodicMemory {
    items: HashMap<Uuid, MemoryItem>,
    /// Ordered list of episode ids, append-only within a process.
    timeline: Vec<Uuid>,
    /// session id → episode ids, in arrival order.
    sessions: HashMap<String, Vec<Uuid>>,
    vector: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    collection: String,
    max_capacity: usize,
    collection_ready: bool,
}

impl EpisodicMemory {
    pub fn new(collection: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            timeline: Vec::new(),
            sessions: HashMap::new(),
            vector: None,
            embedder: None,
            collection: collection.into(),
            max_capacity: max_capacity.max(1),
            collection_ready: false,
        }
    }

    pub fn with_vector(mut self, store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        self.vector = Some(store);
        self.embedder = Some(embedder);
        self
    }

    fn vector_parts(&self) -> Option<(Arc<dyn VectorStore>, Arc<dyn Embedder>)> {
        self.vector.clone().zip(self.embedder.clone())
    }

    async fn ensure_collection(&mut self) {
        if self.collection_ready {
            return;
        }
        let Some((store, embedder)) = self.vector_parts() else {
            return;
        };
        let dim = embedder.dimensions();
        if let Err(err) = store
            .ensure_collection(&self.collection, dim, Distance::Cosine)
            .await
        {
            warn!(%err, collection = %self.collection, "cannot create episodic collection");
            return;
        }
        for field in INDEXED_FIELDS {
            let _ = store
                .create_payload_index(&self.collection, field, PayloadIndexKind::Keyword)
                .await;
        }
        self.collection_ready = true;
    }

    /// Store one episode.  Writes the in-memory map, the session timeline,
    /// the session index, and, when vector storage is enabled, a point
    /// whose payload holds the full restart-safe projection plus
    /// `session_id`.  Returns the item evicted on overflow, if any.
    pub async fn add(
        &mut self,
        mut item: MemoryItem,
        session_id: Option<&str>,
        context: Option<&str>,
    ) -> Option<MemoryItem> {
        let session = session_id.unwrap_or(DEFAULT_SESSION).to_string();
        item.metadata
            .insert("session_id".to_string(), json!(session));
        if let Some(context) = context {
            item.metadata.insert("context".to_string(), json!(context));
        }

        self.write_vector_point(&item).await;

        let id = item.id;
        self.items.insert(id, item);
        self.timeline.push(id);
        self.sessions.entry(session).or_default().push(id);

        if self.items.len() > self.max_capacity {
            if let Some(victim) = schema::eviction_victim(self.items.values()) {
                let evicted = self.remove(&victim).await;
                debug!(id = %victim, "episodic capacity eviction");
                return evicted;
            }
        }
        None
    }

    /// Vector-write failure degrades: log and continue, the in-memory copy
    /// still exists.
    async fn write_vector_point(&mut self, item: &MemoryItem) {
        self.ensure_collection().await;
        if !self.collection_ready {
            return;
        }
        let Some((store, embedder)) = self.vector_parts() else {
            return;
        };
        let vector = match embedder.embed(&item.content).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(%err, "episodic embedding failed, keeping in-memory copy only");
                return;
            }
        };
        let point = VectorPoint {
            id: item.id.to_string(),
            vector,
            payload: item_to_payload(item),
        };
        if let Err(err) = store.upsert(&self.collection, vec![point]).await {
            warn!(%err, "episodic vector write failed, keeping in-memory copy only");
        }
    }

    /// Hybrid retrieval: ANN over the episodic collection first, keyword
    /// fill if short, final sort by timestamp descending.
    ///
    /// Vector hits missing from the in-memory map are rebuilt from their
    /// payload and re-inserted, which is what makes retrieval survive a
    /// process restart.
    pub async fn retrieve(&mut self, query: &MemoryQuery) -> Vec<ScoredMemory> {
        let mut results: Vec<ScoredMemory> = Vec::new();
        let mut seen: Vec<Uuid> = Vec::new();

        self.ensure_collection().await;
        if self.collection_ready {
            if let Some((store, embedder)) = self.vector_parts() {
                match embedder.embed(&query.query).await {
                    Ok(vector) => {
                        let mut filter =
                            Filter::new().must("memory_type", json!(MemoryType::Episodic.as_str()));
                        if let Some(ref user) = query.user_id {
                            filter = filter.must("user_id", json!(user));
                        }
                        if let Some(ref session) = query.session_id {
                            filter = filter.must("session_id", json!(session));
                        }
                        match store
                            .search(&self.collection, &vector, query.limit * 2, None, Some(&filter))
                            .await
                        {
                            Ok(hits) => {
                                for hit in hits {
                                    let Some(scored) = self.hydrate_hit(&hit.payload, hit.score)
                                    else {
                                        continue;
                                    };
                                    if query
                                        .min_importance
                                        .is_none_or(|min| scored.item.importance >= min)
                                    {
                                        seen.push(scored.item.id);
                                        results.push(scored);
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(%err, "episodic vector search failed, falling back to keyword");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "query embedding failed, falling back to keyword");
                    }
                }
            }
        }

        if results.len() < query.limit {
            let needle = query.query.to_lowercase();
            let mut fill: Vec<ScoredMemory> = self
                .items
                .values()
                .filter(|item| !seen.contains(&item.id))
                .filter(|item| needle.is_empty() || item.content.to_lowercase().contains(&needle))
                .filter(|item| {
                    query
                        .user_id
                        .as_deref()
                        .is_none_or(|user| item.user_id == user)
                })
                .filter(|item| {
                    query.session_id.as_deref().is_none_or(|session| {
                        item.metadata.get("session_id").and_then(|v| v.as_str())
                            == Some(session)
                    })
                })
                .filter(|item| {
                    query
                        .min_importance
                        .is_none_or(|min| item.importance >= min)
                })
                .map(|item| ScoredMemory {
                    item: item.clone(),
                    score: item.importance,
                    source: RetrievalSource::Keyword,
                })
                .collect();
            fill.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
            fill.truncate(query.limit - results.len());
            results.extend(fill);
        }

        results.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
        results.truncate(query.limit);
        results
    }

    /// Hydrate a vector hit: prefer the live map, otherwise rebuild from the
    /// payload, re-insert, and tag with the ANN score.
    fn hydrate_hit(&mut self, payload: &schema::JsonMap, score: f32) -> Option<ScoredMemory> {
        let rebuilt = item_from_payload(payload)?;
        let item = match self.items.get(&rebuilt.id) {
            Some(live) => live.clone(),
            None => {
                debug!(id = %rebuilt.id, "rebuilding episodic item from payload");
                let session = rebuilt
                    .metadata
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_SESSION)
                    .to_string();
                self.sessions.entry(session).or_default().push(rebuilt.id);
                self.items.insert(rebuilt.id, rebuilt.clone());
                rebuilt
            }
        };
        Some(ScoredMemory {
            item,
            score,
            source: RetrievalSource::Vector,
        })
    }

    /// Re-embeds iff content changed; an importance-only change touches only
    /// the in-memory record.
    pub async fn update(
        &mut self,
        id: &Uuid,
        content: Option<String>,
        importance: Option<f32>,
    ) -> bool {
        let Some(item) = self.items.get_mut(id) else {
            return false;
        };
        let mut content_changed = false;
        if let Some(content) = content {
            if content != item.content {
                item.content = content;
                content_changed = true;
            }
        }
        if let Some(importance) = importance {
            item.set_importance(importance);
        }
        if content_changed {
            let snapshot = item.clone();
            self.write_vector_point(&snapshot).await;
        }
        true
    }

    pub async fn remove(&mut self, id: &Uuid) -> Option<MemoryItem> {
        let removed = self.items.remove(id)?;
        self.timeline.retain(|t| t != id);
        for ids in self.sessions.values_mut() {
            ids.retain(|t| t != id);
        }
        if self.collection_ready {
            if let Some(store) = self.vector.as_ref() {
                if let Err(err) = store
                    .delete_by_ids(&self.collection, &[id.to_string()])
                    .await
                {
                    warn!(%err, "episodic vector delete failed");
                }
            }
        }
        Some(removed)
    }

    /// Apply a forgetting policy; returns how many items were dropped.
    pub async fn forget(&mut self, policy: ForgetPolicy) -> usize {
        let victims: Vec<Uuid> = match policy {
            ForgetPolicy::ImportanceBased { threshold } => self
                .items
                .values()
                .filter(|item| item.importance < threshold)
                .map(|item| item.id)
                .collect(),
            ForgetPolicy::TimeBased { max_age_days } => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(max_age_days);
                self.items
                    .values()
                    .filter(|item| item.timestamp < cutoff)
                    .map(|item| item.id)
                    .collect()
            }
            ForgetPolicy::CapacityBased { target } => {
                let mut victims = Vec::new();
                let excess = self.items.len().saturating_sub(target);
                let mut pool: Vec<&MemoryItem> = self.items.values().collect();
                pool.sort_by(|a, b| {
                    a.importance
                        .total_cmp(&b.importance)
                        .then(a.timestamp.cmp(&b.timestamp))
                });
                for item in pool.into_iter().take(excess) {
                    victims.push(item.id);
                }
                victims
            }
        };
        let dropped = victims.len();
        for id in victims {
            self.remove(&id).await;
        }
        dropped
    }

    pub fn get(&self, id: &Uuid) -> Option<&MemoryItem> {
        self.items.get(id)
    }

    pub fn get_all(&self) -> Vec<&MemoryItem> {
        self.items.values().collect()
    }

    /// Episode ids of one session, in arrival order.
    pub fn session_items(&self, session_id: &str) -> Vec<&MemoryItem> {
        self.sessions
            .get(session_id)
            .map(|ids| ids.iter().filter_map(|id| self.items.get(id)).collect())
            .unwrap_or_default()
    }

    /// Drop the in-memory caches, keeping the vector collection.  Retrieval
    /// then rebuilds items from payloads, exactly as after a restart.
    pub fn drop_caches(&mut self) {
        self.items.clear();
        self.timeline.clear();
        self.sessions.clear();
    }

    pub async fn clear(&mut self) {
        self.drop_caches();
        if self.collection_ready {
            if let Some(store) = self.vector.as_ref() {
                let _ = store.clear(&self.collection).await;
            }
        }
    }

    pub fn stats(&self) -> TierStats {
        let avg = if self.items.is_empty() {
            0.0
        } else {
            self.items.values().map(|i| i.importance).sum::<f32>() / self.items.len() as f32
        };
        TierStats {
            count: self.items.len(),
            total_count: self.items.len(),
            avg_importance: avg,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::embed::SimpleEmbedder;
    use crate::vector::MemoryVectorStore;

    use super::*;

    fn item(content: &str, user: &str, importance: f32) -> MemoryItem {
        MemoryItem::new(content, MemoryType::Episodic, user).with_importance(importance)
    }

    fn vector_tier() -> EpisodicMemory {
        EpisodicMemory::new("episodic_test", 100).with_vector(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(SimpleEmbedder::new(64)),
        )
    }

    #[tokio::test]
    async fn add_groups_by_session_with_default() {
        let mut memory = EpisodicMemory::new("ep", 10);
        memory.add(item("went hiking", "u1", 0.5), None, None).await;
        memory
            .add(item("met Alice", "u1", 0.5), Some("trip"), Some("travel journal"))
            .await;

        assert_eq!(memory.session_items(DEFAULT_SESSION).len(), 1);
        let trip = memory.session_items("trip");
        assert_eq!(trip.len(), 1);
        assert_eq!(trip[0].metadata["context"], json!("travel journal"));
    }

    #[tokio::test]
    async fn keyword_retrieve_without_vector_store() {
        let mut memory = EpisodicMemory::new("ep", 10);
        memory
            .add(item("discussed the roadmap yesterday", "u1", 0.7), None, None)
            .await;
        memory.add(item("lunch break", "u1", 0.2), None, None).await;

        let hits = memory
            .retrieve(&MemoryQuery::new("roadmap", 5).for_user("u1"))
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, RetrievalSource::Keyword);
    }

    #[tokio::test]
    async fn vector_retrieve_tags_source_and_score() {
        let mut memory = vector_tier();
        memory
            .add(item("visited the Louvre in Paris", "u1", 0.8), None, None)
            .await;

        let hits = memory
            .retrieve(&MemoryQuery::new("visited the Louvre in Paris", 5).for_user("u1"))
            .await;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source, RetrievalSource::Vector);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn retrieval_rebuilds_from_payload_after_cache_drop() {
        let mut memory = vector_tier();
        let original = item("took the train to Berlin", "u1", 0.9);
        let original_id = original.id;
        memory.add(original, Some("travel"), None).await;

        memory.drop_caches();
        assert!(memory.get(&original_id).is_none());

        let hits = memory
            .retrieve(&MemoryQuery::new("train to Berlin", 5).for_user("u1"))
            .await;
        assert_eq!(hits.len(), 1);
        let rebuilt = &hits[0];
        assert_eq!(rebuilt.item.id, original_id);
        assert_eq!(rebuilt.item.content, "took the train to Berlin");
        assert_eq!(rebuilt.item.user_id, "u1");
        assert_eq!(rebuilt.source, RetrievalSource::Vector);
        assert_eq!(rebuilt.item.metadata["session_id"], json!("travel"));
        // The map is warm again.
        assert!(memory.get(&original_id).is_some());
    }

    #[tokio::test]
    async fn session_filter_applies_to_vector_search() {
        let mut memory = vector_tier();
        memory
            .add(item("sprint planning notes", "u1", 0.6), Some("work"), None)
            .await;
        memory
            .add(item("sprint retro notes", "u1", 0.6), Some("other"), None)
            .await;

        let hits = memory
            .retrieve(
                &MemoryQuery::new("sprint notes", 5)
                    .for_user("u1")
                    .in_session("work"),
            )
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item.metadata["session_id"], json!("work"));
    }

    #[tokio::test]
    async fn results_sorted_by_timestamp_descending() {
        let mut memory = EpisodicMemory::new("ep", 10);
        let mut older = item("meeting notes alpha", "u1", 0.9);
        older.timestamp = chrono::Utc::now() - chrono::Duration::hours(2);
        memory.add(older, None, None).await;
        memory.add(item("meeting notes beta", "u1", 0.1), None, None).await;

        let hits = memory.retrieve(&MemoryQuery::new("meeting notes", 5)).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.content, "meeting notes beta");
    }

    #[tokio::test]
    async fn capacity_eviction_drops_lowest_importance() {
        let mut memory = EpisodicMemory::new("ep", 2);
        memory.add(item("keep high", "u", 0.9), None, None).await;
        memory.add(item("drop low", "u", 0.1), None, None).await;
        let evicted = memory.add(item("keep mid", "u", 0.5), None, None).await;

        assert_eq!(evicted.unwrap().content, "drop low");
        assert_eq!(memory.stats().count, 2);
    }

    #[tokio::test]
    async fn forget_policies() {
        let mut memory = EpisodicMemory::new("ep", 100);
        memory.add(item("trivial", "u", 0.1), None, None).await;
        memory.add(item("useful", "u", 0.6), None, None).await;
        memory.add(item("vital", "u", 0.95), None, None).await;

        let dropped = memory
            .forget(ForgetPolicy::ImportanceBased { threshold: 0.5 })
            .await;
        assert_eq!(dropped, 1);
        assert_eq!(memory.stats().count, 2);

        let mut ancient = item("from last year", "u", 0.9);
        ancient.timestamp = chrono::Utc::now() - chrono::Duration::days(400);
        memory.add(ancient, None, None).await;
        let dropped = memory
            .forget(ForgetPolicy::TimeBased { max_age_days: 30 })
            .await;
        assert_eq!(dropped, 1);

        let dropped = memory.forget(ForgetPolicy::CapacityBased { target: 1 }).await;
        assert_eq!(dropped, 1);
        let remaining = memory.get_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "vital");
    }

    #[tokio::test]
    async fn update_reembeds_only_on_content_change() {
        let store = Arc::new(MemoryVectorStore::new());
        let mut memory = EpisodicMemory::new("ep_upd", 10)
            .with_vector(store.clone(), Arc::new(SimpleEmbedder::new(64)));
        let original = item("draft text", "u", 0.5);
        let id = original.id;
        memory.add(original, None, None).await;

        // Importance-only: vector point untouched (still matches old content).
        memory.update(&id, None, Some(0.9)).await;
        assert_eq!(memory.get(&id).unwrap().importance, 0.9);

        // Content change rewrites the stored vector.
        memory.update(&id, Some("final text".to_string()), None).await;
        memory.drop_caches();
        let hits = memory.retrieve(&MemoryQuery::new("final text", 5)).await;
        assert_eq!(hits[0].item.content, "final text");
    }
}
