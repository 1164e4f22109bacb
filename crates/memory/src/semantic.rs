//! Semantic memory: facts and concepts, with a word-level concept index for
//! keyword fallback plus optional vector and graph indices.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embed::Embedder;
use crate::graph::{Entity, GraphStore, Relation, RelatedEntity};
use crate::schema::{
    self, ForgetPolicy, MemoryItem, MemoryQuery, MemoryType, RetrievalSource, ScoredMemory,
    TierStats, item_from_payload, item_to_payload,
};
use crate::vector::{Distance, Filter, PayloadIndexKind, VectorPoint, VectorStore};
use crate::MemoryError;

const INDEXED_FIELDS: &[&str] = &["memory_type", "category", "user_id", "memory_id", "timestamp"];

/// Words of at least this length participate in the concept index.
const MIN_CONCEPT_WORD_LEN: usize = 3;

pub struct SemanticMemory {
    items: HashMap<Uuid, MemoryItem>,
    /// word → ids of items containing it.
    concept_index: HashMap<String, HashSet<Uuid>>,
    vector: Option<Arc<dyn VectorStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    graph: GraphStore,
    collection: String,
    max_capacity: usize,
    collection_ready: bool,
}

fn index_words(content: &str) -> impl Iterator<Item = String> + '_ {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_CONCEPT_WORD_LEN)
        .map(|w| w.to_lowercase())
}

impl SemanticMemory {
    pub fn new(collection: impl Into<String>, max_capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            concept_index: HashMap::new(),
            vector: None,
            embedder: None,
            graph: GraphStore::new(),
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
            warn!(%err, collection = %self.collection, "cannot create semantic collection");
            return;
        }
        for field in INDEXED_FIELDS {
            let _ = store
                .create_payload_index(&self.collection, field, PayloadIndexKind::Keyword)
                .await;
        }
        self.collection_ready = true;
    }

    fn index_item(&mut self, item: &MemoryItem) {
        for word in index_words(&item.content) {
            self.concept_index.entry(word).or_default().insert(item.id);
        }
    }

    fn unindex_item(&mut self, item: &MemoryItem) {
        for word in index_words(&item.content) {
            if let Some(ids) = self.concept_index.get_mut(&word) {
                ids.remove(&item.id);
                if ids.is_empty() {
                    self.concept_index.remove(&word);
                }
            }
        }
    }

    /// Store one fact: index its words, write the vector point, evict one
    /// lowest-importance item on overflow.
    pub async fn add(&mut self, item: MemoryItem) -> Option<MemoryItem> {
        self.write_vector_point(&item).await;
        self.index_item(&item);
        self.items.insert(item.id, item);

        if self.items.len() > self.max_capacity {
            if let Some(victim) = schema::eviction_victim(self.items.values()) {
                let evicted = self.remove(&victim).await;
                debug!(id = %victim, "semantic capacity eviction");
                return evicted;
            }
        }
        None
    }

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
                warn!(%err, "semantic embedding failed, keeping in-memory copy only");
                return;
            }
        };
        let point = VectorPoint {
            id: item.id.to_string(),
            vector,
            payload: item_to_payload(item),
        };
        if let Err(err) = store.upsert(&self.collection, vec![point]).await {
            warn!(%err, "semantic vector write failed, keeping in-memory copy only");
        }
    }

    /// Hybrid retrieval pinned to `memory_type = "semantic"`: ANN first,
    /// concept-index keyword fill if short.  Hits missing from the map are
    /// rebuilt from their payloads.
    pub async fn retrieve(&mut self, query: &MemoryQuery) -> Vec<ScoredMemory> {
        let mut results: Vec<ScoredMemory> = Vec::new();
        let mut seen: Vec<Uuid> = Vec::new();

        self.ensure_collection().await;
        if self.collection_ready {
            if let Some((store, embedder)) = self.vector_parts() {
                match embedder.embed(&query.query).await {
                    Ok(vector) => {
                        let mut filter =
                            Filter::new().must("memory_type", json!(MemoryType::Semantic.as_str()));
                        if let Some(ref user) = query.user_id {
                            filter = filter.must("user_id", json!(user));
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
                                warn!(%err, "semantic vector search failed, falling back to keyword");
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
            let mut fill = self.keyword_candidates(query, &seen);
            fill.truncate(query.limit - results.len());
            results.extend(fill);
        }

        results.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
        results.truncate(query.limit);
        results
    }

    /// Concept-index lookup: candidates are ranked by how many query words
    /// they share.
    fn keyword_candidates(&self, query: &MemoryQuery, seen: &[Uuid]) -> Vec<ScoredMemory> {
        let mut overlap: HashMap<Uuid, usize> = HashMap::new();
        for word in index_words(&query.query) {
            if let Some(ids) = self.concept_index.get(&word) {
                for id in ids {
                    *overlap.entry(*id).or_default() += 1;
                }
            }
        }
        let mut candidates: Vec<(usize, &MemoryItem)> = overlap
            .into_iter()
            .filter(|(id, _)| !seen.contains(id))
            .filter_map(|(id, count)| self.items.get(&id).map(|item| (count, item)))
            .filter(|(_, item)| {
                query
                    .user_id
                    .as_deref()
                    .is_none_or(|user| item.user_id == user)
            })
            .filter(|(_, item)| {
                query
                    .min_importance
                    .is_none_or(|min| item.importance >= min)
            })
            .collect();
        candidates.sort_by(|(overlap_a, item_a), (overlap_b, item_b)| {
            overlap_b
                .cmp(overlap_a)
                .then(item_b.importance.total_cmp(&item_a.importance))
        });
        candidates
            .into_iter()
            .map(|(_, item)| ScoredMemory {
                item: item.clone(),
                score: item.importance,
                source: RetrievalSource::Keyword,
            })
            .collect()
    }

    fn hydrate_hit(&mut self, payload: &schema::JsonMap, score: f32) -> Option<ScoredMemory> {
        let rebuilt = item_from_payload(payload)?;
        let item = match self.items.get(&rebuilt.id) {
            Some(live) => live.clone(),
            None => {
                debug!(id = %rebuilt.id, "rebuilding semantic item from payload");
                self.index_item(&rebuilt);
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

    /// On content change: old index entries removed, vector rewritten.  On
    /// importance-only change: only the in-memory record is touched.
    pub async fn update(
        &mut self,
        id: &Uuid,
        content: Option<String>,
        importance: Option<f32>,
    ) -> bool {
        let Some(existing) = self.items.get(id) else {
            return false;
        };
        let content_changed = content
            .as_deref()
            .is_some_and(|c| c != existing.content);

        if content_changed {
            let old = existing.clone();
            self.unindex_item(&old);
        }

        let item = self.items.get_mut(id).expect("checked above");
        if let Some(content) = content {
            item.content = content;
        }
        if let Some(importance) = importance {
            item.set_importance(importance);
        }
        if content_changed {
            let snapshot = item.clone();
            self.index_item(&snapshot);
            self.write_vector_point(&snapshot).await;
        }
        true
    }

    pub async fn remove(&mut self, id: &Uuid) -> Option<MemoryItem> {
        let removed = self.items.remove(id)?;
        self.unindex_item(&removed);
        if self.collection_ready {
            if let Some(store) = self.vector.as_ref() {
                if let Err(err) = store
                    .delete_by_ids(&self.collection, &[id.to_string()])
                    .await
                {
                    warn!(%err, "semantic vector delete failed");
                }
            }
        }
        Some(removed)
    }

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
                let excess = self.items.len().saturating_sub(target);
                let mut pool: Vec<&MemoryItem> = self.items.values().collect();
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

    /// Drop the in-memory caches, keeping the vector collection and graph.
    pub fn drop_caches(&mut self) {
        self.items.clear();
        self.concept_index.clear();
    }

    pub async fn clear(&mut self) {
        self.drop_caches();
        let _ = self.graph.clear();
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

    pub fn concept_index_len(&self) -> usize {
        self.concept_index.len()
    }

    // ── Graph pass-through ───────────────────────────────────────────────────

    pub fn add_entity(&self, entity: Entity) -> Result<(), MemoryError> {
        self.graph.add_entity(entity)
    }

    pub fn add_relation(&self, relation: Relation) -> Result<(), MemoryError> {
        self.graph.add_relation(relation)
    }

    /// Graph failures degrade to empty results at this boundary.
    pub fn find_related_entities(
        &self,
        entity_id: &str,
        max_depth: usize,
        limit: usize,
    ) -> Vec<RelatedEntity> {
        self.graph
            .find_related_entities(entity_id, max_depth, limit)
            .unwrap_or_else(|err| {
                warn!(%err, "graph traversal failed");
                vec![]
            })
    }

    pub fn search_entities(
        &self,
        name_pattern: &str,
        entity_types: Option<&[String]>,
        limit: usize,
    ) -> Vec<Entity> {
        self.graph
            .search_entities(name_pattern, entity_types, limit)
            .unwrap_or_else(|err| {
                warn!(%err, "entity search failed");
                vec![]
            })
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn close(&self) {
        self.graph.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
