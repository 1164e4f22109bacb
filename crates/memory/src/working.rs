//! Working memory: the short-lived, capacity-bounded, in-process tier.

use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::schema::{MemoryItem, MemoryQuery, RetrievalSource, ScoredMemory, TierStats};

/// Capacity-bounded map with TTL-based read hiding.  Expired items stay in
/// the map until evicted so `stats` can distinguish the live `count` from
/// the raw `total_count`.  No external storage.
pub struct WorkingMemory {
    items: std::collections::HashMap<Uuid, MemoryItem>,
    capacity: usize,
    ttl_minutes: i64,
}

impl WorkingMemory {
    pub fn new(capacity: usize, ttl_minutes: i64) -> Self {
        Self {
            items: std::collections::HashMap::new(),
            capacity: capacity.max(1),
            ttl_minutes,
        }
    }

    fn is_expired(&self, item: &MemoryItem) -> bool {
        self.ttl_minutes > 0 && Utc::now() - item.timestamp > Duration::minutes(self.ttl_minutes)
    }

    /// Insert one item; on overflow the oldest item (by timestamp) is
    /// evicted and returned.
    pub fn add(&mut self, item: MemoryItem) -> Option<MemoryItem> {
        let mut evicted = None;
        if self.items.len() >= self.capacity {
            let oldest = self
                .items
                .values()
                .min_by_key(|i| i.timestamp)
                .map(|i| i.id);
            if let Some(id) = oldest {
                evicted = self.items.remove(&id);
                debug!(?id, "working memory overflow, evicted oldest");
            }
        }
        self.items.insert(item.id, item);
        evicted
    }

    /// Linear scan: case-insensitive substring match against content,
    /// filtered by user and minimum importance, sorted by importance
    /// descending, truncated to the query limit.
    pub fn retrieve(&self, query: &MemoryQuery) -> Vec<ScoredMemory> {
        let needle = query.query.to_lowercase();
        let mut hits: Vec<ScoredMemory> = self
            .items
            .values()
            .filter(|item| !self.is_expired(item))
            .filter(|item| needle.is_empty() || item.content.to_lowercase().contains(&needle))
            .filter(|item| {
                query
                    .user_id
                    .as_deref()
                    .is_none_or(|user| item.user_id == user)
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
        hits.sort_by(|a, b| b.item.importance.total_cmp(&a.item.importance));
        hits.truncate(query.limit);
        hits
    }

    pub fn get(&self, id: &Uuid) -> Option<&MemoryItem> {
        self.items.get(id).filter(|item| !self.is_expired(item))
    }

    /// Live items only; expired entries are hidden here as well.
    pub fn get_all(&self) -> Vec<&MemoryItem> {
        self.items
            .values()
            .filter(|item| !self.is_expired(item))
            .collect()
    }

    pub fn update(
        &mut self,
        id: &Uuid,
        content: Option<String>,
        importance: Option<f32>,
    ) -> bool {
        match self.items.get_mut(id) {
            Some(item) => {
                if let Some(content) = content {
                    item.content = content;
                }
                if let Some(importance) = importance {
                    item.set_importance(importance);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<MemoryItem> {
        self.items.remove(id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn stats(&self) -> TierStats {
        let live: Vec<&MemoryItem> = self
            .items
            .values()
            .filter(|item| !self.is_expired(item))
            .collect();
        let avg = if live.is_empty() {
            0.0
        } else {
            live.iter().map(|i| i.importance).sum::<f32>() / live.len() as f32
        };
        TierStats {
            count: live.len(),
            total_count: self.items.len(),
            avg_importance: avg,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
