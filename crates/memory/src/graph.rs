//! Graph store: entities and typed relationships for the semantic tier.
//!
//! In-process implementation behind the same contract a remote graph
//! database would satisfy; connection settings for a remote deployment are
//! recognised in `GraphConfig` but the bundled store needs none of them.
//! Thread-safe via `RwLock`; a session per logical operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::MemoryError;
use crate::schema::JsonMap;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: JsonMap,
    /// How many times this entity has been upserted.
    #[serde(default)]
    pub frequency: u64,
}

impl Entity {
    pub fn new(
        entity_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            properties: JsonMap::new(),
            frequency: 0,
        }
    }

    pub fn with_properties(mut self, properties: JsonMap) -> Self {
        self.properties = properties;
        self
    }
}

/// Directed typed edge.  `(from, to, type)` is the upsert key: repeated adds
/// merge properties instead of creating parallel edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    #[serde(default)]
    pub properties: JsonMap,
}

impl Relation {
    pub fn new(
        from_entity: impl Into<String>,
        to_entity: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            to_entity: to_entity.into(),
            relation_type: relation_type.into(),
            properties: JsonMap::new(),
        }
    }
}

/// Traversal result: the entity plus how it was reached.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// Hop count from the start node.
    pub distance: usize,
    /// Edge types along the path, in traversal order.
    pub relationship_path: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
}

// ── Store ────────────────────────────────────────────────────────────────────

struct StoredEntity {
    entity: Entity,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct GraphInner {
    entities: HashMap<String, StoredEntity>,
    /// Keyed by (from, to, relation_type).
    edges: HashMap<(String, String, String), JsonMap>,
    /// Undirected adjacency for traversal: node → (neighbor, relation_type).
    adjacency: HashMap<String, Vec<(String, String)>>,
    closed: bool,
}

#[derive(Default)]
pub struct GraphStore {
    inner: RwLock<GraphInner>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(inner: &GraphInner) -> Result<(), MemoryError> {
        if inner.closed {
            return Err(MemoryError::Graph("graph store is closed".to_string()));
        }
        Ok(())
    }

    /// Upsert an entity.  Repeated calls merge `properties`, refresh
    /// `updated_at`, and bump `frequency`.
    pub fn add_entity(&self, entity: Entity) -> Result<(), MemoryError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        Self::check_open(&inner)?;

        let now = Utc::now();
        match inner.entities.get_mut(&entity.entity_id) {
            Some(stored) => {
                stored.entity.name = entity.name;
                stored.entity.entity_type = entity.entity_type;
                for (key, value) in entity.properties {
                    stored.entity.properties.insert(key, value);
                }
                stored.entity.frequency += 1;
                stored.updated_at = now;
            }
            None => {
                let id = entity.entity_id.clone();
                debug!(entity = %id, "adding graph entity");
                inner.entities.insert(
                    id,
                    StoredEntity {
                        entity: Entity {
                            frequency: 1,
                            ..entity
                        },
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    /// Idempotent upsert of a typed edge; repeated adds merge properties.
    /// Both endpoints must already exist.
    pub fn add_relation(&self, relation: Relation) -> Result<(), MemoryError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        Self::check_open(&inner)?;

        for endpoint in [&relation.from_entity, &relation.to_entity] {
            if !inner.entities.contains_key(endpoint) {
                return Err(MemoryError::Graph(format!("unknown entity: {endpoint}")));
            }
        }

        let key = (
            relation.from_entity.clone(),
            relation.to_entity.clone(),
            relation.relation_type.clone(),
        );
        match inner.edges.get_mut(&key) {
            Some(properties) => {
                for (k, v) in relation.properties {
                    properties.insert(k, v);
                }
            }
            None => {
                inner.edges.insert(key, relation.properties);
                inner
                    .adjacency
                    .entry(relation.from_entity.clone())
                    .or_default()
                    .push((relation.to_entity.clone(), relation.relation_type.clone()));
                inner
                    .adjacency
                    .entry(relation.to_entity)
                    .or_default()
                    .push((relation.from_entity, relation.relation_type));
            }
        }
        Ok(())
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<Entity> {
        let inner = self.inner.read().expect("graph lock poisoned");
        inner.entities.get(entity_id).map(|stored| {
            let mut entity = stored.entity.clone();
            entity.properties.insert(
                "created_at".to_string(),
                json!(stored.created_at.to_rfc3339()),
            );
            entity.properties.insert(
                "updated_at".to_string(),
                json!(stored.updated_at.to_rfc3339()),
            );
            entity
        })
    }

    /// Undirected bounded BFS from `entity_id`, excluding the start node.
    /// Results are in BFS order (distance ascending); each carries its hop
    /// count and the ordered list of edge types along the path.
    pub fn find_related_entities(
        &self,
        entity_id: &str,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<RelatedEntity>, MemoryError> {
        let inner = self.inner.read().expect("graph lock poisoned");
        Self::check_open(&inner)?;

        if !inner.entities.contains_key(entity_id) {
            return Ok(vec![]);
        }

        let mut visited: HashSet<&str> = HashSet::from([entity_id]);
        let mut queue: VecDeque<(&str, usize, Vec<String>)> =
            VecDeque::from([(entity_id, 0, Vec::new())]);
        let mut results = Vec::new();

        while let Some((current, depth, path)) = queue.pop_front() {
            if depth >= max_depth || results.len() >= limit {
                continue;
            }
            let Some(neighbors) = inner.adjacency.get(current) else {
                continue;
            };
            for (neighbor, relation_type) in neighbors {
                if !visited.insert(neighbor.as_str()) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(relation_type.clone());
                if let Some(stored) = inner.entities.get(neighbor) {
                    results.push(RelatedEntity {
                        entity: stored.entity.clone(),
                        distance: depth + 1,
                        relationship_path: next_path.clone(),
                    });
                    if results.len() >= limit {
                        break;
                    }
                }
                queue.push_back((neighbor.as_str(), depth + 1, next_path));
            }
        }

        Ok(results)
    }

    /// Case-insensitive substring match on entity names, optionally
    /// restricted to the given types.
    pub fn search_entities(
        &self,
        name_pattern: &str,
        entity_types: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Entity>, MemoryError> {
        let inner = self.inner.read().expect("graph lock poisoned");
        Self::check_open(&inner)?;

        let pattern = name_pattern.to_lowercase();
        let mut matches: Vec<&StoredEntity> = inner
            .entities
            .values()
            .filter(|stored| stored.entity.name.to_lowercase().contains(&pattern))
            .filter(|stored| {
                entity_types.is_none_or(|types| types.contains(&stored.entity.entity_type))
            })
            .collect();
        matches.sort_by(|a, b| {
            b.entity
                .frequency
                .cmp(&a.entity.frequency)
                .then_with(|| a.entity.name.cmp(&b.entity.name))
        });
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|stored| stored.entity.clone())
            .collect())
    }

    pub fn stats(&self) -> GraphStats {
        let inner = self.inner.read().expect("graph lock poisoned");
        GraphStats {
            entity_count: inner.entities.len(),
            relation_count: inner.edges.len(),
        }
    }

    pub fn clear(&self) -> Result<(), MemoryError> {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        Self::check_open(&inner)?;
        inner.entities.clear();
        inner.edges.clear();
        inner.adjacency.clear();
        Ok(())
    }

    /// Release the store.  Subsequent operations fail with a graph error.
    pub fn close(&self) {
        let mut inner = self.inner.write().expect("graph lock poisoned");
        inner.closed = true;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> GraphStore {
        let graph = GraphStore::new();
        graph.add_entity(Entity::new("ml", "ML", "Concept")).unwrap();
        graph.add_entity(Entity::new("ai", "AI", "Concept")).unwrap();
        graph.add_entity(Entity::new("dl", "DL", "Concept")).unwrap();
        graph
            .add_relation(Relation::new("ml", "ai", "SUBSET_OF"))
            .unwrap();
        graph
            .add_relation(Relation::new("dl", "ml", "SUBSET_OF"))
            .unwrap();
        graph
    }

    #[test]
    fn entity_upsert_merges_properties() {
        let graph = GraphStore::new();
        let mut props = JsonMap::new();
        props.insert("field".to_string(), json!("cs"));
        graph
            .add_entity(Entity::new("ml", "ML", "Concept").with_properties(props))
            .unwrap();

        let mut more = JsonMap::new();
        more.insert("year".to_string(), json!(1959));
        graph
            .add_entity(Entity::new("ml", "Machine Learning", "Concept").with_properties(more))
            .unwrap();

        let entity = graph.get_entity("ml").unwrap();
        assert_eq!(entity.name, "Machine Learning");
        assert_eq!(entity.properties["field"], json!("cs"));
        assert_eq!(entity.properties["year"], json!(1959));
        assert_eq!(entity.frequency, 2);
        assert!(entity.properties.contains_key("created_at"));
        assert!(entity.properties.contains_key("updated_at"));
        assert_eq!(graph.stats().entity_count, 1);
    }

    #[test]
    fn relation_upsert_is_idempotent() {
        let graph = seeded();
        assert_eq!(graph.stats().relation_count, 2);

        let mut props = JsonMap::new();
        props.insert("confidence".to_string(), json!(0.9));
        graph
            .add_relation(Relation {
                from_entity: "ml".to_string(),
                to_entity: "ai".to_string(),
                relation_type: "SUBSET_OF".to_string(),
                properties: props,
            })
            .unwrap();

        // Same (from, to, type): no new edge, properties merged.
        assert_eq!(graph.stats().relation_count, 2);

        // Distinct relation type between the same endpoints is a new edge.
        graph
            .add_relation(Relation::new("ml", "ai", "RELATED_TO"))
            .unwrap();
        assert_eq!(graph.stats().relation_count, 3);
    }

    #[test]
    fn relation_requires_both_endpoints() {
        let graph = GraphStore::new();
        graph.add_entity(Entity::new("a", "A", "T")).unwrap();
        let result = graph.add_relation(Relation::new("a", "ghost", "R"));
        assert!(matches!(result, Err(MemoryError::Graph(_))));
    }

    #[test]
    fn traversal_excludes_start_and_orders_by_distance() {
        let graph = seeded();
        let related = graph.find_related_entities("dl", 2, 10).unwrap();
        assert_eq!(related.len(), 2);

        assert_eq!(related[0].entity.entity_id, "ml");
        assert_eq!(related[0].distance, 1);
        assert_eq!(related[0].relationship_path, vec!["SUBSET_OF"]);

        assert_eq!(related[1].entity.entity_id, "ai");
        assert_eq!(related[1].distance, 2);
        assert_eq!(related[1].relationship_path, vec!["SUBSET_OF", "SUBSET_OF"]);
    }

    #[test]
    fn traversal_respects_depth_and_limit() {
        let graph = seeded();
        let depth_one = graph.find_related_entities("dl", 1, 10).unwrap();
        assert_eq!(depth_one.len(), 1);
        assert_eq!(depth_one[0].entity.entity_id, "ml");

        let limited = graph.find_related_entities("dl", 2, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn traversal_is_undirected() {
        let graph = seeded();
        // Edges point dl→ml→ai; traversal from ai must still reach dl.
        let related = graph.find_related_entities("ai", 2, 10).unwrap();
        let ids: Vec<&str> = related.iter().map(|r| r.entity.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["ml", "dl"]);
    }

    #[test]
    fn traversal_of_unknown_entity_is_empty() {
        let graph = seeded();
        assert!(graph.find_related_entities("ghost", 3, 10).unwrap().is_empty());
    }

    #[test]
    fn search_is_case_insensitive_substring_with_type_filter() {
        let graph = seeded();
        graph
            .add_entity(Entity::new("mlops", "MLOps", "Practice"))
            .unwrap();

        let hits = graph.search_entities("ml", None, 10).unwrap();
        let names: Vec<&str> = hits.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"ML"));
        assert!(names.contains(&"MLOps"));

        let concepts_only = graph
            .search_entities("ml", Some(&["Concept".to_string()]), 10)
            .unwrap();
        assert_eq!(concepts_only.len(), 1);
        assert_eq!(concepts_only[0].name, "ML");
    }

    #[test]
    fn clear_and_close() {
        let graph = seeded();
        graph.clear().unwrap();
        assert_eq!(graph.stats().entity_count, 0);
        assert_eq!(graph.stats().relation_count, 0);

        graph.close();
        assert!(graph.add_entity(Entity::new("x", "X", "T")).is_err());
        assert!(graph.search_entities("x", None, 1).is_err());
    }
}
