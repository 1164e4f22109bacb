//! Remote Qdrant backend for the [`VectorStore`] trait.
//!
//! Compiled behind the `qdrant` cargo feature.  Point ids are the memory
//! item UUIDs, so the caller's ids survive verbatim; every write uses
//! `wait(true)` so durability holds before the call returns.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance as QdrantDistance, FieldType, Filter as QdrantFilter,
    PointId, PointStruct, PointsIdsList, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder, point_id::PointIdOptions, value::Kind, vectors_config,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::Value;
use tracing::info;

use crate::MemoryError;
use crate::schema::JsonMap;
use crate::vector::{
    CollectionInfo, Distance, Filter, PayloadIndexKind, SearchHit, VectorPoint, VectorStore,
};

pub struct QdrantStore {
    client: Qdrant,
}

impl QdrantStore {
    pub fn connect(config: &cortex_config::QdrantConfig) -> Result<Self, MemoryError> {
        let mut builder = Qdrant::from_url(&config.url)
            .timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)));
        if !config.api_key.is_empty() {
            builder = builder.api_key(config.api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| MemoryError::Store(format!("qdrant connect failed: {e}")))?;
        info!(url = %config.url, "qdrant client ready");
        Ok(Self { client })
    }
}

fn store_err(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Store(e.to_string())
}

fn to_qdrant_distance(distance: Distance) -> QdrantDistance {
    match distance {
        Distance::Cosine => QdrantDistance::Cosine,
        Distance::Dot => QdrantDistance::Dot,
        Distance::Euclid => QdrantDistance::Euclid,
    }
}

/// Equality condition over a payload field.  Qdrant match values are keyword
/// / integer / bool; anything else goes through its string form.
fn condition_for(field: &str, value: &Value) -> Condition {
    match value {
        Value::String(s) => Condition::matches(field, s.clone()),
        Value::Bool(b) => Condition::matches(field, *b),
        Value::Number(n) if n.is_i64() => Condition::matches(field, n.as_i64().unwrap_or(0)),
        other => Condition::matches(field, other.to_string()),
    }
}

fn to_qdrant_filter(filter: &Filter) -> QdrantFilter {
    QdrantFilter::must(
        filter
            .must
            .iter()
            .map(|m| condition_for(&m.field, &m.value))
            .collect::<Vec<_>>(),
    )
}

fn point_id_to_string(id: &PointId) -> String {
    match &id.point_id_options {
        Some(PointIdOptions::Uuid(s)) => s.clone(),
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> Value {
    match value.kind {
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::from(i),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
        }
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_to_json(v)))
                .collect(),
        ),
        Some(Kind::NullValue(_)) | None => Value::Null,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(
        &self,
        name: &str,
        dim: usize,
        distance: Distance,
    ) -> Result<(), MemoryError> {
        let exists = self
            .client
            .collection_exists(name)
            .await
            .map_err(store_err)?;
        if exists {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name).vectors_config(VectorParamsBuilder::new(
                    dim as u64,
                    to_qdrant_distance(distance),
                )),
            )
            .await
            .map_err(store_err)?;
        info!(collection = name, dim, "created qdrant collection");
        Ok(())
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        kind: PayloadIndexKind,
    ) -> Result<(), MemoryError> {
        let field_type = match kind {
            PayloadIndexKind::Keyword => FieldType::Keyword,
            PayloadIndexKind::Float => FieldType::Float,
            PayloadIndexKind::Integer => FieldType::Integer,
        };
        self.client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                collection, field, field_type,
            ))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<(), MemoryError> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let payload = Payload::try_from(Value::Object(p.payload))
                    .map_err(|e| MemoryError::Store(format!("payload must be an object: {e}")))?;
                Ok(PointStruct::new(p.id, p.vector, payload))
            })
            .collect::<Result<_, MemoryError>>()?;
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(store_err)?;
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
        let mut builder =
            SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64).with_payload(true);
        if let Some(threshold) = score_threshold {
            builder = builder.score_threshold(threshold);
        }
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }

        let response = self.client.search_points(builder).await.map_err(store_err)?;
        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let payload: JsonMap = point
                    .payload
                    .into_iter()
                    .map(|(k, v)| (k, qdrant_value_to_json(v)))
                    .collect();
                SearchHit {
                    id: point.id.as_ref().map(point_id_to_string).unwrap_or_default(),
                    score: point.score,
                    payload,
                }
            })
            .collect())
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> Result<(), MemoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.clone())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        collection: &str,
        field: &str,
        any_of: &[Value],
    ) -> Result<(), MemoryError> {
        if any_of.is_empty() {
            return Ok(());
        }
        let filter = QdrantFilter::should(
            any_of
                .iter()
                .map(|value| condition_for(field, value))
                .collect::<Vec<_>>(),
        );
        self.client
            .delete_points(DeletePointsBuilder::new(collection).points(filter).wait(true))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), MemoryError> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(QdrantFilter::default())
                    .wait(true),
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, MemoryError> {
        let response = self
            .client
            .count(CountPointsBuilder::new(collection).exact(true))
            .await
            .map_err(store_err)?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn info(&self, collection: &str) -> Result<CollectionInfo, MemoryError> {
        let response = self
            .client
            .collection_info(collection)
            .await
            .map_err(store_err)?;
        let info = response
            .result
            .ok_or_else(|| MemoryError::Store(format!("no info for collection {collection}")))?;
        let dimension = info
            .config
            .as_ref()
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|v| v.config.as_ref())
            .map(|c| match c {
                vectors_config::Config::Params(params) => params.size as usize,
                vectors_config::Config::ParamsMap(_) => 0,
            })
            .unwrap_or(0);
        Ok(CollectionInfo {
            name: collection.to_string(),
            points: info.points_count.unwrap_or(0) as usize,
            dimension,
        })
    }

    async fn health_check(&self) -> Result<(), MemoryError> {
        self.client.health_check().await.map_err(store_err)?;
        Ok(())
    }
}
