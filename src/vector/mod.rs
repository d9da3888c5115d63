//! Vector store adapter backed by Qdrant.
//!
//! Point identity is deterministic so re-vectorising a chapter replaces
//! its points instead of duplicating them.

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, FieldType, Filter, PointStruct, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{DistanceMetric, VectorDbConfig};
use crate::types::{Result, RuntimeError};

/// Payload fields that get a keyword index at collection creation.
const KEYWORD_INDEX_FIELDS: [&str; 5] = [
    "characters",
    "location",
    "chapter",
    "plot_significance",
    "entity_tags",
];

/// Build the stable point id for a scene: `UUIDv5(URL, "{chapter}:{index:06}")`.
pub fn build_point_id(chapter_id: &str, scene_index: i64) -> Uuid {
    let raw_key = format!("{chapter_id}:{scene_index:06}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, raw_key.as_bytes())
}

/// Lenient scene-index read for loosely-typed artifacts; non-integer
/// values fall back to 0 so the point id stays derivable.
pub fn scene_index_or_zero(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// One point to upsert.
#[derive(Debug, Clone)]
pub struct ScenePoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// One point returned from search or filtered scroll.
#[derive(Debug, Clone)]
pub struct StoredPoint {
    pub id: String,
    /// Raw provider score; zero for filter-only reads.
    pub score: f32,
    pub payload: Value,
}

/// A disjunctive (`should`) field-match filter.
#[derive(Debug, Clone, Default)]
pub struct MatchAnyFilter {
    pub conditions: Vec<(String, Vec<String>)>,
}

impl MatchAnyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_any(mut self, field: &str, values: &[String]) -> Self {
        if !values.is_empty() {
            self.conditions
                .push((field.to_string(), values.to_vec()));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn to_qdrant(&self) -> Filter {
        Filter::should(
            self.conditions
                .iter()
                .map(|(field, values)| Condition::matches(field, values.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

/// Collection statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct VectorStats {
    pub collection_name: String,
    pub total_points: u64,
    pub vector_dimensions: usize,
}

/// Seam between retrieval/pipeline code and the concrete store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing; drop and recreate when its
    /// dimensionality or distance differs from the declared one.
    async fn ensure_collection(&self) -> Result<()>;

    async fn upsert_points(&self, points: Vec<ScenePoint>) -> Result<()>;

    /// Remove every point whose `chapter` payload equals `chapter_id`.
    async fn delete_by_chapter(&self, chapter_id: &str) -> Result<()>;

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<MatchAnyFilter>,
    ) -> Result<Vec<StoredPoint>>;

    /// Filter-only recall. Returns an empty list when the collection is
    /// missing (after one reconnect attempt) — filter reads are
    /// opportunistic.
    async fn scroll_filtered(&self, filter: MatchAnyFilter, limit: usize)
        -> Result<Vec<StoredPoint>>;

    async fn stats(&self) -> Result<VectorStats>;
}

/// Qdrant-backed implementation.
pub struct QdrantStore {
    client: RwLock<Arc<Qdrant>>,
    config: VectorDbConfig,
    dimensions: usize,
}

impl QdrantStore {
    pub fn connect(config: VectorDbConfig, dimensions: usize) -> Result<Self> {
        let client = Self::open_client(&config)?;
        Ok(Self {
            client: RwLock::new(Arc::new(client)),
            config,
            dimensions,
        })
    }

    fn open_client(config: &VectorDbConfig) -> Result<Qdrant> {
        let mut builder = Qdrant::from_url(&config.url)
            .timeout(std::time::Duration::from_secs(config.timeout_secs));
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        builder
            .build()
            .map_err(|e| RuntimeError::Upstream(format!("qdrant connect failed: {e}")))
    }

    fn distance(&self) -> Distance {
        match self.config.distance_metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::Euclidean => Distance::Euclid,
            DistanceMetric::Dot => Distance::Dot,
        }
    }

    async fn handle(&self) -> Arc<Qdrant> {
        Arc::clone(&*self.client.read().await)
    }

    async fn reconnect(&self) -> Result<Arc<Qdrant>> {
        let fresh = Arc::new(Self::open_client(&self.config)?);
        *self.client.write().await = Arc::clone(&fresh);
        Ok(fresh)
    }

    fn is_missing_collection(error: &qdrant_client::QdrantError) -> bool {
        let message = error.to_string().to_lowercase();
        message.contains("not found") || message.contains("doesn't exist")
    }

    async fn declare_payload_indexes(&self, client: &Qdrant) {
        let name = &self.config.collection_name;

        for field in KEYWORD_INDEX_FIELDS {
            let request = CreateFieldIndexCollectionBuilder::new(name, field, FieldType::Keyword);
            if let Err(e) = client.create_field_index(request).await {
                tracing::warn!(field, error = %e, "create payload index skipped");
            }
        }

        let request =
            CreateFieldIndexCollectionBuilder::new(name, "chapter_no", FieldType::Integer);
        if let Err(e) = client.create_field_index(request).await {
            tracing::warn!(field = "chapter_no", error = %e, "create payload index skipped");
        }
    }

    async fn create_collection(&self, client: &Qdrant) -> Result<()> {
        client
            .create_collection(
                CreateCollectionBuilder::new(&self.config.collection_name).vectors_config(
                    VectorParamsBuilder::new(self.dimensions as u64, self.distance()),
                ),
            )
            .await
            .map_err(|e| RuntimeError::Upstream(format!("create collection failed: {e}")))?;
        self.declare_payload_indexes(client).await;
        Ok(())
    }

    /// Read (size, distance) of the live collection when available.
    async fn current_vector_params(&self, client: &Qdrant) -> Result<Option<(u64, i32)>> {
        let info = client
            .collection_info(&self.config.collection_name)
            .await
            .map_err(|e| RuntimeError::Upstream(format!("collection info failed: {e}")))?;

        let params = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);

        Ok(match params {
            Some(qdrant_client::qdrant::vectors_config::Config::Params(p)) => {
                Some((p.size, p.distance))
            }
            _ => None,
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_collection(&self) -> Result<()> {
        let client = self.handle().await;
        let name = &self.config.collection_name;

        let exists = client
            .collection_exists(name)
            .await
            .map_err(|e| RuntimeError::Upstream(format!("collection check failed: {e}")))?;

        if !exists {
            tracing::info!(collection = %name, dims = self.dimensions, "creating collection");
            return self.create_collection(&client).await;
        }

        if let Some((size, distance)) = self.current_vector_params(&client).await? {
            if size != self.dimensions as u64 || distance != self.distance() as i32 {
                tracing::warn!(
                    collection = %name,
                    current_size = size,
                    expected_size = self.dimensions,
                    "collection config mismatch, recreating"
                );
                client
                    .delete_collection(name)
                    .await
                    .map_err(|e| RuntimeError::Upstream(format!("drop collection failed: {e}")))?;
                return self.create_collection(&client).await;
            }
        }

        self.declare_payload_indexes(&client).await;
        Ok(())
    }

    async fn upsert_points(&self, points: Vec<ScenePoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let client = self.handle().await;

        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let payload = Payload::try_from(p.payload)
                    .map_err(|e| RuntimeError::Internal(format!("invalid payload: {e}")))?;
                Ok(PointStruct::new(p.id.to_string(), p.vector, payload))
            })
            .collect::<Result<Vec<_>>>()?;

        client
            .upsert_points(
                UpsertPointsBuilder::new(&self.config.collection_name, qdrant_points).wait(true),
            )
            .await
            .map_err(|e| RuntimeError::Upstream(format!("upsert failed: {e}")))?;
        Ok(())
    }

    async fn delete_by_chapter(&self, chapter_id: &str) -> Result<()> {
        let client = self.handle().await;
        let filter = Filter::must([Condition::matches("chapter", chapter_id.to_string())]);

        client
            .delete_points(
                DeletePointsBuilder::new(&self.config.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| RuntimeError::Upstream(format!("delete by chapter failed: {e}")))?;

        tracing::info!(chapter = %chapter_id, "cleared existing chapter points");
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<MatchAnyFilter>,
    ) -> Result<Vec<StoredPoint>> {
        let client = self.handle().await;

        let mut request =
            SearchPointsBuilder::new(&self.config.collection_name, vector, limit as u64)
                .with_payload(true);
        if let Some(f) = filter.filter(|f| !f.is_empty()) {
            request = request.filter(f.to_qdrant());
        }

        let response = client
            .search_points(request)
            .await
            .map_err(|e| RuntimeError::Upstream(format!("semantic search failed: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| StoredPoint {
                id: point
                    .id
                    .as_ref()
                    .map(point_id_to_string)
                    .unwrap_or_default(),
                score: point.score,
                payload: payload_to_json(point.payload),
            })
            .collect())
    }

    async fn scroll_filtered(
        &self,
        filter: MatchAnyFilter,
        limit: usize,
    ) -> Result<Vec<StoredPoint>> {
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let request = || {
            ScrollPointsBuilder::new(&self.config.collection_name)
                .filter(filter.to_qdrant())
                .limit(limit as u32)
                .with_payload(true)
        };

        let client = self.handle().await;
        let response = match client.scroll(request()).await {
            Ok(response) => response,
            Err(e) if Self::is_missing_collection(&e) => {
                tracing::warn!(
                    collection = %self.config.collection_name,
                    "collection missing during filter query, reconnecting once"
                );
                let fresh = self.reconnect().await?;
                match fresh.scroll(request()).await {
                    Ok(response) => response,
                    Err(retry_err) if Self::is_missing_collection(&retry_err) => {
                        tracing::warn!(
                            collection = %self.config.collection_name,
                            "collection still missing after reconnect, returning empty"
                        );
                        return Ok(Vec::new());
                    }
                    Err(retry_err) => {
                        return Err(RuntimeError::Upstream(format!(
                            "filter scroll failed: {retry_err}"
                        )))
                    }
                }
            }
            Err(e) => return Err(RuntimeError::Upstream(format!("filter scroll failed: {e}"))),
        };

        Ok(response
            .result
            .into_iter()
            .map(|point| StoredPoint {
                id: point
                    .id
                    .as_ref()
                    .map(point_id_to_string)
                    .unwrap_or_default(),
                score: 0.0,
                payload: payload_to_json(point.payload),
            })
            .collect())
    }

    async fn stats(&self) -> Result<VectorStats> {
        let client = self.handle().await;
        let info = client
            .collection_info(&self.config.collection_name)
            .await
            .map_err(|e| RuntimeError::Upstream(format!("collection info failed: {e}")))?;

        Ok(VectorStats {
            collection_name: self.config.collection_name.clone(),
            total_points: info.result.and_then(|r| r.points_count).unwrap_or(0),
            vector_dimensions: self.dimensions,
        })
    }
}

/// Hands out a store handle scoped to one novel's collection.
pub trait VectorIndexProvider: Send + Sync {
    fn index_for(&self, novel_id: &str) -> Result<Arc<dyn VectorIndex>>;
}

/// Qdrant provider: one collection per novel, named
/// `{collection_name}_{novel_id}`.
pub struct QdrantIndexProvider {
    config: VectorDbConfig,
    dimensions: usize,
}

impl QdrantIndexProvider {
    pub fn new(config: VectorDbConfig, dimensions: usize) -> Self {
        Self { config, dimensions }
    }

    pub fn collection_for(&self, novel_id: &str) -> String {
        format!("{}_{}", self.config.collection_name, novel_id)
    }
}

impl VectorIndexProvider for QdrantIndexProvider {
    fn index_for(&self, novel_id: &str) -> Result<Arc<dyn VectorIndex>> {
        let mut config = self.config.clone();
        config.collection_name = self.collection_for(novel_id);
        Ok(Arc::new(QdrantStore::connect(config, self.dimensions)?))
    }
}

fn point_id_to_string(id: &qdrant_client::qdrant::PointId) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match &id.point_id_options {
        Some(PointIdOptions::Uuid(u)) => u.clone(),
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn payload_to_json(payload: HashMap<String, qdrant_client::qdrant::Value>) -> Value {
    Value::Object(
        payload
            .into_iter()
            .map(|(k, v)| (k, qdrant_value_to_json(v)))
            .collect(),
    )
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> Value {
    use qdrant_client::qdrant::value::Kind;
    match value.kind {
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::BoolValue(b)) => Value::Bool(b),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_deterministic() {
        let expected = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"chapter_0001:000007");
        assert_eq!(build_point_id("chapter_0001", 7), expected);
        // Re-deriving yields the identical id.
        assert_eq!(build_point_id("chapter_0001", 7), expected);
    }

    #[test]
    fn point_ids_differ_across_scenes_and_chapters() {
        let a = build_point_id("chapter_0001", 0);
        let b = build_point_id("chapter_0001", 1);
        let c = build_point_id("chapter_0002", 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn non_integer_scene_index_falls_back_to_zero() {
        let value = serde_json::json!("invalid");
        assert_eq!(scene_index_or_zero(&value), 0);
        assert_eq!(scene_index_or_zero(&serde_json::json!(7)), 7);
        assert_eq!(scene_index_or_zero(&Value::Null), 0);
    }

    #[test]
    fn empty_filter_builds_nothing() {
        let filter = MatchAnyFilter::new().match_any("characters", &[]);
        assert!(filter.is_empty());

        let filled = MatchAnyFilter::new().match_any("characters", &["许七安".to_string()]);
        assert_eq!(filled.conditions.len(), 1);
    }

    #[test]
    fn qdrant_values_convert_to_json() {
        use qdrant_client::qdrant::value::Kind;
        let value = qdrant_client::qdrant::Value {
            kind: Some(Kind::IntegerValue(3)),
        };
        assert_eq!(qdrant_value_to_json(value), serde_json::json!(3));
    }
}
