//! Storage contract consumed by the pipeline.
//!
//! Rows travel as JSON documents keyed by entity id inside a table named by
//! the entity's type tag. Engines only need point reads, batch upserts, a
//! name→id mapping with a uniqueness guarantee, and bucket-based expiry.

pub mod memory;
pub mod ttl;

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::entity::Entity;
use crate::error::StorageError;

pub use memory::InMemoryStorage;

/// A stored row.
pub type Row = Value;

/// Field every row carries so engines can expire by bucket.
pub const TIME_BUCKET_FIELD: &str = "time_bucket";

/// Pluggable storage engine.
pub trait Storage: Send + Sync + 'static {
    /// Returns the engine name for logging.
    fn name(&self) -> &str;

    /// Reads a single row.
    fn get_by_id(
        &self,
        entity_type: &'static str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Row>, StorageError>> + Send;

    /// Reads many rows in one round trip. Absent ids are omitted.
    fn get_by_ids(
        &self,
        entity_type: &'static str,
        ids: &[String],
    ) -> impl Future<Output = Result<HashMap<String, Row>, StorageError>> + Send;

    /// Inserts or overwrites all rows in one call.
    fn batch_upsert(
        &self,
        entity_type: &'static str,
        rows: Vec<(String, Row)>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Looks up an existing name mapping without creating one.
    fn find_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> impl Future<Output = Result<Option<i32>, StorageError>> + Send;

    /// Returns the id mapped to `name`, creating it when absent.
    ///
    /// Concurrent callers for the same name must observe the same id; ids are
    /// never zero.
    fn get_or_create_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> impl Future<Output = Result<i32, StorageError>> + Send;

    /// Deletes rows whose time bucket is strictly below `before_bucket`.
    fn delete_expired(
        &self,
        entity_type: &'static str,
        before_bucket: u64,
    ) -> impl Future<Output = Result<usize, StorageError>> + Send;
}

/// Encodes an entity as a storage row.
pub fn encode_row<E: Entity>(entity: &E) -> Result<Row, StorageError> {
    serde_json::to_value(entity).map_err(|e| StorageError::Malformed {
        entity_type: E::TYPE_TAG,
        id: entity.id(),
        reason: e.to_string(),
    })
}

/// Decodes a storage row into an entity.
pub fn decode_row<E: Entity>(id: &str, row: Row) -> Result<E, StorageError> {
    serde_json::from_value(row).map_err(|e| StorageError::Malformed {
        entity_type: E::TYPE_TAG,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Reads the bucket field of a row, if present.
pub fn row_time_bucket(row: &Row) -> Option<u64> {
    row.get(TIME_BUCKET_FIELD).and_then(Value::as_u64)
}
