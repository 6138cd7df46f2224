use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{row_time_bucket, Row, Storage};
use crate::error::StorageError;

/// Reference storage engine keeping every table in process memory.
///
/// Tables are independently lockable; name mappings rely on the map's
/// per-key entry lock for get-or-create uniqueness.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: DashMap<&'static str, HashMap<String, Row>>,
    mappings: DashMap<(&'static str, String), i32>,
    sequences: Mutex<HashMap<&'static str, i32>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored for an entity type.
    pub fn row_count(&self, entity_type: &'static str) -> usize {
        self.tables.get(entity_type).map_or(0, |t| t.len())
    }

    /// Number of mappings created in a namespace.
    pub fn mapping_count(&self, namespace: &'static str) -> usize {
        self.mappings
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .count()
    }

    fn next_id(&self, namespace: &'static str) -> i32 {
        let mut sequences = self.sequences.lock();
        let seq = sequences.entry(namespace).or_insert(0);
        *seq += 1;
        *seq
    }
}

impl Storage for InMemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_by_id(
        &self,
        entity_type: &'static str,
        id: &str,
    ) -> Result<Option<Row>, StorageError> {
        Ok(self
            .tables
            .get(entity_type)
            .and_then(|table| table.get(id).cloned()))
    }

    async fn get_by_ids(
        &self,
        entity_type: &'static str,
        ids: &[String],
    ) -> Result<HashMap<String, Row>, StorageError> {
        let Some(table) = self.tables.get(entity_type) else {
            return Ok(HashMap::new());
        };

        Ok(ids
            .iter()
            .filter_map(|id| table.get(id).map(|row| (id.clone(), row.clone())))
            .collect())
    }

    async fn batch_upsert(
        &self,
        entity_type: &'static str,
        rows: Vec<(String, Row)>,
    ) -> Result<(), StorageError> {
        let mut table = self.tables.entry(entity_type).or_default();
        table.extend(rows);
        Ok(())
    }

    async fn find_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> Result<Option<i32>, StorageError> {
        Ok(self
            .mappings
            .get(&(namespace, name.to_string()))
            .map(|id| *id))
    }

    async fn get_or_create_mapping(
        &self,
        namespace: &'static str,
        name: &str,
    ) -> Result<i32, StorageError> {
        let id = *self
            .mappings
            .entry((namespace, name.to_string()))
            .or_insert_with(|| self.next_id(namespace));
        Ok(id)
    }

    async fn delete_expired(
        &self,
        entity_type: &'static str,
        before_bucket: u64,
    ) -> Result<usize, StorageError> {
        let Some(mut table) = self.tables.get_mut(entity_type) else {
            return Ok(0);
        };

        let before = table.len();
        table.retain(|_, row| {
            row_time_bucket(row).map_or(true, |bucket| bucket >= before_bucket)
        });
        Ok(before - table.len())
    }
}
