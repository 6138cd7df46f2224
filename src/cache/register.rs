use std::sync::Arc;

use super::{scoped_name, CacheManager, Namespace};
use crate::error::StreamError;
use crate::storage::Storage;

/// Resolves names to ids through the caches, registering new names in
/// storage on first sight.
///
/// Convergence of concurrent creators is delegated to
/// [`Storage::get_or_create_mapping`]; this type holds no lock of its own.
pub struct RegisterService<S: Storage> {
    storage: Arc<S>,
    caches: Arc<CacheManager>,
}

impl<S: Storage> RegisterService<S> {
    pub fn new(storage: Arc<S>, caches: Arc<CacheManager>) -> Self {
        Self { storage, caches }
    }

    pub fn caches(&self) -> &Arc<CacheManager> {
        &self.caches
    }

    /// Looks a name up without registering it.
    pub async fn resolve(
        &self,
        namespace: Namespace,
        name: &str,
    ) -> Result<Option<i32>, StreamError> {
        let cache = self.caches.cache(namespace);
        if let Some(id) = cache.get(name) {
            return Ok(Some(id));
        }

        let found = self.storage.find_mapping(namespace.as_str(), name).await?;
        Ok(found.filter(|id| *id != 0).map(|id| cache.insert(name, id)))
    }

    /// Returns the id for `name`, registering it when storage has none.
    ///
    /// Fails with [`StreamError::TransientResolution`] when storage could not
    /// hand out an id yet; callers retry later.
    pub async fn get_or_create(
        &self,
        namespace: Namespace,
        name: &str,
    ) -> Result<i32, StreamError> {
        if let Some(id) = self.resolve(namespace, name).await? {
            return Ok(id);
        }

        let id = self
            .storage
            .get_or_create_mapping(namespace.as_str(), name)
            .await?;

        if id == 0 {
            return Err(StreamError::TransientResolution {
                namespace: namespace.as_str(),
                name: name.to_string(),
            });
        }

        tracing::debug!(namespace = namespace.as_str(), name, id, "registered name");
        Ok(self.caches.cache(namespace).insert(name, id))
    }

    pub async fn application_id(&self, code: &str) -> Result<i32, StreamError> {
        self.get_or_create(Namespace::Application, code).await
    }

    pub async fn address_id(&self, address: &str) -> Result<i32, StreamError> {
        self.get_or_create(Namespace::Address, address).await
    }

    pub async fn service_id(
        &self,
        application_id: i32,
        operation: &str,
    ) -> Result<i32, StreamError> {
        self.get_or_create(Namespace::ServiceName, &scoped_name(application_id, operation))
            .await
    }

    pub async fn instance_id(&self, application_id: i32, uuid: &str) -> Result<i32, StreamError> {
        self.get_or_create(Namespace::Instance, &scoped_name(application_id, uuid))
            .await
    }
}
