//! Name to id caches and the registration path behind them.
//!
//! Ids are permanent once assigned, so a cached entry is never invalidated.
//! Only the registration path writes to a cache, and only after storage has
//! confirmed the mapping.

pub mod exchange;
pub mod register;

use dashmap::DashMap;

pub use exchange::SpanExchanger;
pub use register::RegisterService;

/// Mapping namespaces kept in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Application code.
    Application,
    /// Network address of a remote peer.
    Address,
    /// `{application_id}_{operation name}`.
    ServiceName,
    /// `{application_id}_{agent uuid}`.
    Instance,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Address => "address",
            Self::ServiceName => "service_name",
            Self::Instance => "instance",
        }
    }
}

/// Lock-free read cache for one namespace.
#[derive(Debug, Default)]
pub struct IdCache {
    ids: DashMap<String, i32>,
}

impl IdCache {
    pub fn get(&self, name: &str) -> Option<i32> {
        self.ids.get(name).map(|id| *id)
    }

    /// Records a confirmed mapping. An existing entry is kept.
    pub fn insert(&self, name: &str, id: i32) -> i32 {
        if id == 0 {
            return 0;
        }
        *self.ids.entry(name.to_string()).or_insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One cache per namespace, shared by every producer.
#[derive(Debug, Default)]
pub struct CacheManager {
    application: IdCache,
    address: IdCache,
    service_name: IdCache,
    instance: IdCache,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self, namespace: Namespace) -> &IdCache {
        match namespace {
            Namespace::Application => &self.application,
            Namespace::Address => &self.address,
            Namespace::ServiceName => &self.service_name,
            Namespace::Instance => &self.instance,
        }
    }
}

/// Cache key for names scoped to an application.
pub(crate) fn scoped_name(application_id: i32, name: &str) -> String {
    format!("{application_id}_{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_ids_are_never_replaced() {
        let caches = CacheManager::new();
        let cache = caches.cache(Namespace::Application);

        assert_eq!(cache.insert("shop", 4), 4);
        assert_eq!(cache.insert("shop", 9), 4);
        assert_eq!(cache.get("shop"), Some(4));
        assert!(caches.cache(Namespace::Address).is_empty());
    }

    #[test]
    fn test_zero_is_not_cached() {
        let cache = IdCache::default();
        cache.insert("pending", 0);
        assert_eq!(cache.get("pending"), None);
    }
}
