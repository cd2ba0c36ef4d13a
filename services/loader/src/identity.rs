//! Vehicle and sensor identity dictionaries.
//!
//! Names are resolved to stable integer ids through the warehouse's atomic
//! get-or-create. Resolved ids are cached per process so the dictionary
//! tables are only consulted once per distinct name.

use crate::error::WarehouseError;
use crate::warehouse::Warehouse;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Which dictionary a name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    Vehicle,
    Sensor,
}

impl IdentityKind {
    /// Dictionary table
    pub fn table(&self) -> &'static str {
        match self {
            IdentityKind::Vehicle => "vehicle_ids",
            IdentityKind::Sensor => "sensor_ids",
        }
    }

    /// Name column
    pub fn name_column(&self) -> &'static str {
        match self {
            IdentityKind::Vehicle => "vehicle",
            IdentityKind::Sensor => "sensor",
        }
    }

    /// Surrogate id column
    pub fn id_column(&self) -> &'static str {
        match self {
            IdentityKind::Vehicle => "vehicle_id",
            IdentityKind::Sensor => "sensor_id",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name_column())
    }
}

/// Cached get-or-create front for the identity dictionaries
pub struct IdentityResolver {
    warehouse: Arc<dyn Warehouse>,
    cache: RwLock<HashMap<(IdentityKind, String), i32>>,
}

impl IdentityResolver {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `name` to its id, creating the dictionary entry on first use.
    ///
    /// Storage failures are returned as is; retry policy belongs to the caller.
    #[instrument(skip(self))]
    pub async fn resolve(&self, kind: IdentityKind, name: &str) -> Result<i32, WarehouseError> {
        if let Some(id) = self.cached(kind, name) {
            return Ok(id);
        }

        let id = self.warehouse.get_or_create_identity(kind, name).await?;

        // A concurrent caller may have filled the slot already; storage
        // guarantees both saw the same id.
        self.cache
            .write()
            .entry((kind, name.to_string()))
            .or_insert(id);

        debug!(kind = %kind, name = %name, id = id, "Identity resolved");
        Ok(id)
    }

    fn cached(&self, kind: IdentityKind, name: &str) -> Option<i32> {
        self.cache.read().get(&(kind, name.to_string())).copied()
    }

    /// Number of cached names
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{MemoryWarehouse, MockWarehouse};
    use futures::future::join_all;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_same_name_same_id() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resolver = IdentityResolver::new(warehouse.clone());

        let a = resolver.resolve(IdentityKind::Vehicle, "truck1").await.unwrap();
        let b = resolver.resolve(IdentityKind::Vehicle, "truck2").await.unwrap();
        let again = resolver.resolve(IdentityKind::Vehicle, "truck1").await.unwrap();

        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(warehouse.identities(IdentityKind::Vehicle).len(), 2);
    }

    #[tokio::test]
    async fn test_kinds_are_separate_dictionaries() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resolver = IdentityResolver::new(warehouse.clone());

        resolver.resolve(IdentityKind::Vehicle, "s01").await.unwrap();
        resolver.resolve(IdentityKind::Sensor, "s01").await.unwrap();

        assert_eq!(warehouse.identities(IdentityKind::Vehicle).len(), 1);
        assert_eq!(warehouse.identities(IdentityKind::Sensor).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_yields_one_id() {
        let warehouse = Arc::new(MemoryWarehouse::new());

        // independent resolvers model separate workers without a shared cache
        let tasks = (0..16).map(|_| {
            let resolver = IdentityResolver::new(warehouse.clone());
            tokio::spawn(async move { resolver.resolve(IdentityKind::Sensor, "rs7").await })
        });

        let ids: Vec<i32> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(warehouse.identities(IdentityKind::Sensor), vec!["rs7".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_avoids_second_lookup() {
        let mut mock = MockWarehouse::new();
        mock.expect_get_or_create_identity()
            .with(eq(IdentityKind::Vehicle), eq("gle350"))
            .times(1)
            .returning(|_, _| Ok(42));

        let resolver = IdentityResolver::new(Arc::new(mock));
        assert_eq!(resolver.resolve(IdentityKind::Vehicle, "gle350").await.unwrap(), 42);
        assert_eq!(resolver.resolve(IdentityKind::Vehicle, "gle350").await.unwrap(), 42);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let mut mock = MockWarehouse::new();
        mock.expect_get_or_create_identity()
            .returning(|_, _| Err(WarehouseError::Connection(sqlx::Error::PoolTimedOut)));

        let resolver = IdentityResolver::new(Arc::new(mock));
        let err = resolver.resolve(IdentityKind::Sensor, "s01").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Connection(_)));
        assert_eq!(resolver.cached_len(), 0);
    }
}
