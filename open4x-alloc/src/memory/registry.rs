use super::{AllocationError, MemoryBackend, SharedStore, StoreCreateInfo};
use foldhash::HashMap;
use parking_lot::RwLock;
use std::{error::Error, fmt, sync::Arc};

/// Owns every named [`SharedStore`] of a renderer.
///
/// The registry is the only way to look up a store by name. Stores are reference-counted: deleting
/// a store removes its name, but handles and suballocators that still refer to it keep it alive
/// until they are dropped.
#[derive(Debug)]
pub struct StoreRegistry {
    backend: Arc<dyn MemoryBackend>,
    stores: RwLock<HashMap<String, Arc<SharedStore>>>,
}

impl StoreRegistry {
    /// Creates a new, empty `StoreRegistry` that allocates memory from `backend`.
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        StoreRegistry {
            backend,
            stores: RwLock::new(HashMap::default()),
        }
    }

    /// Returns the backend that stores are allocated from.
    #[inline]
    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    /// Creates a new store under `name`.
    ///
    /// # Errors
    ///
    /// - Returns [`RegistryError::DuplicateName`] if a store with the name already exists.
    /// - Returns [`RegistryError::Allocation`] if the backend failed to provide the memory.
    pub fn create_store(
        &self,
        name: impl Into<String>,
        create_info: StoreCreateInfo,
    ) -> Result<Arc<SharedStore>, RegistryError> {
        let name = name.into();
        let mut stores = self.stores.write();

        if stores.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let store = SharedStore::new(self.backend.clone(), name.as_str(), &create_info)
            .map_err(RegistryError::Allocation)?;
        stores.insert(name, store.clone());

        Ok(store)
    }

    /// Returns the store with the given name.
    pub fn get_store(&self, name: &str) -> Result<Arc<SharedStore>, RegistryError> {
        self.stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    /// Removes the store with the given name from the registry and returns it.
    pub fn delete_store(&self, name: &str) -> Result<Arc<SharedStore>, RegistryError> {
        let store = self
            .stores
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;

        tracing::debug!(name, "deleted backing store");

        Ok(store)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.stores.read().contains_key(name)
    }

    /// Returns the names of all stores, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}

/// Error that can be returned by a [`StoreRegistry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A store with the name already exists.
    DuplicateName(String),

    /// No store with the name exists.
    NotFound(String),

    /// The backend failed to provide the memory for the store.
    Allocation(AllocationError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "a store named `{name}` already exists"),
            Self::NotFound(name) => write!(f, "no store named `{name}` exists"),
            Self::Allocation(_) => f.write_str("failed to allocate the store"),
        }
    }
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Allocation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AllocationError> for RegistryError {
    fn from(err: AllocationError) -> Self {
        RegistryError::Allocation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostBackend;

    fn registry() -> StoreRegistry {
        StoreRegistry::new(Arc::new(HostBackend::default()))
    }

    fn create_info(capacity: u64) -> StoreCreateInfo {
        StoreCreateInfo {
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn create_and_lookup() {
        let registry = registry();
        let store = registry.create_store("vertices", create_info(128)).unwrap();

        assert_eq!(store.name(), "vertices");
        assert!(registry.contains("vertices"));
        assert!(Arc::ptr_eq(&registry.get_store("vertices").unwrap(), &store));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = registry();
        registry.create_store("a", create_info(16)).unwrap();

        assert_eq!(
            registry.create_store("a", create_info(32)).unwrap_err(),
            RegistryError::DuplicateName("a".to_owned()),
        );
        assert_eq!(registry.get_store("a").unwrap().capacity(), 16);
    }

    #[test]
    fn delete_removes_the_name() {
        let registry = registry();
        let store = registry.create_store("a", create_info(16)).unwrap();
        store.write(0, &[3; 4]).unwrap();

        registry.delete_store("a").unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            registry.get_store("a").unwrap_err(),
            RegistryError::NotFound("a".to_owned()),
        );
        assert_eq!(
            registry.delete_store("a").unwrap_err(),
            RegistryError::NotFound("a".to_owned()),
        );

        // Outstanding handles keep the store alive.
        let mut bytes = [0; 4];
        store.read(0, &mut bytes).unwrap();
        assert_eq!(bytes, [3; 4]);

        // The name can be reused.
        registry.create_store("a", create_info(8)).unwrap();
    }

    #[test]
    fn failed_allocation_does_not_register() {
        let registry = registry();

        assert_eq!(
            registry.create_store("empty", create_info(0)).unwrap_err(),
            RegistryError::Allocation(AllocationError::ZeroSized),
        );
        assert!(!registry.contains("empty"));
    }

    #[test]
    fn names() {
        let registry = registry();
        registry.create_store("b", create_info(16)).unwrap();
        registry.create_store("a", create_info(16)).unwrap();

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }
}
