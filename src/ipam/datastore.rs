use std::collections::HashMap;

use parking_lot::RwLock;

use crate::ipam::types::{Block, Handle, Pool};

/// Errors surfaced by the record datastore. `Conflict` and `AlreadyExists`
/// are the two kinds the optimistic retry loops recover from; everything
/// else aborts the operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("datastore failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// A record together with the version token its compare-and-swap is keyed on.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// The set-of-records contract the IPAM core relies on. Every record carries
/// a monotonic version; `update_*` succeeds only when the caller's expected
/// version still matches, so concurrent writers race safely without locks.
pub trait Datastore: Send + Sync {
    fn get_pool(&self, name: &str) -> Result<Versioned<Pool>, StoreError>;
    fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError>;
    fn create_pool(&self, pool: &Pool) -> Result<(), StoreError>;
    fn update_pool(&self, pool: &Pool, expected: u64) -> Result<(), StoreError>;

    fn get_block(&self, name: &str) -> Result<Versioned<Block>, StoreError>;
    fn list_blocks(&self, pool: &str) -> Result<Vec<Versioned<Block>>, StoreError>;
    fn create_block(&self, block: &Block) -> Result<(), StoreError>;
    fn update_block(&self, block: &Block, expected: u64) -> Result<(), StoreError>;
    fn delete_block(&self, name: &str) -> Result<(), StoreError>;

    fn get_handle(&self, id: &str) -> Result<Versioned<Handle>, StoreError>;
    fn list_handles(&self) -> Result<Vec<Versioned<Handle>>, StoreError>;
    fn create_handle(&self, handle: &Handle) -> Result<(), StoreError>;
    fn update_handle(&self, handle: &Handle, expected: u64) -> Result<(), StoreError>;
    fn delete_handle(&self, id: &str) -> Result<(), StoreError>;
}

struct Table<T> {
    rows: HashMap<String, Versioned<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table {
            rows: HashMap::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    fn get(&self, key: &str) -> Result<Versioned<T>, StoreError> {
        self.rows
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn create(&mut self, key: &str, value: T) -> Result<(), StoreError> {
        if self.rows.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        self.rows
            .insert(key.to_string(), Versioned { version: 1, value });
        Ok(())
    }

    fn update(&mut self, key: &str, value: T, expected: u64) -> Result<(), StoreError> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if row.version != expected {
            return Err(StoreError::Conflict(key.to_string()));
        }
        row.version += 1;
        row.value = value;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.rows
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// In-process datastore with per-record versions. The production deployment
/// points the IPAM core at the orchestrator's datastore instead; this one
/// backs tests and single-process setups.
#[derive(Default)]
pub struct MemoryDatastore {
    pools: RwLock<Table<Pool>>,
    blocks: RwLock<Table<Block>>,
    handles: RwLock<Table<Handle>>,
}

impl MemoryDatastore {
    pub fn new() -> MemoryDatastore {
        MemoryDatastore::default()
    }
}

impl Datastore for MemoryDatastore {
    fn get_pool(&self, name: &str) -> Result<Versioned<Pool>, StoreError> {
        self.pools.read().get(name)
    }

    fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError> {
        let pools = self.pools.read();
        let mut all: Vec<_> = pools.rows.values().cloned().collect();
        all.sort_by(|a, b| a.value.name.cmp(&b.value.name));
        Ok(all)
    }

    fn create_pool(&self, pool: &Pool) -> Result<(), StoreError> {
        self.pools.write().create(&pool.name, pool.clone())
    }

    fn update_pool(&self, pool: &Pool, expected: u64) -> Result<(), StoreError> {
        self.pools.write().update(&pool.name, pool.clone(), expected)
    }

    fn get_block(&self, name: &str) -> Result<Versioned<Block>, StoreError> {
        self.blocks.read().get(name)
    }

    fn list_blocks(&self, pool: &str) -> Result<Vec<Versioned<Block>>, StoreError> {
        let blocks = self.blocks.read();
        let mut matching: Vec<_> = blocks
            .rows
            .values()
            .filter(|b| b.value.pool == pool)
            .cloned()
            .collect();
        matching.sort_by_key(|b| u32::from(b.value.cidr.network()));
        Ok(matching)
    }

    fn create_block(&self, block: &Block) -> Result<(), StoreError> {
        self.blocks.write().create(&block.name, block.clone())
    }

    fn update_block(&self, block: &Block, expected: u64) -> Result<(), StoreError> {
        self.blocks
            .write()
            .update(&block.name, block.clone(), expected)
    }

    fn delete_block(&self, name: &str) -> Result<(), StoreError> {
        self.blocks.write().delete(name)
    }

    fn get_handle(&self, id: &str) -> Result<Versioned<Handle>, StoreError> {
        self.handles.read().get(id)
    }

    fn list_handles(&self) -> Result<Vec<Versioned<Handle>>, StoreError> {
        let handles = self.handles.read();
        Ok(handles.rows.values().cloned().collect())
    }

    fn create_handle(&self, handle: &Handle) -> Result<(), StoreError> {
        self.handles.write().create(&handle.id, handle.clone())
    }

    fn update_handle(&self, handle: &Handle, expected: u64) -> Result<(), StoreError> {
        self.handles
            .write()
            .update(&handle.id, handle.clone(), expected)
    }

    fn delete_handle(&self, id: &str) -> Result<(), StoreError> {
        self.handles.write().delete(id)
    }
}
