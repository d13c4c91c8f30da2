//! Three keyed tables (`identifiers`, `operations`, `blocks`) behind a
//! common get/put/delete/keys/length API, plus the process-wide
//! single-open guard (spec §4.7).
//!
//! Grounded in `chain::storage::{mem,rocksdb}`'s `BlockStore` trait split
//! between an in-memory backend (used in tests) and a RocksDB-backed one
//! (used in `daemon`/`cli`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use uuid::Uuid;

use crate::block::Block;
use crate::codec::{Id, SENTINEL, UUID_LEN};
use crate::error::CoreError;
use crate::operation::Operation;
use crate::signed_object::{SignedObject, Verified};
use crate::tree::BlockTree;

/// One of the three logical tables (spec §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Identifiers,
    Operations,
    Blocks,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Identifiers => "identifiers",
            Table::Operations => "operations",
            Table::Blocks => "blocks",
        }
    }
}

/// Storage backend abstraction, so `Store` can run against an in-memory
/// map in tests and RocksDB in the daemon/CLI.
pub trait TableBackend: Send {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError>;
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), CoreError>;
    fn delete(&mut self, table: Table, key: &[u8]) -> Result<(), CoreError>;
    fn keys(&self, table: Table) -> Result<Vec<Vec<u8>>, CoreError>;
    fn length(&self, table: Table) -> Result<usize, CoreError>;
}

/// HashMap-backed table store, used by tests and by any caller that does
/// not need durability across restarts.
#[derive(Default)]
pub struct MemoryBackend {
    tables: HashMap<&'static str, HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.tables.get(table.name()).and_then(|t| t.get(key)).cloned())
    }

    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), CoreError> {
        self.tables
            .entry(table.name())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &[u8]) -> Result<(), CoreError> {
        match self.tables.entry(table.name()).or_default().remove(key) {
            Some(_) => Ok(()),
            None => Err(CoreError::DoesNotExist(format!("{} key not found", table.name()))),
        }
    }

    fn keys(&self, table: Table) -> Result<Vec<Vec<u8>>, CoreError> {
        Ok(self.tables.get(table.name()).map(|t| t.keys().cloned().collect()).unwrap_or_default())
    }

    fn length(&self, table: Table) -> Result<usize, CoreError> {
        Ok(self.tables.get(table.name()).map(|t| t.len()).unwrap_or(0))
    }
}

/// RocksDB-backed table store: one column family per table, matching
/// `chain::storage::rocksdb::RocksDbBlockStore`'s `cf_handle` style.
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    pub fn open(path: &str) -> Result<Self, CoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = [Table::Identifiers, Table::Operations, Table::Blocks]
            .iter()
            .map(|t| ColumnFamilyDescriptor::new(t.name(), Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, cfs)
            .map_err(|e| CoreError::Initialisation(format!("failed to open store at {path}: {e}")))?;
        Ok(RocksBackend { db })
    }

    fn cf(&self, table: Table) -> Result<&rocksdb::ColumnFamily, CoreError> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| CoreError::Initialisation(format!("missing column family {}", table.name())))
    }
}

impl TableBackend for RocksBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        let cf = self.cf(table)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| CoreError::Initialisation(format!("store read failed: {e}")))
    }

    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), CoreError> {
        let cf = self.cf(table)?;
        self.db
            .put_cf(cf, key, value)
            .map_err(|e| CoreError::Initialisation(format!("store write failed: {e}")))
    }

    fn delete(&mut self, table: Table, key: &[u8]) -> Result<(), CoreError> {
        if self.get(table, key)?.is_none() {
            return Err(CoreError::DoesNotExist(format!("{} key not found", table.name())));
        }
        let cf = self.cf(table)?;
        self.db
            .delete_cf(cf, key)
            .map_err(|e| CoreError::Initialisation(format!("store delete failed: {e}")))
    }

    fn keys(&self, table: Table) -> Result<Vec<Vec<u8>>, CoreError> {
        let cf = self.cf(table)?;
        Ok(self
            .db
            .iterator_cf(cf, rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok())
            .map(|(key, _)| key.to_vec())
            .collect())
    }

    fn length(&self, table: Table) -> Result<usize, CoreError> {
        Ok(self.keys(table)?.len())
    }
}

static STORE_OPEN: AtomicBool = AtomicBool::new(false);

/// A guard tying a `Store`'s lifetime to the process-wide single-open
/// invariant (spec §4.7, §5): dropped on `Store::drop`, so a second
/// `Store::open` fails until the first is gone.
struct OpenGuard;

impl Drop for OpenGuard {
    fn drop(&mut self) {
        STORE_OPEN.store(false, AtomicOrdering::SeqCst);
    }
}

/// The store: three logical tables plus the in-memory `BlockTree` built
/// from them at open time. Every API that touches storage takes an
/// explicit `&Store`/`&mut Store` (spec §9, "Global mutable Store");
/// `STORE_OPEN` only enforces that at most one such handle exists.
pub struct Store {
    backend: Box<dyn TableBackend>,
    tree: BlockTree,
    _guard: OpenGuard,
}

impl Store {
    /// Opens a store over `backend`, rejecting a second concurrent open
    /// with `Initialisation` (spec §4.7).
    pub fn open(backend: Box<dyn TableBackend>) -> Result<Self, CoreError> {
        if STORE_OPEN.swap(true, AtomicOrdering::SeqCst) {
            return Err(CoreError::Initialisation("close opened store first".into()));
        }
        let tree = BlockTree::rebuild(block_parent_pairs(backend.as_ref())?)?;
        Ok(Store {
            backend,
            tree,
            _guard: OpenGuard,
        })
    }

    pub fn open_memory() -> Result<Self, CoreError> {
        Store::open(Box::new(MemoryBackend::new()))
    }

    pub fn open_rocksdb(path: &str) -> Result<Self, CoreError> {
        Store::open(Box::new(RocksBackend::open(path)?))
    }

    pub fn tree(&self) -> &BlockTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut BlockTree {
        &mut self.tree
    }

    // -- operations --------------------------------------------------

    pub fn has_operation(&self, id: &Id) -> Result<bool, CoreError> {
        Ok(self.backend.get(Table::Operations, id)?.is_some())
    }

    pub fn get_operation(&self, id: &Id) -> Result<Operation, CoreError> {
        let bytes = self
            .backend
            .get(Table::Operations, id)?
            .ok_or_else(|| CoreError::DoesNotExist("operation not found".into()))?;
        let op = Operation::from_database_raw(&bytes)?;
        op.verify_id(*id)?;
        Ok(op)
    }

    pub fn operation_ids(&self) -> Result<Vec<Id>, CoreError> {
        Ok(self.backend.keys(Table::Operations)?.into_iter().map(|k| to_id(&k)).collect())
    }

    /// Inserts `op`, or merges its `containing_blocks` into an
    /// already-persisted entry for the same id (spec §4.3, "operation
    /// shared by sibling blocks"). Takes `&Verified<Operation>` rather than
    /// `&Operation` so the type system, not caller discipline, guarantees
    /// only pre-verified operations reach this table (spec §9).
    pub fn upsert_operation(&mut self, op: &Verified<Operation>) -> Result<(), CoreError> {
        let op = op.get();
        let id = op.id()?;
        let database_raw = match self.backend.get(Table::Operations, &id)? {
            Some(existing_bytes) => {
                let mut existing = Operation::from_database_raw(&existing_bytes)?;
                existing.containing_blocks.extend(op.containing_blocks.iter().copied());
                existing.database_raw()?
            }
            None => op.database_raw()?,
        };
        self.backend.put(Table::Operations, &id, &database_raw)
    }

    pub fn delete_operation(&mut self, id: &Id) -> Result<(), CoreError> {
        self.backend.delete(Table::Operations, id)
    }

    // -- blocks ------------------------------------------------------

    pub fn has_block(&self, id: &Id) -> Result<bool, CoreError> {
        Ok(self.backend.get(Table::Blocks, id)?.is_some())
    }

    pub fn get_block(&self, id: &Id) -> Result<Block, CoreError> {
        let bytes = self
            .backend
            .get(Table::Blocks, id)?
            .ok_or_else(|| CoreError::DoesNotExist("block not found".into()))?;
        let block = Block::from_raw(&bytes)?;
        block.verify_id(*id)?;
        Ok(block)
    }

    pub fn block_ids(&self) -> Result<Vec<Id>, CoreError> {
        Ok(self.backend.keys(Table::Blocks)?.into_iter().map(|k| to_id(&k)).collect())
    }

    /// Takes `&Verified<Block>` rather than `&Block` so the type system,
    /// not caller discipline, guarantees only pre-verified blocks reach
    /// this table (spec §9).
    pub fn put_block(&mut self, block: &Verified<Block>) -> Result<(), CoreError> {
        let block = block.get();
        let id = block.id()?;
        self.backend.put(Table::Blocks, &id, &block.raw()?)
    }

    pub fn delete_block(&mut self, id: &Id) -> Result<(), CoreError> {
        self.backend.delete(Table::Blocks, id)
    }

    // -- identifiers ---------------------------------------------------

    pub fn has_identifier(&self, uuid: &Uuid) -> Result<bool, CoreError> {
        Ok(self.backend.get(Table::Identifiers, uuid.as_bytes())?.is_some())
    }

    pub fn get_identifier(&self, uuid: &Uuid) -> Result<Id, CoreError> {
        let bytes = self
            .backend
            .get(Table::Identifiers, uuid.as_bytes())?
            .ok_or_else(|| CoreError::DoesNotExist("identifier not found".into()))?;
        Ok(to_id(&bytes))
    }

    pub fn put_identifier(&mut self, uuid: &Uuid, operation_id: Id) -> Result<(), CoreError> {
        self.backend.put(Table::Identifiers, uuid.as_bytes(), &operation_id)
    }

    pub fn delete_identifier(&mut self, uuid: &Uuid) -> Result<(), CoreError> {
        self.backend.delete(Table::Identifiers, uuid.as_bytes())
    }

    pub fn uuids(&self) -> Result<Vec<Uuid>, CoreError> {
        self.backend
            .keys(Table::Identifiers)?
            .into_iter()
            .map(|k| {
                let arr: [u8; UUID_LEN] = k
                    .try_into()
                    .map_err(|_| CoreError::RawFormat("malformed identifier key".into()))?;
                Ok(Uuid::from_bytes(arr))
            })
            .collect()
    }
}

fn to_id(bytes: &[u8]) -> Id {
    let mut out = SENTINEL;
    out.copy_from_slice(bytes);
    out
}

fn block_parent_pairs(backend: &dyn TableBackend) -> Result<Vec<(Id, Id)>, CoreError> {
    let mut pairs = Vec::new();
    for key in backend.keys(Table::Blocks)? {
        let bytes = backend
            .get(Table::Blocks, &key)?
            .ok_or_else(|| CoreError::DoesNotExist("block not found during rebuild".into()))?;
        let block = Block::from_raw(&bytes)?;
        pairs.push((to_id(&key), block.previous_block_rev.id()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_memory_store_has_sentinel_head() {
        let store = Store::open_memory().unwrap();
        assert_eq!(store.tree().head(), SENTINEL);
        assert_eq!(store.tree().max_depth(), 0);
    }

    #[test]
    fn second_open_is_rejected_while_first_is_live() {
        let _first = Store::open_memory().unwrap();
        assert!(matches!(Store::open_memory(), Err(CoreError::Initialisation(_))));
    }

    #[test]
    fn store_reopens_after_previous_is_dropped() {
        {
            let _first = Store::open_memory().unwrap();
        }
        assert!(Store::open_memory().is_ok());
    }

    #[test]
    fn get_block_rejects_a_key_id_mismatch() {
        use crate::keys::User;
        use crate::revision::Revision;

        let miner = User::generate();
        let mut block = Block::new(Revision::sentinel(), 1, 5, Vec::new(), 1).unwrap();
        block.mine().unwrap();
        block.sign(&miner).unwrap();
        let raw = block.raw().unwrap();

        let mut backend = MemoryBackend::new();
        let wrong_key = [9u8; 32];
        backend.put(Table::Blocks, &wrong_key, &raw).unwrap();

        let store = Store::open(Box::new(backend)).unwrap();
        assert!(matches!(store.get_block(&wrong_key), Err(CoreError::Verify(_))));
    }
}
