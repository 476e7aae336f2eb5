//! Persistent catalog storage backed by redb.
//!
//! Every catalog mutation is written as one batch of [`Change`]s in a
//! single write transaction. Reads are served from the in-memory
//! [`CatalogState`] loaded at open; this module only handles persistence.

use crate::state::CatalogState;
use crate::tables;
use datagrid_common::{Error, ReplicaInfo};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::{debug, error};

/// Error type for catalog store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::catalog(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One persisted key update
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    /// Replace an object's rows, or delete the object when `None`
    DataObject(&'a str, Option<&'a [ReplicaInfo]>),
    Collection(&'a str, u64),
    Property {
        resource: &'a str,
        key: &'a str,
        value: &'a str,
    },
    Quota(&'a str, u64),
    ResourceGroup(&'a str, &'a [String]),
    DefaultResource(Option<&'a str>),
    NextDataId(u64),
}

/// Catalog tables in a redb database
pub struct CatalogStore {
    db: Database,
}

impl CatalogStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::DATA_OBJECTS)?;
            let _t = write_txn.open_table(tables::COLLECTIONS)?;
            let _t = write_txn.open_table(tables::RESOURCE_PROPS)?;
            let _t = write_txn.open_table(tables::QUOTA_USAGE)?;
            let _t = write_txn.open_table(tables::RESOURCE_GROUPS)?;
            let _t = write_txn.open_table(tables::SETTINGS)?;
            let _t = write_txn.open_table(tables::COUNTERS)?;
        }
        write_txn.commit()?;

        debug!("Opened catalog store at {}", path.display());
        Ok(Self { db })
    }

    /// Write a batch of changes atomically
    pub fn apply(&self, changes: &[Change<'_>]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut objects = write_txn.open_table(tables::DATA_OBJECTS)?;
            let mut collections = write_txn.open_table(tables::COLLECTIONS)?;
            let mut props = write_txn.open_table(tables::RESOURCE_PROPS)?;
            let mut quotas = write_txn.open_table(tables::QUOTA_USAGE)?;
            let mut groups = write_txn.open_table(tables::RESOURCE_GROUPS)?;
            let mut settings = write_txn.open_table(tables::SETTINGS)?;
            let mut counters = write_txn.open_table(tables::COUNTERS)?;

            for change in changes {
                match *change {
                    Change::DataObject(path, Some(rows)) => {
                        let bytes = bincode::serialize(rows)?;
                        objects.insert(path, bytes.as_slice())?;
                    }
                    Change::DataObject(path, None) => {
                        objects.remove(path)?;
                    }
                    Change::Collection(path, created) => {
                        collections.insert(path, created)?;
                    }
                    Change::Property {
                        resource,
                        key,
                        value,
                    } => {
                        props.insert(tables::property_key(resource, key).as_str(), value)?;
                    }
                    Change::Quota(resource, usage) => {
                        quotas.insert(resource, usage)?;
                    }
                    Change::ResourceGroup(name, members) => {
                        let bytes = bincode::serialize(members)?;
                        groups.insert(name, bytes.as_slice())?;
                    }
                    Change::DefaultResource(Some(name)) => {
                        settings.insert(tables::DEFAULT_RESOURCE_KEY, name)?;
                    }
                    Change::DefaultResource(None) => {
                        settings.remove(tables::DEFAULT_RESOURCE_KEY)?;
                    }
                    Change::NextDataId(id) => {
                        counters.insert(tables::NEXT_DATA_ID_KEY, id)?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every table into a fresh in-memory state
    pub fn load_state(&self) -> StoreResult<CatalogState> {
        let read_txn = self.db.begin_read()?;
        let mut state = CatalogState::default();

        let objects = read_txn.open_table(tables::DATA_OBJECTS)?;
        for entry in objects.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<Vec<ReplicaInfo>>(entry.1.value()) {
                Ok(rows) => {
                    state.insert_object(key, rows);
                }
                Err(e) => error!("Failed to decode data object '{}': {}", key, e),
            }
        }

        let collections = read_txn.open_table(tables::COLLECTIONS)?;
        for entry in collections.iter()? {
            let entry = entry?;
            state
                .collections
                .insert(entry.0.value().to_string(), entry.1.value());
        }

        let props = read_txn.open_table(tables::RESOURCE_PROPS)?;
        for entry in props.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            if let Some((resource, prop)) = key.split_once('\x00') {
                state.props.insert(
                    (resource.to_string(), prop.to_string()),
                    entry.1.value().to_string(),
                );
            }
        }

        let quotas = read_txn.open_table(tables::QUOTA_USAGE)?;
        for entry in quotas.iter()? {
            let entry = entry?;
            state.quotas.insert(entry.0.value().to_string(), entry.1.value());
        }

        let groups = read_txn.open_table(tables::RESOURCE_GROUPS)?;
        for entry in groups.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<Vec<String>>(entry.1.value()) {
                Ok(members) => {
                    state.groups.insert(key, members);
                }
                Err(e) => error!("Failed to decode resource group '{}': {}", key, e),
            }
        }

        let settings = read_txn.open_table(tables::SETTINGS)?;
        state.default_resource = settings
            .get(tables::DEFAULT_RESOURCE_KEY)?
            .map(|v| v.value().to_string());

        let counters = read_txn.open_table(tables::COUNTERS)?;
        let stored_next = counters
            .get(tables::NEXT_DATA_ID_KEY)?
            .map_or(0, |v| v.value());
        state.next_data_id = state.next_data_id.max(stored_next);

        Ok(state)
    }
}
