//! Registered tables and their row mappers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ident::TableName;
use crate::identity::ReplicaIdentity;
use crate::types::{FieldMap, WalEvent};

/// Turns a raw row image into the application's row type.
pub type RowMapper<R> = Arc<dyn Fn(FieldMap) -> Result<R> + Send + Sync>;

/// A table whose changes are captured, with its replica identity and mapper.
pub struct TableRegistration<R> {
    table: TableName,
    replica_identity: ReplicaIdentity,
    mapper: RowMapper<R>,
}

impl<R> TableRegistration<R> {
    pub fn new<F>(table: TableName, replica_identity: ReplicaIdentity, mapper: F) -> Self
    where
        F: Fn(FieldMap) -> Result<R> + Send + Sync + 'static,
    {
        Self {
            table,
            replica_identity,
            mapper: Arc::new(mapper),
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn replica_identity(&self) -> &ReplicaIdentity {
        &self.replica_identity
    }

    /// The DDL applying this table's replica identity.
    pub fn replica_identity_ddl(&self) -> String {
        self.replica_identity.ddl(&self.table)
    }

    pub fn map_row(&self, row: FieldMap) -> Result<R> {
        (self.mapper)(row)
    }
}

impl TableRegistration<FieldMap> {
    /// Registration that publishes row images unchanged.
    pub fn raw(table: TableName, replica_identity: ReplicaIdentity) -> Self {
        Self::new(table, replica_identity, Ok)
    }
}

impl<R> Clone for TableRegistration<R> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            replica_identity: self.replica_identity.clone(),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<R> fmt::Debug for TableRegistration<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistration")
            .field("table", &self.table)
            .field("replica_identity", &self.replica_identity)
            .finish_non_exhaustive()
    }
}

/// Immutable set of registered tables, keyed by qualified name.
pub struct TableRegistry<R> {
    tables: BTreeMap<TableName, TableRegistration<R>>,
}

impl<R> TableRegistry<R> {
    /// Build a registry. Registering the same table twice is an error.
    pub fn new(registrations: impl IntoIterator<Item = TableRegistration<R>>) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for registration in registrations {
            let name = registration.table.clone();
            if tables.insert(name.clone(), registration).is_some() {
                return Err(Error::DuplicateTable(name.to_string()));
            }
        }
        Ok(Self { tables })
    }

    pub fn empty() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn get(&self, table: &TableName) -> Option<&TableRegistration<R>> {
        self.tables.get(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableRegistration<R>> {
        self.tables.values()
    }

    /// Value of the wal2json `add-tables` option.
    pub fn add_tables_option(&self) -> String {
        self.tables
            .keys()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Run the registered mapper over a decoded event. Messages pass through untouched.
    pub fn map_event(&self, event: WalEvent<FieldMap>) -> Result<WalEvent<R>> {
        match event {
            WalEvent::Message {
                meta_data,
                transactional,
                prefix,
                content,
            } => Ok(WalEvent::Message {
                meta_data,
                transactional,
                prefix,
                content,
            }),
            WalEvent::Change {
                table,
                meta_data,
                payload,
            } => {
                let registration = self
                    .get(&table)
                    .ok_or_else(|| Error::UnregisteredTable(table.to_string()))?;
                let payload = payload.try_map(|row| registration.map_row(row))?;
                Ok(WalEvent::Change {
                    table,
                    meta_data,
                    payload,
                })
            }
        }
    }
}

impl<R> Default for TableRegistry<R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<R> Clone for TableRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            tables: self.tables.clone(),
        }
    }
}

impl<R> fmt::Debug for TableRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tables.values()).finish()
    }
}
