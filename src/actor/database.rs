//! Database handles
//!
//! A handle owns the schema snapshot its transactions see. While a version
//! change transaction runs, the snapshot before the upgrade is kept so an
//! abort can restore it.

use std::collections::{BTreeSet, HashMap};

use super::{Client, Deferred, Event};
use crate::actor::context::LocalEvent;
use crate::actor::transaction::TransactionController;
use crate::error::{IdbError, Result};
use crate::protocol::{ChildMessage, DatabaseId, TransactionId};
use crate::types::{DatabaseSpec, TransactionMode};
use crate::value::{BlobDescriptor, BlobId};

/// Client-side state of one open database connection
#[derive(Debug)]
pub struct DatabaseHandle {
    id: DatabaseId,
    spec: DatabaseSpec,
    previous_spec: Option<DatabaseSpec>,
    closed: bool,
    close_sent: bool,
    invalidated: bool,
    transactions: BTreeSet<TransactionId>,
    version_change: Option<TransactionId>,
    delegated_blobs: HashMap<BlobId, BlobDescriptor>,
}

impl DatabaseHandle {
    pub(crate) fn new(id: DatabaseId, spec: DatabaseSpec) -> Self {
        Self {
            id,
            spec,
            previous_spec: None,
            closed: false,
            close_sent: false,
            invalidated: false,
            transactions: BTreeSet::new(),
            version_change: None,
            delegated_blobs: HashMap::new(),
        }
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> u64 {
        self.spec.version
    }

    /// Current schema snapshot
    pub fn spec(&self) -> &DatabaseSpec {
        &self.spec
    }

    pub(crate) fn spec_mut(&mut self) -> &mut DatabaseSpec {
        &mut self.spec
    }

    /// Snapshot saved when the running version change started
    pub fn previous_spec(&self) -> Option<&DatabaseSpec> {
        self.previous_spec.as_ref()
    }

    pub fn object_store_names(&self) -> Vec<String> {
        self.spec.object_store_names()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn running_version_change(&self) -> Option<TransactionId> {
        self.version_change
    }

    pub fn live_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn delegated_blob_count(&self) -> usize {
        self.delegated_blobs.len()
    }

    pub(crate) fn register_transaction(&mut self, transaction: TransactionId) {
        self.transactions.insert(transaction);
    }

    pub(crate) fn unregister_transaction(&mut self, transaction: TransactionId) {
        self.transactions.remove(&transaction);
    }

    pub(crate) fn live_transactions(&self) -> Vec<TransactionId> {
        self.transactions.iter().copied().collect()
    }

    /// Save the current snapshot and move to the requested version
    pub(crate) fn enter_version_change(&mut self, transaction: TransactionId, version: u64) {
        debug_assert!(self.previous_spec.is_none(), "nested version change");
        self.previous_spec = Some(self.spec.clone());
        self.spec.version = version;
        self.version_change = Some(transaction);
    }

    pub(crate) fn commit_version_change(&mut self) {
        self.previous_spec = None;
        self.version_change = None;
    }

    /// Restore the saved snapshot, returning it
    pub(crate) fn revert_version_change(&mut self) -> Option<&DatabaseSpec> {
        self.version_change = None;
        let previous = self.previous_spec.take()?;
        self.spec = previous;
        Some(&self.spec)
    }

    /// Close without telling the remote side; returns whether it was open
    pub(crate) fn mark_closed_locally(&mut self) -> bool {
        let was_open = !self.closed;
        self.closed = true;
        self.close_sent = true;
        was_open
    }

    pub(crate) fn delegate_blob(&mut self, blob: &BlobDescriptor) {
        self.delegated_blobs.insert(blob.id, blob.clone());
    }

    /// Drop every delegated blob, returning how many were held
    pub(crate) fn expire_delegated(&mut self) -> usize {
        let count = self.delegated_blobs.len();
        self.delegated_blobs.clear();
        count
    }
}

impl Client {
    /// Look up a database handle
    pub fn database(&self, database: DatabaseId) -> Option<&DatabaseHandle> {
        self.databases.get(&database)
    }

    /// Start a transaction over the named object stores
    pub fn transaction(
        &mut self,
        database: DatabaseId,
        object_stores: &[&str],
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        self.context.assert_owning_thread();

        let db = self
            .databases
            .get(&database)
            .ok_or_else(|| IdbError::unknown_actor("database", database.0))?;
        if db.is_closed() {
            return Err(IdbError::InvalidState(format!("Database '{}' is closed", db.name())));
        }
        if db.running_version_change().is_some() {
            return Err(IdbError::InvalidState(format!(
                "A version change transaction is running on '{}'",
                db.name()
            )));
        }
        if mode == TransactionMode::VersionChange {
            return Err(IdbError::Type(
                "Version change transactions are only created by open requests".into(),
            ));
        }
        if object_stores.is_empty() {
            return Err(IdbError::NotFound("No object store names given".into()));
        }
        for name in object_stores {
            if db.spec().object_store(name).is_none() {
                return Err(IdbError::object_store_not_found(name));
            }
        }

        let transaction = self.allocate_transaction_id();
        let names: Vec<String> = object_stores.iter().map(|s| s.to_string()).collect();
        let controller = TransactionController::new(transaction, database, names, mode);
        let serial = controller.serial();
        let scope = controller.object_store_names().to_vec();
        self.transactions.insert(transaction, controller);
        if let Some(db) = self.databases.get_mut(&database) {
            db.register_transaction(transaction);
        }

        if !self
            .context
            .run_before_next_tick(LocalEvent::TransactionCreated(transaction))
        {
            self.transactions.remove(&transaction);
            if let Some(db) = self.databases.get_mut(&database) {
                db.unregister_transaction(transaction);
            }
            log::warn!("Transaction [{}] torn down: owning context is shutting down", serial);
            return Err(IdbError::InvalidState("Owning context is shutting down".into()));
        }

        log::debug!(
            "Transaction [{}] created: {} {:?} on {}",
            serial,
            mode,
            scope,
            database
        );
        self.send(ChildMessage::NewTransaction {
            database,
            transaction,
            object_stores: scope,
            mode,
        });
        Ok(transaction)
    }

    /// Close a database connection
    pub fn close(&mut self, database: DatabaseId) -> Result<()> {
        self.context.assert_owning_thread();
        if !self.databases.contains_key(&database) {
            return Err(IdbError::unknown_actor("database", database.0));
        }
        self.close_database(database);
        Ok(())
    }

    /// Object store names of a database, sorted
    pub fn object_store_names(&self, database: DatabaseId) -> Result<Vec<String>> {
        self.databases
            .get(&database)
            .map(DatabaseHandle::object_store_names)
            .ok_or_else(|| IdbError::unknown_actor("database", database.0))
    }

    /// Mark a database closed and tell the remote side, once
    pub(crate) fn close_database(&mut self, database: DatabaseId) {
        let db = match self.databases.get_mut(&database) {
            Some(db) => db,
            None => return,
        };
        db.closed = true;
        if db.close_sent {
            return;
        }
        db.close_sent = true;
        log::debug!("Closing database '{}' ({})", db.name(), database);
        self.send(ChildMessage::DatabaseClose { database });
    }

    pub(crate) fn on_version_change(
        &mut self,
        database: DatabaseId,
        old_version: u64,
        new_version: Option<u64>,
    ) {
        let db = match self.databases.get(&database) {
            Some(db) => db,
            None => {
                log::warn!("Version change for unknown {}", database);
                return;
            }
        };
        if db.is_closed() {
            log::debug!("Ignoring version change for closed database '{}'", db.name());
            return;
        }
        self.queue_event(
            Event::VersionChange {
                database,
                old_version,
                new_version,
            },
            None,
            Some(Deferred::DatabaseBlocked(database)),
        );
    }

    /// Runs after the embedder handled a version change event
    pub(crate) fn on_version_change_handled(&mut self, database: DatabaseId) {
        let still_open = self
            .databases
            .get(&database)
            .map_or(false, |db| !db.is_closed());
        if still_open {
            self.send(ChildMessage::DatabaseBlocked { database });
        }
    }

    pub(crate) fn on_invalidate(&mut self, database: DatabaseId) {
        let db = match self.databases.get_mut(&database) {
            Some(db) => db,
            None => {
                log::warn!("Invalidate for unknown {}", database);
                return;
            }
        };
        log::info!("Database '{}' invalidated", db.name());
        db.invalidated = true;
        let was_open = !db.is_closed();

        for transaction in db.live_transactions() {
            self.abort_transaction(transaction, crate::error::ErrorCode::Abort);
        }
        self.close_database(database);
        if was_open {
            self.queue_event(Event::Close { database }, None, None);
        }
    }
}
