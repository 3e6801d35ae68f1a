//! Transaction controller
//!
//! ## Lifecycle
//!
//! ```text
//!   Initial ──(first request)──▶ Loading ──(pending == 0, built)──▶ Committing ──(complete)──▶ Done
//!      │                                                               ▲
//!      └──────────────(empty transaction, or abort)────────────────────┘
//! ```
//!
//! The controller counts outstanding requests. When the count drops to zero
//! and construction has finished, exactly one terminal message is sent:
//! `Commit` if no abort code is set, `Abort(code)` otherwise. Aborting does
//! not cancel requests already sent; their responses are rewritten to
//! `AbortError` when they arrive.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Client, Event};
use crate::actor::context::LocalEvent;
use crate::error::{ErrorCode, IdbError, Result};
use crate::protocol::{ChildMessage, CursorId, DatabaseId, TransactionId};
use crate::types::{DatabaseSpec, ObjectStoreMetadata, TransactionMode};

/// Process-wide logging serial for transactions
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// State of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransactionState {
    Initial,
    Loading,
    Committing,
    Done,
}

/// The one terminal message a controller sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    Commit,
    Abort(ErrorCode),
}

/// Client-side state of one transaction
#[derive(Debug)]
pub struct TransactionController {
    id: TransactionId,
    serial: u64,
    database: DatabaseId,
    mode: TransactionMode,
    state: TransactionState,
    pending: u64,
    abort_code: Option<ErrorCode>,
    object_store_names: Vec<String>,
    next_object_store_id: i64,
    next_index_id: i64,
    creating: bool,
    sent_commit_or_abort: bool,
    next_request_serial: u64,
    store_handles: Vec<ObjectStoreMetadata>,
    deleted_store_handles: Vec<ObjectStoreMetadata>,
    cursors: BTreeSet<CursorId>,
}

impl TransactionController {
    /// Create a controller for a regular transaction
    pub(crate) fn new(
        id: TransactionId,
        database: DatabaseId,
        mut object_store_names: Vec<String>,
        mode: TransactionMode,
    ) -> Self {
        object_store_names.sort();
        object_store_names.dedup();
        Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            database,
            mode,
            state: TransactionState::Initial,
            pending: 0,
            abort_code: None,
            object_store_names,
            next_object_store_id: 0,
            next_index_id: 0,
            creating: true,
            sent_commit_or_abort: false,
            next_request_serial: 1,
            store_handles: Vec::new(),
            deleted_store_handles: Vec::new(),
            cursors: BTreeSet::new(),
        }
    }

    /// Create the controller of a version change transaction
    pub(crate) fn version_change(
        id: TransactionId,
        database: DatabaseId,
        object_store_names: Vec<String>,
        next_object_store_id: i64,
        next_index_id: i64,
    ) -> Self {
        let mut controller = Self::new(id, database, object_store_names, TransactionMode::VersionChange);
        controller.next_object_store_id = next_object_store_id;
        controller.next_index_id = next_index_id;
        controller
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Logging serial number
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn database(&self) -> DatabaseId {
        self.database
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_request_count(&self) -> u64 {
        self.pending
    }

    /// `None` while the transaction is on the success path
    pub fn abort_code(&self) -> Option<ErrorCode> {
        self.abort_code
    }

    /// Sorted, deduplicated scope of the transaction
    pub fn object_store_names(&self) -> &[String] {
        &self.object_store_names
    }

    pub fn is_creating(&self) -> bool {
        self.creating
    }

    pub fn sent_commit_or_abort(&self) -> bool {
        self.sent_commit_or_abort
    }

    /// Not finished and not aborted
    pub fn is_open(&self) -> bool {
        matches!(self.state, TransactionState::Initial | TransactionState::Loading)
            && self.abort_code.is_none()
    }

    /// Open, and either still being built or the subject of the event being handled
    pub(crate) fn is_active(&self, dispatching: Option<TransactionId>) -> bool {
        self.is_open() && (self.creating || dispatching == Some(self.id))
    }

    pub(crate) fn has_object_store(&self, name: &str) -> bool {
        self.object_store_names
            .binary_search_by(|probe| probe.as_str().cmp(name))
            .is_ok()
    }

    pub(crate) fn next_request_serial(&mut self) -> u64 {
        let serial = self.next_request_serial;
        self.next_request_serial += 1;
        serial
    }

    pub(crate) fn on_request_dispatched(&mut self) {
        debug_assert!(self.is_open(), "request dispatched on a closed transaction");
        if self.state == TransactionState::Initial {
            self.state = TransactionState::Loading;
        }
        self.pending += 1;
    }

    pub(crate) fn on_request_finished(&mut self) {
        debug_assert!(self.pending > 0, "pending request count underflow");
        self.pending = self.pending.saturating_sub(1);
    }

    pub(crate) fn finish_construction(&mut self) {
        self.creating = false;
    }

    /// Check whether the terminal message can go out now. An abort does not
    /// wait for construction to finish.
    pub(crate) fn ready_to_finish(&self) -> bool {
        matches!(self.state, TransactionState::Initial | TransactionState::Loading)
            && !self.sent_commit_or_abort
            && self.pending == 0
            && (!self.creating || self.abort_code.is_some())
    }

    /// Move to Committing and decide the terminal message
    pub(crate) fn start_committing(&mut self) -> Terminal {
        debug_assert!(!self.sent_commit_or_abort, "commit or abort sent twice");
        self.state = TransactionState::Committing;
        self.sent_commit_or_abort = true;
        match self.abort_code {
            Some(code) => Terminal::Abort(code),
            None => Terminal::Commit,
        }
    }

    /// Set the abort code. Returns false when the transaction is already
    /// finishing or was aborted before.
    pub(crate) fn set_abort_code(&mut self, code: ErrorCode) -> bool {
        if matches!(self.state, TransactionState::Committing | TransactionState::Done) {
            return false;
        }
        if self.abort_code.is_some() {
            return false;
        }
        self.abort_code = Some(code);
        true
    }

    /// Treat the terminal message as sent without sending anything
    pub(crate) fn mark_sent_without_message(&mut self) {
        if matches!(self.state, TransactionState::Initial | TransactionState::Loading) {
            self.state = TransactionState::Committing;
        }
        self.sent_commit_or_abort = true;
    }

    /// Remote confirmation received
    pub(crate) fn on_complete(&mut self, result: std::result::Result<(), ErrorCode>) -> bool {
        if self.state != TransactionState::Committing {
            self.mark_sent_without_message();
        }
        let mut implicit_abort = false;
        if let Err(code) = result {
            if self.abort_code.is_none() {
                self.abort_code = Some(code);
                implicit_abort = true;
            }
        }
        self.state = TransactionState::Done;
        implicit_abort
    }

    /// Abnormal teardown: finish locally without talking to the remote side
    pub(crate) fn abandon(&mut self) {
        if self.abort_code.is_none() {
            self.abort_code = Some(ErrorCode::Abort);
        }
        if !self.sent_commit_or_abort {
            log::warn!(
                "Transaction [{}] torn down abnormally, treating abort as sent",
                self.serial
            );
        }
        self.mark_sent_without_message();
        self.state = TransactionState::Done;
    }

    pub(crate) fn allocate_object_store_id(&mut self) -> i64 {
        self.next_object_store_id += 1;
        self.next_object_store_id
    }

    pub(crate) fn allocate_index_id(&mut self) -> i64 {
        self.next_index_id += 1;
        self.next_index_id
    }

    pub(crate) fn add_object_store_name(&mut self, name: &str) {
        if let Err(pos) = self.object_store_names.binary_search_by(|p| p.as_str().cmp(name)) {
            self.object_store_names.insert(pos, name.to_string());
        }
    }

    pub(crate) fn remove_object_store_name(&mut self, name: &str) {
        self.object_store_names.retain(|n| n != name);
    }

    /// Remember a store handed out to the embedder
    pub(crate) fn cache_store_handle(&mut self, metadata: &ObjectStoreMetadata) {
        match self.store_handles.iter_mut().find(|h| h.id == metadata.id) {
            Some(handle) => *handle = metadata.clone(),
            None => self.store_handles.push(metadata.clone()),
        }
    }

    pub(crate) fn store_handle(&self, id: i64) -> Option<&ObjectStoreMetadata> {
        self.store_handles.iter().find(|h| h.id == id)
    }

    pub(crate) fn rename_store_handle(&mut self, id: i64, name: &str) {
        if let Some(handle) = self.store_handles.iter_mut().find(|h| h.id == id) {
            handle.name = name.to_string();
        }
    }

    /// Move a handle to the deleted set; it stays referenced until the
    /// controller is dropped
    pub(crate) fn delete_store_handle(&mut self, id: i64) {
        if let Some(pos) = self.store_handles.iter().position(|h| h.id == id) {
            let handle = self.store_handles.remove(pos);
            self.deleted_store_handles.push(handle);
        }
    }

    pub fn deleted_store_handle_count(&self) -> usize {
        self.deleted_store_handles.len()
    }

    /// Re-sync handles and scope with a reverted schema: stores created by
    /// this transaction disappear, deleted ones come back
    pub(crate) fn revert_store_handles(&mut self, spec: &DatabaseSpec) {
        let mut live = Vec::new();
        for handle in self
            .store_handles
            .drain(..)
            .chain(self.deleted_store_handles.drain(..))
        {
            if let Some(store) = spec.object_store_by_id(handle.id) {
                live.push(store.metadata.clone());
            }
        }
        self.store_handles = live;
        self.object_store_names = spec.object_store_names();
    }

    pub(crate) fn add_cursor(&mut self, cursor: CursorId) {
        self.cursors.insert(cursor);
    }

    pub(crate) fn remove_cursor(&mut self, cursor: CursorId) {
        self.cursors.remove(&cursor);
    }

    pub(crate) fn cursors(&self) -> impl Iterator<Item = CursorId> + '_ {
        self.cursors.iter().copied()
    }

    /// Done and nothing references the transaction anymore
    pub(crate) fn can_release(&self) -> bool {
        self.state == TransactionState::Done && self.pending == 0 && self.cursors.is_empty()
    }
}

impl Client {
    /// Abort a transaction with the given code.
    ///
    /// Aborting a transaction that is already committing or done does nothing.
    pub fn abort(&mut self, transaction: TransactionId, code: ErrorCode) -> Result<()> {
        self.context.assert_owning_thread();
        if !self.transactions.contains_key(&transaction) {
            return Err(IdbError::unknown_actor("transaction", transaction.0));
        }
        self.abort_transaction(transaction, code);
        Ok(())
    }

    pub(crate) fn abort_transaction(&mut self, transaction: TransactionId, code: ErrorCode) {
        let controller = match self.transactions.get_mut(&transaction) {
            Some(controller) => controller,
            None => return,
        };
        if !controller.set_abort_code(code) {
            log::debug!(
                "Transaction [{}] abort({}) ignored in state {:?}",
                controller.serial(),
                code,
                controller.state()
            );
            return;
        }
        log::info!(
            "Transaction [{}] aborting with {} ({} requests pending)",
            controller.serial(),
            code,
            controller.pending_request_count()
        );

        if controller.mode() == TransactionMode::VersionChange {
            self.revert_version_change(transaction);
        }
        self.maybe_finish(transaction);
    }

    /// Restore the schema saved when the version change started and close
    /// the database
    pub(crate) fn revert_version_change(&mut self, transaction: TransactionId) {
        let controller = match self.transactions.get_mut(&transaction) {
            Some(controller) => controller,
            None => return,
        };
        let database = controller.database();
        if let Some(db) = self.databases.get_mut(&database) {
            if let Some(spec) = db.revert_version_change() {
                controller.revert_store_handles(spec);
                log::info!(
                    "Transaction [{}] reverted schema of '{}' to version {}",
                    controller.serial(),
                    spec.name,
                    spec.version
                );
            }
        }
        self.close_database(database);
    }

    /// Send the terminal message if the controller is ready for it
    pub(crate) fn maybe_finish(&mut self, transaction: TransactionId) {
        let invalidated = self
            .transactions
            .get(&transaction)
            .and_then(|c| self.databases.get(&c.database()))
            .map_or(false, |db| db.is_invalidated());

        let controller = match self.transactions.get_mut(&transaction) {
            Some(controller) => controller,
            None => return,
        };
        if !controller.ready_to_finish() {
            return;
        }

        let request_serial = controller.next_request_serial();
        if invalidated {
            controller.mark_sent_without_message();
            log::debug!(
                "Transaction [{}] request [{}]: database invalidated, not sending commit/abort",
                controller.serial(),
                request_serial
            );
            return;
        }

        let message = match controller.start_committing() {
            Terminal::Commit => {
                log::debug!(
                    "Transaction [{}] request [{}]: commit",
                    controller.serial(),
                    request_serial
                );
                ChildMessage::Commit { transaction }
            }
            Terminal::Abort(code) => {
                log::debug!(
                    "Transaction [{}] request [{}]: abort({})",
                    controller.serial(),
                    request_serial,
                    code
                );
                ChildMessage::Abort { transaction, code }
            }
        };
        self.send(message);
    }

    /// Bookkeeping after the embedder handled a request's terminal event
    pub(crate) fn on_request_finished(&mut self, transaction: TransactionId) {
        match self.transactions.get_mut(&transaction) {
            Some(controller) => controller.on_request_finished(),
            None => {
                log::debug!("Request finished on released {}", transaction);
                return;
            }
        }
        self.maybe_finish(transaction);
        self.maybe_release(transaction);
    }

    /// Construction finished: the transaction stops being implicitly active
    pub(crate) fn on_transaction_created(&mut self, transaction: TransactionId) {
        if let Some(controller) = self.transactions.get_mut(&transaction) {
            controller.finish_construction();
            self.maybe_finish(transaction);
        }
    }

    pub(crate) fn on_transaction_complete(
        &mut self,
        transaction: TransactionId,
        result: std::result::Result<(), ErrorCode>,
    ) {
        let controller = match self.transactions.get_mut(&transaction) {
            Some(controller) => controller,
            None => {
                log::warn!("Completion for unknown {}", transaction);
                return;
            }
        };
        if controller.state() == TransactionState::Done {
            log::warn!("Transaction [{}] completed twice", controller.serial());
            return;
        }
        if controller.state() != TransactionState::Committing {
            log::warn!(
                "Transaction [{}] completed by the remote side in state {:?}",
                controller.serial(),
                controller.state()
            );
        }

        let implicit_abort = controller.on_complete(result);
        let database = controller.database();
        let mode = controller.mode();
        let committed = controller.abort_code().is_none();
        let event = match controller.abort_code() {
            Some(code) => Event::Abort { transaction, code },
            None => Event::Complete { transaction },
        };
        log::info!("Transaction [{}] done: {:?}", controller.serial(), result);
        let cursors: Vec<CursorId> = controller.cursors().collect();

        if mode == TransactionMode::VersionChange {
            if implicit_abort {
                self.revert_version_change(transaction);
            } else if committed {
                if let Some(db) = self.databases.get_mut(&database) {
                    db.commit_version_change();
                }
            }
        }

        if let Some(db) = self.databases.get_mut(&database) {
            db.unregister_transaction(transaction);
            if db.live_transaction_count() == 0 {
                let expired = db.expire_delegated();
                if expired > 0 {
                    log::debug!("{}: expired {} delegated blobs", database, expired);
                }
            }
        }

        for cursor in cursors {
            self.context.dispatch_later(LocalEvent::CursorDeleteMe(cursor));
        }

        self.queue_event(event, None, None);
        self.maybe_release(transaction);
    }

    /// Send `TransactionDeleteMe` once nothing references a finished transaction
    pub(crate) fn maybe_release(&mut self, transaction: TransactionId) {
        let releasable = self
            .transactions
            .get(&transaction)
            .map_or(false, |c| c.can_release());
        if !releasable || !self.channel_open {
            return;
        }
        if let Some(controller) = self.transactions.remove(&transaction) {
            log::debug!("Transaction [{}] released", controller.serial());
        }
        self.send(ChildMessage::TransactionDeleteMe { transaction });
    }

    /// Look up a transaction that may accept operations right now
    pub(crate) fn active_transaction_mut(
        &mut self,
        transaction: TransactionId,
    ) -> Result<&mut TransactionController> {
        let dispatching = self.dispatching;
        let controller = self
            .transactions
            .get_mut(&transaction)
            .ok_or_else(|| IdbError::unknown_actor("transaction", transaction.0))?;
        if !controller.is_active(dispatching) {
            return Err(IdbError::transaction_inactive(controller.serial()));
        }
        Ok(controller)
    }
}
