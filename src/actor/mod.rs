//! Client actors
//!
//! The [`Client`] is the root of every client-side actor on one execution
//! context. It owns the handles and proxies, pumps messages from the remote
//! side and hands events to the embedder one at a time.
//!
//! ## Event hand-off
//!
//! ```text
//!   embedder                    Client                         remote side
//!   ────────                    ──────                         ───────────
//!   next_event() ──────▶  1. finish previous event
//!                            (pending decrement, blocked notice)
//!                         2. queued event? ──────────────▶ return it
//!                         3. stable queue / local queue
//!                         4. remote message ◀──────────────── ParentMessage
//!                            └─▶ handler queues events, loop
//! ```
//!
//! While an event is out, its transaction (if any) is the dispatch scope and
//! accepts new operations. Bookkeeping that must follow the embedder's
//! handling runs at step 1 of the next call, so operations issued from a
//! success handler keep the transaction alive.

pub mod context;
pub mod cursor;
pub mod database;
pub mod factory;
pub mod object_store;
pub mod permission;
pub mod request;
pub mod schema;
pub mod transaction;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{ErrorCode, Result};
use crate::preprocess::{BlobResolver, MemoryBlobResolver, PreprocessPool};
use crate::protocol::channel::{ClientEndpoint, Received};
use crate::protocol::{
    ChildMessage, CursorId, CursorResponse, DatabaseId, ParentMessage, RequestId, TransactionId,
};
use crate::value::{JsonCodec, ValueCodec};
use crate::Config;

use context::{LocalEvent, OwningContext};
use cursor::CursorProxy;
use database::DatabaseHandle;
use factory::FactoryRequest;
use permission::{ChallengeState, PermissionPrompt, PrivilegedDispatcher};
use request::{RequestProxy, RequestResult};
use transaction::{TransactionController, TransactionState};

/// Something the embedder must react to
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A request succeeded
    Success {
        request: RequestId,
        transaction: Option<TransactionId>,
        result: RequestResult,
    },
    /// A request failed
    Error {
        request: RequestId,
        transaction: Option<TransactionId>,
        code: ErrorCode,
    },
    /// An open or delete request waits for other connections to close
    Blocked {
        request: RequestId,
        old_version: u64,
        new_version: Option<u64>,
    },
    /// An open request started a version change transaction
    UpgradeNeeded {
        request: RequestId,
        database: DatabaseId,
        transaction: TransactionId,
        old_version: u64,
        new_version: u64,
    },
    Complete {
        transaction: TransactionId,
    },
    Abort {
        transaction: TransactionId,
        code: ErrorCode,
    },
    /// Another connection wants to upgrade or delete the database
    VersionChange {
        database: DatabaseId,
        old_version: u64,
        new_version: Option<u64>,
    },
    /// The database was closed by the remote side
    Close {
        database: DatabaseId,
    },
}

/// Bookkeeping that runs once the embedder is done with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    RequestFinished(TransactionId),
    DatabaseBlocked(DatabaseId),
}

#[derive(Debug)]
struct Queued {
    event: Event,
    scope: Option<TransactionId>,
    after: Option<Deferred>,
}

enum Wake {
    Remote(Option<ParentMessage>),
    Local(Option<LocalEvent>),
}

/// Builder for a [`Client`] with custom collaborators
pub struct ClientBuilder {
    config: Config,
    codec: Arc<dyn ValueCodec>,
    resolver: Arc<dyn BlobResolver>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    dispatcher: Option<Arc<dyn PrivilegedDispatcher>>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            codec: Arc::new(JsonCodec),
            resolver: Arc::new(MemoryBlobResolver::new()),
            prompt: None,
            dispatcher: None,
        }
    }

    pub fn codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Where out-of-band values are read from
    pub fn blob_resolver(mut self, resolver: Arc<dyn BlobResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn permission_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Hop used by worker contexts to reach the privileged context
    pub fn privileged_dispatcher(mut self, dispatcher: Arc<dyn PrivilegedDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Bind the client to the calling thread and the given channel
    pub fn build(self, endpoint: ClientEndpoint) -> Result<Client> {
        let pool = PreprocessPool::new(self.config.preprocess.threads)?;
        log::info!(
            "Client started on a {:?} context ({} preprocess threads)",
            self.config.context,
            pool.size()
        );
        Ok(Client {
            context: OwningContext::new(self.config.context),
            config: self.config,
            endpoint,
            channel_open: true,
            codec: self.codec,
            resolver: self.resolver,
            pool,
            prompt: self.prompt,
            dispatcher: self.dispatcher,
            factory_requests: HashMap::new(),
            challenges: HashMap::new(),
            databases: BTreeMap::new(),
            transactions: BTreeMap::new(),
            requests: BTreeMap::new(),
            cursors: BTreeMap::new(),
            next_request_id: 1,
            next_transaction_id: 1,
            next_cursor_id: 1,
            events: VecDeque::new(),
            dispatching: None,
            after_dispatch: None,
        })
    }
}

/// Root of the client actors on one execution context
pub struct Client {
    config: Config,
    context: OwningContext,
    endpoint: ClientEndpoint,
    channel_open: bool,
    codec: Arc<dyn ValueCodec>,
    resolver: Arc<dyn BlobResolver>,
    pool: PreprocessPool,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    dispatcher: Option<Arc<dyn PrivilegedDispatcher>>,
    factory_requests: HashMap<RequestId, FactoryRequest>,
    challenges: HashMap<RequestId, ChallengeState>,
    databases: BTreeMap<DatabaseId, DatabaseHandle>,
    transactions: BTreeMap<TransactionId, TransactionController>,
    requests: BTreeMap<RequestId, RequestProxy>,
    cursors: BTreeMap<CursorId, CursorProxy>,
    next_request_id: u64,
    next_transaction_id: u64,
    next_cursor_id: u64,
    events: VecDeque<Queued>,
    /// Transaction whose event the embedder is handling
    dispatching: Option<TransactionId>,
    after_dispatch: Option<Deferred>,
}

impl Client {
    /// Build a client with the default codec and an empty in-memory blob resolver
    pub fn new(config: Config, endpoint: ClientEndpoint) -> Result<Self> {
        ClientBuilder::new(config).build(endpoint)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up a transaction controller
    pub fn controller(&self, transaction: TransactionId) -> Option<&TransactionController> {
        self.transactions.get(&transaction)
    }

    /// Transaction whose event is currently out
    pub fn dispatching(&self) -> Option<TransactionId> {
        self.dispatching
    }

    /// Check whether an operation request is still outstanding
    pub fn has_request(&self, request: RequestId) -> bool {
        self.requests.contains_key(&request)
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    /// Events queued and not handed out yet
    pub fn queued_event_count(&self) -> usize {
        self.events.len()
    }

    /// Hand out the next event without blocking.
    ///
    /// Calling this also tells the client the previous event was handled.
    pub fn next_event(&mut self) -> Option<Event> {
        self.context.assert_owning_thread();
        self.end_dispatch();

        loop {
            if let Some(queued) = self.events.pop_front() {
                return Some(self.begin_dispatch(queued));
            }
            if let Some(local) = self.context.take_stable() {
                self.on_local_event(local);
                continue;
            }
            if let Some(local) = self.context.try_next() {
                self.on_local_event(local);
                continue;
            }
            if !self.channel_open {
                return None;
            }
            match self.endpoint.try_recv() {
                Received::Message(message) => self.on_message(message),
                Received::Empty => return None,
                Received::Closed => self.on_channel_closed(),
            }
        }
    }

    /// Wait for the next event. Returns `None` once the channel is closed and
    /// no local work remains, or after shutdown.
    pub async fn wait_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.next_event() {
                return Some(event);
            }
            if !self.channel_open && !self.has_local_work() {
                return None;
            }

            let wake = if self.channel_open {
                tokio::select! {
                    message = self.endpoint.recv() => Wake::Remote(message),
                    local = self.context.next() => Wake::Local(local),
                }
            } else {
                Wake::Local(self.context.next().await)
            };

            match wake {
                Wake::Remote(Some(message)) => self.on_message(message),
                Wake::Remote(None) => self.on_channel_closed(),
                Wake::Local(Some(local)) => self.on_local_event(local),
                Wake::Local(None) => return None,
            }
        }
    }

    /// Stop accepting scheduled work and detach running preprocess tasks.
    ///
    /// Transactions already created finish construction first, so each still
    /// sends its commit or abort. Requests waiting on preprocessing fail with
    /// AbortError and abort their transaction. Open databases stay open, but
    /// no new transaction can be created.
    pub fn shutdown(&mut self) {
        self.context.assert_owning_thread();
        log::info!(
            "Client shutting down ({} requests, {} transactions live)",
            self.requests.len(),
            self.transactions.len()
        );
        while let Some(local) = self.context.take_stable() {
            self.on_local_event(local);
        }
        self.context.shut_down();
        self.abort_preprocessing_requests();
    }

    fn end_dispatch(&mut self) {
        self.dispatching = None;
        match self.after_dispatch.take() {
            Some(Deferred::RequestFinished(transaction)) => self.on_request_finished(transaction),
            Some(Deferred::DatabaseBlocked(database)) => self.on_version_change_handled(database),
            None => {}
        }
        while let Some(local) = self.context.take_stable() {
            self.on_local_event(local);
        }
    }

    fn begin_dispatch(&mut self, queued: Queued) -> Event {
        self.dispatching = queued.scope;
        self.after_dispatch = queued.after;
        queued.event
    }

    pub(crate) fn queue_event(
        &mut self,
        event: Event,
        scope: Option<TransactionId>,
        after: Option<Deferred>,
    ) {
        self.events.push_back(Queued {
            event,
            scope,
            after,
        });
    }

    /// Send a message unless the channel is gone
    pub(crate) fn send(&self, message: ChildMessage) {
        if !self.channel_open {
            log::debug!("Channel closed, dropping {:?}", message);
            return;
        }
        if let Err(e) = self.endpoint.send(message) {
            log::warn!("{}", e);
        }
    }

    pub(crate) fn allocate_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    pub(crate) fn allocate_transaction_id(&mut self) -> TransactionId {
        let id = TransactionId(self.next_transaction_id);
        self.next_transaction_id += 1;
        id
    }

    /// Keep client-allocated ids clear of one the remote side picked
    pub(crate) fn reserve_transaction_id(&mut self, transaction: TransactionId) {
        if transaction.0 >= self.next_transaction_id {
            self.next_transaction_id = transaction.0 + 1;
        }
    }

    pub(crate) fn allocate_cursor_id(&mut self) -> CursorId {
        let id = CursorId(self.next_cursor_id);
        self.next_cursor_id += 1;
        id
    }

    /// Preprocess tasks or permission checks that will report back locally
    fn has_local_work(&self) -> bool {
        self.has_running_preprocess() || self.has_pending_challenge()
    }

    fn on_message(&mut self, message: ParentMessage) {
        match message {
            ParentMessage::FactoryBlocked {
                request,
                current_version,
                requested_version,
            } => self.on_factory_blocked(request, current_version, requested_version),
            ParentMessage::PermissionChallenge { request, principal } => {
                self.on_permission_challenge(request, principal)
            }
            ParentMessage::DatabaseCreated {
                request,
                database,
                spec,
            } => self.on_database_created(request, database, spec),
            ParentMessage::UpgradeNeeded {
                request,
                database,
                transaction,
                current_version,
                requested_version,
                next_object_store_id,
                next_index_id,
            } => self.on_upgrade_needed(
                request,
                database,
                transaction,
                current_version,
                requested_version,
                next_object_store_id,
                next_index_id,
            ),
            ParentMessage::FactoryResponse { request, response } => {
                self.on_factory_response(request, response)
            }
            ParentMessage::VersionChange {
                database,
                old_version,
                new_version,
            } => self.on_version_change(database, old_version, new_version),
            ParentMessage::Invalidate { database } => self.on_invalidate(database),
            ParentMessage::TransactionComplete { transaction, result } => {
                self.on_transaction_complete(transaction, result)
            }
            ParentMessage::Preprocess { request, values } => self.on_preprocess(request, values),
            ParentMessage::RequestResponse { request, response } => {
                self.on_request_response(request, response)
            }
            ParentMessage::CursorResponse { cursor, response } => {
                self.on_cursor_response(cursor, response)
            }
        }
    }

    fn on_local_event(&mut self, event: LocalEvent) {
        match event {
            LocalEvent::TransactionCreated(transaction) => self.on_transaction_created(transaction),
            LocalEvent::CursorDeleteMe(cursor) => self.on_cursor_delete_me(cursor),
            LocalEvent::CachedCursorRow { cursor, row } => {
                self.on_cursor_response(cursor, CursorResponse::Row(row))
            }
            LocalEvent::PreprocessFinished(report) => self.on_preprocess_finished(report),
            LocalEvent::PermissionResolved { request, allowed } => {
                self.on_permission_resolved(request, allowed)
            }
        }
    }

    /// The remote side is gone: finish everything locally with AbortError
    fn on_channel_closed(&mut self) {
        if !self.channel_open {
            return;
        }
        self.channel_open = false;
        log::warn!(
            "Channel to the remote side closed: failing {} requests, aborting {} transactions",
            self.requests.len() + self.factory_requests.len(),
            self.transactions.len()
        );

        let mut factory: Vec<RequestId> = self.factory_requests.keys().copied().collect();
        factory.sort();
        self.factory_requests.clear();
        self.challenges.clear();
        for request in factory {
            self.queue_event(
                Event::Error {
                    request,
                    transaction: None,
                    code: ErrorCode::Abort,
                },
                None,
                None,
            );
        }

        let requests: Vec<RequestId> = self.requests.keys().copied().collect();
        for request in requests {
            let mut proxy = match self.requests.remove(&request) {
                Some(proxy) => proxy,
                None => continue,
            };
            proxy.finalize();
            let transaction = proxy.transaction();
            if let Some(controller) = self.transactions.get_mut(&transaction) {
                controller.on_request_finished();
            }
            self.queue_event(
                Event::Error {
                    request,
                    transaction: Some(transaction),
                    code: ErrorCode::Abort,
                },
                None,
                None,
            );
        }

        let open_databases: Vec<DatabaseId> = self
            .databases
            .iter()
            .filter(|(_, db)| !db.is_closed())
            .map(|(id, _)| *id)
            .collect();

        let live: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, c)| c.state() != TransactionState::Done)
            .map(|(id, _)| *id)
            .collect();
        for transaction in live {
            let (code, version_change) = match self.transactions.get_mut(&transaction) {
                Some(controller) => {
                    controller.abandon();
                    (
                        controller.abort_code().unwrap_or(ErrorCode::Abort),
                        controller.mode() == crate::types::TransactionMode::VersionChange,
                    )
                }
                None => continue,
            };
            if version_change {
                self.revert_version_change(transaction);
            }
            self.queue_event(Event::Abort { transaction, code }, None, None);
        }

        self.cursors.clear();
        for (_, db) in self.databases.iter_mut() {
            db.mark_closed_locally();
        }
        for database in open_databases {
            self.queue_event(Event::Close { database }, None, None);
        }
    }
}
