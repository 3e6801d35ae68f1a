//! The owning execution context
//!
//! Every actor lives on the thread that built its [`Client`](super::Client).
//! Work that must happen "later" is queued here rather than run inline:
//!
//! - the stable-state queue runs before the next event is handed out
//!   (new transactions finishing construction);
//! - the local channel carries later-turn work and results marshalled back
//!   from other threads (preprocess reports, permission replies).

use std::collections::VecDeque;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::preprocess::TaskReport;
use crate::protocol::{CursorId, CursorRow, RequestId, TransactionId};

/// Kind of execution context the client runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// The context that owns permission prompting
    Privileged,
    /// A worker; prompting requires a hop to the privileged context
    Worker,
}

/// Work scheduled on the owning context
#[derive(Debug)]
pub(crate) enum LocalEvent {
    /// A transaction finished construction
    TransactionCreated(TransactionId),
    /// Release the channel resource of a cursor
    CursorDeleteMe(CursorId),
    /// A continuation was served from prefetched rows
    CachedCursorRow { cursor: CursorId, row: CursorRow },
    PreprocessFinished(TaskReport),
    /// A permission challenge was decided (`None` when nobody answered)
    PermissionResolved { request: RequestId, allowed: Option<bool> },
}

pub(crate) type LocalSender = UnboundedSender<LocalEvent>;

pub(crate) struct OwningContext {
    owner: ThreadId,
    kind: ContextKind,
    stable: VecDeque<LocalEvent>,
    sender: LocalSender,
    receiver: UnboundedReceiver<LocalEvent>,
    shutting_down: bool,
}

impl OwningContext {
    pub(crate) fn new(kind: ContextKind) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            owner: thread::current().id(),
            kind,
            stable: VecDeque::new(),
            sender,
            receiver,
            shutting_down: false,
        }
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    #[inline]
    pub(crate) fn assert_owning_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "actor used off its owning thread"
        );
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Queue work that must run before the next event is handed out.
    /// Fails once the context is shutting down.
    pub(crate) fn run_before_next_tick(&mut self, event: LocalEvent) -> bool {
        if self.shutting_down {
            return false;
        }
        self.stable.push_back(event);
        true
    }

    pub(crate) fn take_stable(&mut self) -> Option<LocalEvent> {
        self.stable.pop_front()
    }

    /// Queue work for a later turn of the event loop
    pub(crate) fn dispatch_later(&self, event: LocalEvent) -> bool {
        !self.shutting_down && self.sender.send(event).is_ok()
    }

    /// Sender for results produced off the owning thread
    pub(crate) fn sender(&self) -> LocalSender {
        self.sender.clone()
    }

    pub(crate) fn try_next(&mut self) -> Option<LocalEvent> {
        self.receiver.try_recv().ok()
    }

    pub(crate) async fn next(&mut self) -> Option<LocalEvent> {
        self.receiver.recv().await
    }

    /// Refuse new scheduled work
    pub(crate) fn shut_down(&mut self) {
        self.shutting_down = true;
        self.stable.clear();
        self.receiver.close();
    }
}
