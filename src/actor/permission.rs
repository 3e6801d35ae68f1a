//! Permission challenges on open requests
//!
//! ```text
//!   remote: PermissionChallenge(principal)
//!        │
//!        ├─ System principal ─────────────────────────────┐
//!        ├─ privileged context ── check / prompt ─────────┤
//!        └─ worker ── dispatcher hop ── check / prompt ───┤
//!                         │ (refused)                     │
//!                         └───────────────────────────────┤
//!                                                         ▼
//!                                        PermissionRetry (exactly once)
//! ```
//!
//! The decision itself is persisted by the [`PermissionPrompt`]
//! implementation; the remote side re-checks on retry.

use std::sync::Arc;

use super::context::{ContextKind, LocalEvent, LocalSender};
use super::Client;
use crate::protocol::{ChildMessage, RequestId};
use crate::types::Principal;

/// Stored permission for a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionValue {
    Allow,
    Deny,
    /// Nothing stored, the user must be asked
    Prompt,
}

/// UI boundary for persistent storage permission
pub trait PermissionPrompt: Send + Sync {
    /// Look up a stored decision
    fn check(&self, principal: &Principal) -> PermissionValue;

    /// Ask the user; the answer goes through `reply`, possibly from another thread
    fn prompt(&self, principal: &Principal, reply: PromptReply);
}

/// Hop to the privileged context from a worker
pub trait PrivilegedDispatcher: Send + Sync {
    /// Run `job` on the privileged context. Returns false if that context is gone.
    fn dispatch(&self, job: Box<dyn FnOnce() + Send + 'static>) -> bool;
}

/// One-shot answer to a permission prompt.
///
/// Dropping it unanswered still resumes the open request.
pub struct PromptReply {
    request: RequestId,
    sender: Option<LocalSender>,
}

impl PromptReply {
    pub(crate) fn new(request: RequestId, sender: LocalSender) -> Self {
        Self {
            request,
            sender: Some(sender),
        }
    }

    pub fn allow(self) {
        self.answer(true)
    }

    pub fn deny(self) {
        self.answer(false)
    }

    pub fn answer(mut self, allowed: bool) {
        self.send(Some(allowed));
    }

    fn send(&mut self, allowed: Option<bool>) {
        if let Some(sender) = self.sender.take() {
            // The client may be gone already
            let _ = sender.send(LocalEvent::PermissionResolved {
                request: self.request,
                allowed,
            });
        }
    }
}

impl Drop for PromptReply {
    fn drop(&mut self) {
        self.send(None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChallengeState {
    /// Waiting for the check-or-prompt step
    Resolving,
    RetrySent,
}

fn resolve(prompt: Option<Arc<dyn PermissionPrompt>>, principal: Principal, reply: PromptReply) {
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => return reply.deny(),
    };
    match prompt.check(&principal) {
        PermissionValue::Allow => reply.allow(),
        PermissionValue::Deny => reply.deny(),
        PermissionValue::Prompt => prompt.prompt(&principal, reply),
    }
}

impl Client {
    pub(crate) fn on_permission_challenge(&mut self, request: RequestId, principal: Principal) {
        if !self.factory_requests.contains_key(&request) {
            log::warn!("Permission challenge for unknown {}", request);
            return;
        }
        if self.challenges.contains_key(&request) {
            log::warn!("{}: second permission challenge ignored", request);
            return;
        }
        self.challenges.insert(request, ChallengeState::Resolving);

        if principal == Principal::System {
            log::debug!("{}: system principal, retrying", request);
            self.send_permission_retry(request);
            return;
        }

        let reply = PromptReply::new(request, self.context.sender());
        match self.context.kind() {
            ContextKind::Privileged => {
                log::debug!("{}: resolving permission for {:?}", request, principal);
                resolve(self.prompt.clone(), principal, reply);
            }
            ContextKind::Worker => {
                let dispatcher = match &self.dispatcher {
                    Some(dispatcher) => Arc::clone(dispatcher),
                    None => {
                        log::warn!("{}: no privileged context to ask, retrying", request);
                        self.send_permission_retry(request);
                        return;
                    }
                };
                let prompt = self.prompt.clone();
                log::debug!("{}: hopping to the privileged context", request);
                let dispatched =
                    dispatcher.dispatch(Box::new(move || resolve(prompt, principal, reply)));
                if !dispatched {
                    log::warn!("{}: privileged context is gone, retrying", request);
                    self.send_permission_retry(request);
                }
            }
        }
    }

    pub(crate) fn on_permission_resolved(&mut self, request: RequestId, allowed: Option<bool>) {
        match allowed {
            Some(true) => log::debug!("{}: permission granted", request),
            Some(false) => log::info!("{}: permission denied", request),
            None => log::warn!("{}: permission prompt dropped unanswered", request),
        }
        self.send_permission_retry(request);
    }

    fn send_permission_retry(&mut self, request: RequestId) {
        match self.challenges.get_mut(&request) {
            Some(state @ ChallengeState::Resolving) => *state = ChallengeState::RetrySent,
            Some(ChallengeState::RetrySent) => return,
            None => {
                log::debug!("{}: challenge already settled", request);
                return;
            }
        }
        self.send(ChildMessage::PermissionRetry { request });
    }

    /// Challenges still waiting for a decision
    pub(crate) fn has_pending_challenge(&self) -> bool {
        self.challenges
            .values()
            .any(|state| *state == ChallengeState::Resolving)
    }
}
