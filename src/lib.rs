//! idbclient - the client half of a message-passing IndexedDB-style database
//!
//! The storage engine runs on the other side of a channel. This crate keeps
//! the client-side state of every database, transaction, request and cursor,
//! turns remote responses into events for the embedder, and streams large
//! values in the background before their requests complete.
//!
//! ## Architecture
//!
//! ```text
//!   embedder ──calls──▶ Client ──ChildMessage──▶ ┌─────────────┐
//!      ▲                  │                      │ remote side │
//!      └────── Event ─────┤  ◀──ParentMessage──  └─────────────┘
//!                         │
//!          ┌──────────────┼───────────────┬──────────────────┐
//!          ▼              ▼               ▼                  ▼
//!    DatabaseHandle  TransactionController  RequestProxy   CursorProxy
//!                                            │
//!                                            ▼
//!                                   PreprocessSet ── pool threads
//! ```
//!
//! Everything except the preprocess pool lives on the thread that built the
//! [`Client`]. Background results come back through the client's local queue.

pub mod actor;
pub mod error;
pub mod preprocess;
pub mod protocol;
pub mod types;
pub mod value;

pub use actor::context::ContextKind;
pub use actor::cursor::{CursorOwnership, CursorProxy};
pub use actor::database::DatabaseHandle;
pub use actor::factory::FactoryRequest;
pub use actor::object_store::{IndexHandle, ObjectStoreHandle};
pub use actor::permission::{PermissionPrompt, PermissionValue, PrivilegedDispatcher, PromptReply};
pub use actor::request::RequestResult;
pub use actor::transaction::{TransactionController, TransactionState};
pub use actor::{Client, ClientBuilder, Event};
pub use error::{ErrorCode, IdbError, Result};
pub use preprocess::PreprocessConfig;

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Kind of context the client runs on
    pub context: ContextKind,
    /// Background value preprocessing
    pub preprocess: PreprocessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context: ContextKind::Privileged,
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl Config {
    /// Configuration for a client running on a worker
    pub fn worker() -> Self {
        Self {
            context: ContextKind::Worker,
            preprocess: PreprocessConfig::single_threaded(),
        }
    }

    /// Apply `IDBCLIENT_PREPROCESS_THREADS` and `IDBCLIENT_PREPROCESS_CHUNK_BYTES`
    /// on top of the defaults. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threads) = env_usize("IDBCLIENT_PREPROCESS_THREADS") {
            config.preprocess.threads = threads;
        }
        if let Some(chunk) = env_usize("IDBCLIENT_PREPROCESS_CHUNK_BYTES") {
            config.preprocess.chunk_bytes = chunk;
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            log::warn!("Ignoring {}={:?}: expected a positive integer", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.context, ContextKind::Privileged);
        assert_eq!(config.preprocess.threads, 2);
    }

    #[test]
    fn test_worker_preset() {
        let config = Config::worker();
        assert_eq!(config.context, ContextKind::Worker);
        assert_eq!(config.preprocess.threads, 1);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("IDBCLIENT_PREPROCESS_CHUNK_BYTES", "4096");
        std::env::set_var("IDBCLIENT_PREPROCESS_THREADS", "zero");
        let config = Config::from_env();
        assert_eq!(config.preprocess.chunk_bytes, 4096);
        assert_eq!(config.preprocess.threads, 2);
        std::env::remove_var("IDBCLIENT_PREPROCESS_CHUNK_BYTES");
        std::env::remove_var("IDBCLIENT_PREPROCESS_THREADS");
    }
}
