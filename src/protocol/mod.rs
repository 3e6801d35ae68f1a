//! Message protocol between the client actors and the remote side
//!
//! ## Overview
//!
//! Every client-side handle has a counterpart on the remote side, addressed by
//! an actor id allocated by whichever side created it:
//!
//! ```text
//!   client (this crate)                       remote side (storage engine)
//!   ───────────────────                       ────────────────────────────
//!   FactoryRequest(open)        ─────────────▶
//!                               ◀───────────── DatabaseCreated / UpgradeNeeded
//!   Request / OpenCursor        ─────────────▶
//!                               ◀───────────── Preprocess (optional)
//!   PreprocessContinue          ─────────────▶
//!                               ◀───────────── RequestResponse / CursorResponse
//!   Commit | Abort              ─────────────▶
//!                               ◀───────────── TransactionComplete
//!   TransactionDeleteMe         ─────────────▶
//! ```
//!
//! Only payload shapes are defined here. The messages derive `serde` traits so
//! an embedding can carry them over any transport; the in-process transport
//! lives in [`channel`].

pub mod channel;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorCode;
use crate::types::{
    CursorDirection, DatabaseSpec, IndexMetadata, Key, KeyRange, ObjectStoreMetadata, Principal,
    TransactionMode,
};
use crate::value::{BlobDescriptor, SerializedValue};

/// Actor id of a database handle (allocated by the remote side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseId(pub u64);

/// Actor id of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// Actor id of a request (factory or operation request)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Actor id of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorId(pub u64);

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db#{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

/// Parameters of a factory request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactoryParams {
    /// Open a database, upgrading it if `version` is newer than the stored one
    Open { name: String, version: Option<u64> },
    /// Delete a database
    Delete { name: String },
}

/// Terminal response of a factory request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactoryResponse {
    Open { database: DatabaseId },
    Delete { previous_version: u64 },
    Error(ErrorCode),
}

/// Parameters of one operation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestParams {
    /// `put` when `overwrite` is set, `add` otherwise
    Put {
        object_store: i64,
        value: SerializedValue,
        key: Option<Key>,
        overwrite: bool,
    },
    Get { object_store: i64, range: KeyRange },
    GetAll { object_store: i64, range: Option<KeyRange>, limit: Option<u32> },
    GetAllKeys { object_store: i64, range: Option<KeyRange>, limit: Option<u32> },
    Count { object_store: i64, range: Option<KeyRange> },
    Delete { object_store: i64, range: KeyRange },
    Clear { object_store: i64 },
    IndexGet { object_store: i64, index: i64, range: KeyRange },
    IndexGetKey { object_store: i64, index: i64, range: KeyRange },
    IndexGetAll { object_store: i64, index: i64, range: Option<KeyRange>, limit: Option<u32> },
    IndexGetAllKeys { object_store: i64, index: i64, range: Option<KeyRange>, limit: Option<u32> },
    IndexCount { object_store: i64, index: i64, range: Option<KeyRange> },
}

impl RequestParams {
    /// Check whether the request modifies data
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RequestParams::Put { .. } | RequestParams::Delete { .. } | RequestParams::Clear { .. }
        )
    }

    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            RequestParams::Put { overwrite: true, .. } => "put",
            RequestParams::Put { overwrite: false, .. } => "add",
            RequestParams::Get { .. } => "get",
            RequestParams::GetAll { .. } => "getAll",
            RequestParams::GetAllKeys { .. } => "getAllKeys",
            RequestParams::Count { .. } => "count",
            RequestParams::Delete { .. } => "delete",
            RequestParams::Clear { .. } => "clear",
            RequestParams::IndexGet { .. } => "index.get",
            RequestParams::IndexGetKey { .. } => "index.getKey",
            RequestParams::IndexGetAll { .. } => "index.getAll",
            RequestParams::IndexGetAllKeys { .. } => "index.getAllKeys",
            RequestParams::IndexCount { .. } => "index.count",
        }
    }

    /// Check whether a terminal response has a shape this request can produce.
    /// Errors are always acceptable.
    pub fn accepts(&self, response: &RequestResponse) -> bool {
        use RequestResponse as R;
        if matches!(response, R::Error(_)) {
            return true;
        }
        match self {
            RequestParams::Put { .. } => matches!(response, R::Key(_)),
            RequestParams::Get { .. } | RequestParams::IndexGet { .. } => {
                matches!(response, R::Value(_) | R::Undefined)
            }
            RequestParams::IndexGetKey { .. } => matches!(response, R::Key(_) | R::Undefined),
            RequestParams::GetAll { .. } | RequestParams::IndexGetAll { .. } => {
                matches!(response, R::Values(_))
            }
            RequestParams::GetAllKeys { .. } | RequestParams::IndexGetAllKeys { .. } => {
                matches!(response, R::Keys(_))
            }
            RequestParams::Count { .. } | RequestParams::IndexCount { .. } => {
                matches!(response, R::Count(_))
            }
            RequestParams::Delete { .. } | RequestParams::Clear { .. } => {
                matches!(response, R::Undefined)
            }
        }
    }
}

/// Terminal response of one operation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestResponse {
    Key(Key),
    Keys(Vec<Key>),
    Value(SerializedValue),
    Values(Vec<SerializedValue>),
    Count(u64),
    Undefined,
    Error(ErrorCode),
}

/// One value that must be streamed before the request can complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessInfo {
    /// Position of the value in the response (0 for single-value reads)
    pub clone_index: u32,
    pub blob: BlobDescriptor,
}

/// Aggregated answer to a preprocess message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreprocessOutcome {
    /// Every value was streamed; lists the prepared positions and their total size
    Ready { prepared: Vec<u32>, total_bytes: u64 },
    /// First error observed among the tasks
    Failed(ErrorCode),
}

/// What a cursor iterates over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorSource {
    ObjectStore { object_store: i64 },
    Index { object_store: i64, index: i64 },
}

impl CursorSource {
    pub fn is_index(&self) -> bool {
        matches!(self, CursorSource::Index { .. })
    }
}

/// Parameters for opening a cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenCursorParams {
    pub source: CursorSource,
    /// Key cursor (no values)
    pub key_only: bool,
    pub range: Option<KeyRange>,
    pub direction: CursorDirection,
}

/// Continuation variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContinueParams {
    Continue { key: Option<Key> },
    ContinuePrimaryKey { key: Key, primary_key: Key },
    Advance { count: u32 },
}

/// One cursor row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRow {
    /// Object store key, or index key for index cursors
    pub key: Key,
    /// Locale-aware sort key (index cursors only)
    pub sort_key: Option<Key>,
    /// Primary key of the referenced record (index cursors only)
    pub object_key: Option<Key>,
    /// Value (absent for key cursors)
    pub value: Option<SerializedValue>,
}

/// Response to a cursor open or continuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CursorResponse {
    /// No more rows
    Empty,
    /// Bulk prefetch
    Rows(Vec<CursorRow>),
    Row(CursorRow),
    Error(ErrorCode),
}

/// Messages sent by the client to the remote side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildMessage {
    FactoryRequest { request: RequestId, params: FactoryParams },
    PermissionRetry { request: RequestId },
    NewTransaction {
        database: DatabaseId,
        transaction: TransactionId,
        object_stores: Vec<String>,
        mode: TransactionMode,
    },
    DatabaseBlocked { database: DatabaseId },
    DatabaseClose { database: DatabaseId },
    Commit { transaction: TransactionId },
    Abort { transaction: TransactionId, code: ErrorCode },
    TransactionDeleteMe { transaction: TransactionId },
    CreateObjectStore { transaction: TransactionId, metadata: ObjectStoreMetadata },
    DeleteObjectStore { transaction: TransactionId, object_store: i64 },
    RenameObjectStore { transaction: TransactionId, object_store: i64, name: String },
    CreateIndex { transaction: TransactionId, object_store: i64, metadata: IndexMetadata },
    DeleteIndex { transaction: TransactionId, object_store: i64, index: i64 },
    RenameIndex { transaction: TransactionId, object_store: i64, index: i64, name: String },
    Request { transaction: TransactionId, request: RequestId, params: RequestParams },
    PreprocessContinue { request: RequestId, outcome: PreprocessOutcome },
    OpenCursor {
        transaction: TransactionId,
        request: RequestId,
        cursor: CursorId,
        params: OpenCursorParams,
    },
    CursorContinue {
        cursor: CursorId,
        current_key: Option<Key>,
        params: ContinueParams,
    },
    CursorDeleteMe { cursor: CursorId },
}

/// Messages sent by the remote side to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentMessage {
    FactoryBlocked { request: RequestId, current_version: u64, requested_version: Option<u64> },
    PermissionChallenge { request: RequestId, principal: Principal },
    DatabaseCreated { request: RequestId, database: DatabaseId, spec: DatabaseSpec },
    UpgradeNeeded {
        request: RequestId,
        database: DatabaseId,
        transaction: TransactionId,
        current_version: u64,
        requested_version: u64,
        next_object_store_id: i64,
        next_index_id: i64,
    },
    FactoryResponse { request: RequestId, response: FactoryResponse },
    VersionChange { database: DatabaseId, old_version: u64, new_version: Option<u64> },
    Invalidate { database: DatabaseId },
    TransactionComplete { transaction: TransactionId, result: Result<(), ErrorCode> },
    Preprocess { request: RequestId, values: Vec<PreprocessInfo> },
    RequestResponse { request: RequestId, response: RequestResponse },
    CursorResponse { cursor: CursorId, response: CursorResponse },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SerializedValue;

    fn range() -> KeyRange {
        KeyRange::only(Key::Number(1.0))
    }

    #[test]
    fn test_request_params_accepts_matching_shapes() {
        let get = RequestParams::Get { object_store: 1, range: range() };
        assert!(get.accepts(&RequestResponse::Value(SerializedValue::inline(&b"1"[..]))));
        assert!(get.accepts(&RequestResponse::Undefined));
        assert!(get.accepts(&RequestResponse::Error(ErrorCode::NotFound)));
        assert!(!get.accepts(&RequestResponse::Count(3)));

        let count = RequestParams::Count { object_store: 1, range: None };
        assert!(count.accepts(&RequestResponse::Count(3)));
        assert!(!count.accepts(&RequestResponse::Keys(vec![])));
    }

    #[test]
    fn test_request_params_write_classification() {
        let put = RequestParams::Put {
            object_store: 1,
            value: SerializedValue::inline(&b"1"[..]),
            key: None,
            overwrite: false,
        };
        assert!(put.is_write());
        assert_eq!(put.name(), "add");
        assert!(RequestParams::Clear { object_store: 1 }.is_write());
        assert!(!RequestParams::Count { object_store: 1, range: None }.is_write());
    }

    #[test]
    fn test_actor_id_display() {
        assert_eq!(TransactionId(4).to_string(), "txn#4");
        assert_eq!(CursorId(2).to_string(), "cursor#2");
    }
}
