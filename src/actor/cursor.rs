//! Cursor proxies and the continuation protocol
//!
//! A cursor is owned by exactly one party at a time, tracked by
//! [`CursorOwnership`]:
//!
//! ```text
//!   OwnedByRequest ──(row / empty / error delivered)──▶ OwnedDirectly
//!         ▲                                                  │
//!         └───────────────(continue / advance)───────────────┘
//! ```
//!
//! While `OwnedByRequest`, the cursor's request is registered and a response
//! is outstanding. While `OwnedDirectly`, the embedder holds the cursor and
//! no request is registered. The tag is the single source of truth and is
//! checked against the request table on every entry point.

use std::collections::VecDeque;

use super::request::{RequestKind, RequestProxy, RequestResult};
use super::Client;
use crate::actor::context::LocalEvent;
use crate::error::{ErrorCode, IdbError, Result};
use crate::protocol::{
    ChildMessage, ContinueParams, CursorId, CursorResponse, CursorRow, CursorSource,
    OpenCursorParams, RequestId, TransactionId,
};
use crate::types::{CursorDirection, Key};
use crate::value::{StructuredValue, ValueCodec};

/// Who holds a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOwnership {
    /// A request is outstanding and will deliver the cursor
    OwnedByRequest,
    /// Delivered to the embedder; no request outstanding
    OwnedDirectly,
}

/// Client-side state of one cursor
#[derive(Debug)]
pub struct CursorProxy {
    id: CursorId,
    transaction: TransactionId,
    request: RequestId,
    source: CursorSource,
    key_only: bool,
    direction: CursorDirection,
    key: Option<Key>,
    sort_key: Option<Key>,
    primary_key: Option<Key>,
    value: Option<StructuredValue>,
    exhausted: bool,
    cached: VecDeque<CursorRow>,
    ownership: CursorOwnership,
}

impl CursorProxy {
    fn new(id: CursorId, transaction: TransactionId, request: RequestId, params: &OpenCursorParams) -> Self {
        Self {
            id,
            transaction,
            request,
            source: params.source,
            key_only: params.key_only,
            direction: params.direction,
            key: None,
            sort_key: None,
            primary_key: None,
            value: None,
            exhausted: false,
            cached: VecDeque::new(),
            ownership: CursorOwnership::OwnedByRequest,
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// The request that delivers this cursor, reused by every continuation
    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn source(&self) -> CursorSource {
        self.source
    }

    pub fn is_key_cursor(&self) -> bool {
        self.key_only
    }

    pub fn direction(&self) -> CursorDirection {
        self.direction
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Locale-aware sort key, when the index has one
    pub fn sort_key(&self) -> Option<&Key> {
        self.sort_key.as_ref()
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.primary_key.as_ref()
    }

    pub fn value(&self) -> Option<&StructuredValue> {
        self.value.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn ownership(&self) -> CursorOwnership {
        self.ownership
    }

    /// Rows prefetched by the remote side and not consumed yet
    pub fn cached_row_count(&self) -> usize {
        self.cached.len()
    }

    fn apply_row(&mut self, row: CursorRow, value: Option<StructuredValue>) {
        self.primary_key = if self.source.is_index() {
            row.object_key
        } else {
            Some(row.key.clone())
        };
        self.key = Some(row.key);
        self.sort_key = row.sort_key;
        self.value = value;
        self.exhausted = false;
    }

    fn reset(&mut self) {
        self.key = None;
        self.sort_key = None;
        self.primary_key = None;
        self.value = None;
        self.cached.clear();
        self.exhausted = true;
    }

    /// Serve a continuation from prefetched rows, if they cover it
    fn take_cached(&mut self, params: &ContinueParams) -> Option<CursorRow> {
        match params {
            ContinueParams::Continue { key: None } => self.cached.pop_front(),
            ContinueParams::Continue { key: Some(target) } => {
                let forward = self.direction.is_forward();
                while let Some(row) = self.cached.pop_front() {
                    let reached = if forward { row.key >= *target } else { row.key <= *target };
                    if reached {
                        return Some(row);
                    }
                }
                None
            }
            ContinueParams::Advance { count } => {
                let count = *count as usize;
                if count == 0 || self.cached.len() < count {
                    return None;
                }
                self.cached.drain(..count - 1);
                self.cached.pop_front()
            }
            ContinueParams::ContinuePrimaryKey { .. } => None,
        }
    }

    /// Check a continuation target against the current position
    fn validate(&self, params: &ContinueParams) -> Result<()> {
        let current = self
            .key
            .as_ref()
            .ok_or_else(|| IdbError::InvalidState("Cursor is not positioned".into()))?;
        let forward = self.direction.is_forward();

        match params {
            ContinueParams::Continue { key: None } => Ok(()),
            ContinueParams::Continue { key: Some(key) } => {
                let valid = if forward { key > current } else { key < current };
                if valid {
                    Ok(())
                } else {
                    Err(IdbError::Data(format!(
                        "Key {} is not {} the cursor position {}",
                        key,
                        if forward { "after" } else { "before" },
                        current
                    )))
                }
            }
            ContinueParams::ContinuePrimaryKey { key, primary_key } => {
                if !self.source.is_index() {
                    return Err(IdbError::InvalidState(
                        "continuePrimaryKey requires an index cursor".into(),
                    ));
                }
                if self.direction.is_unique() {
                    return Err(IdbError::InvalidState(
                        "continuePrimaryKey is not allowed on unique cursors".into(),
                    ));
                }
                let current_primary = self.primary_key.as_ref().ok_or_else(|| {
                    IdbError::InvalidState("Cursor has no primary key".into())
                })?;
                let target = (key, primary_key);
                let position = (current, current_primary);
                let valid = if forward { target > position } else { target < position };
                if valid {
                    Ok(())
                } else {
                    Err(IdbError::Data(format!(
                        "Key {} / primary key {} does not move the cursor",
                        key, primary_key
                    )))
                }
            }
            ContinueParams::Advance { count: 0 } => {
                Err(IdbError::Type("Advance count must be positive".into()))
            }
            ContinueParams::Advance { .. } => Ok(()),
        }
    }
}

impl Client {
    /// Look up a cursor
    pub fn cursor(&self, cursor: CursorId) -> Option<&CursorProxy> {
        self.cursors.get(&cursor)
    }

    #[inline]
    fn assert_cursor_ownership(&self, cursor: &CursorProxy) {
        debug_assert_eq!(
            cursor.ownership == CursorOwnership::OwnedByRequest,
            self.requests.contains_key(&cursor.request),
            "{} ownership tag disagrees with the request table",
            cursor.id
        );
    }

    /// Open a cursor on an active transaction
    pub(crate) fn open_cursor_request(
        &mut self,
        transaction: TransactionId,
        params: OpenCursorParams,
    ) -> Result<RequestId> {
        self.ensure_can_issue(transaction, false)?;

        let request = self.allocate_request_id();
        let cursor = self.allocate_cursor_id();
        let controller = self.active_transaction_mut(transaction)?;
        let serial = controller.next_request_serial();
        controller.on_request_dispatched();
        controller.add_cursor(cursor);
        log::debug!(
            "Transaction [{}] request [{}]: open {}cursor {} ({})",
            controller.serial(),
            serial,
            if params.key_only { "key " } else { "" },
            cursor,
            request
        );

        self.requests.insert(
            request,
            RequestProxy::new(request, transaction, serial, RequestKind::Cursor(cursor)),
        );
        self.cursors
            .insert(cursor, CursorProxy::new(cursor, transaction, request, &params));
        self.send(ChildMessage::OpenCursor {
            transaction,
            request,
            cursor,
            params,
        });
        Ok(request)
    }

    /// Move the cursor to the next row, or to the first row at or past `key`
    pub fn continue_cursor(&mut self, cursor: CursorId, key: Option<Key>) -> Result<RequestId> {
        self.continue_with(cursor, ContinueParams::Continue { key })
    }

    /// Move an index cursor to the first row at or past `(key, primary_key)`
    pub fn continue_primary_key(
        &mut self,
        cursor: CursorId,
        key: Key,
        primary_key: Key,
    ) -> Result<RequestId> {
        self.continue_with(cursor, ContinueParams::ContinuePrimaryKey { key, primary_key })
    }

    /// Skip `count` rows
    pub fn advance(&mut self, cursor: CursorId, count: u32) -> Result<RequestId> {
        self.continue_with(cursor, ContinueParams::Advance { count })
    }

    fn continue_with(&mut self, cursor_id: CursorId, params: ContinueParams) -> Result<RequestId> {
        self.context.assert_owning_thread();

        let proxy = self
            .cursors
            .get(&cursor_id)
            .ok_or_else(|| IdbError::unknown_actor("cursor", cursor_id.0))?;
        self.assert_cursor_ownership(proxy);
        let transaction = proxy.transaction;
        let request = proxy.request;

        self.ensure_can_issue(transaction, false)?;

        let proxy = self
            .cursors
            .get(&cursor_id)
            .ok_or_else(|| IdbError::unknown_actor("cursor", cursor_id.0))?;
        if proxy.ownership == CursorOwnership::OwnedByRequest {
            return Err(IdbError::InvalidState(format!(
                "{} already has a continuation outstanding",
                cursor_id
            )));
        }
        if proxy.exhausted {
            return Err(IdbError::InvalidState(format!("{} is exhausted", cursor_id)));
        }
        proxy.validate(&params)?;

        let controller = self.active_transaction_mut(transaction)?;
        let serial = controller.next_request_serial();
        controller.on_request_dispatched();
        log::debug!(
            "Transaction [{}] request [{}]: {} {:?}",
            controller.serial(),
            serial,
            cursor_id,
            params
        );
        self.requests.insert(
            request,
            RequestProxy::new(request, transaction, serial, RequestKind::Cursor(cursor_id)),
        );

        let proxy = match self.cursors.get_mut(&cursor_id) {
            Some(proxy) => proxy,
            None => return Err(IdbError::unknown_actor("cursor", cursor_id.0)),
        };
        proxy.ownership = CursorOwnership::OwnedByRequest;

        if let Some(row) = proxy.take_cached(&params) {
            if self
                .context
                .dispatch_later(LocalEvent::CachedCursorRow { cursor: cursor_id, row })
            {
                return Ok(request);
            }
        }

        let proxy = match self.cursors.get_mut(&cursor_id) {
            Some(proxy) => proxy,
            None => return Err(IdbError::unknown_actor("cursor", cursor_id.0)),
        };
        proxy.cached.clear();
        let current_key = proxy.key.clone();
        self.send(ChildMessage::CursorContinue {
            cursor: cursor_id,
            current_key,
            params,
        });
        Ok(request)
    }

    pub(crate) fn on_cursor_response(&mut self, cursor_id: CursorId, response: CursorResponse) {
        let proxy = match self.cursors.get(&cursor_id) {
            Some(proxy) => proxy,
            None => {
                log::warn!("Response for unknown {}", cursor_id);
                return;
            }
        };
        self.assert_cursor_ownership(proxy);
        if proxy.ownership != CursorOwnership::OwnedByRequest {
            log::warn!("{}: response with no continuation outstanding", cursor_id);
            return;
        }
        let request = proxy.request;
        let transaction = proxy.transaction;
        let aborted = self
            .transactions
            .get(&transaction)
            .map_or(true, |c| c.abort_code().is_some());

        let codec = self.codec.clone();
        let proxy = match self.cursors.get_mut(&cursor_id) {
            Some(proxy) => proxy,
            None => return,
        };

        let mut release_later = false;
        let outcome = if aborted {
            Err(ErrorCode::Abort)
        } else {
            match response {
                CursorResponse::Error(code) => Err(code),
                CursorResponse::Empty => {
                    proxy.reset();
                    release_later = true;
                    Ok(RequestResult::NoCursor)
                }
                CursorResponse::Row(row) => apply(codec.as_ref(), proxy, vec![row]),
                CursorResponse::Rows(rows) if rows.is_empty() => {
                    log::warn!("{}: empty row batch", cursor_id);
                    Err(ErrorCode::Unknown)
                }
                CursorResponse::Rows(rows) => apply(codec.as_ref(), proxy, rows),
            }
        };

        // The cursor goes back to whoever holds it before the request is torn down
        proxy.ownership = CursorOwnership::OwnedDirectly;
        self.complete_request(request, outcome);

        if release_later {
            self.context.dispatch_later(LocalEvent::CursorDeleteMe(cursor_id));
        }
    }

    /// Release the remote side of a cursor
    pub(crate) fn on_cursor_delete_me(&mut self, cursor_id: CursorId) {
        let proxy = match self.cursors.get(&cursor_id) {
            Some(proxy) => proxy,
            None => return,
        };
        if proxy.ownership == CursorOwnership::OwnedByRequest {
            log::debug!("{}: continuation outstanding, keeping it alive", cursor_id);
            return;
        }
        let transaction = proxy.transaction;
        self.cursors.remove(&cursor_id);
        if let Some(controller) = self.transactions.get_mut(&transaction) {
            controller.remove_cursor(cursor_id);
        }
        log::debug!("{} released", cursor_id);
        self.send(ChildMessage::CursorDeleteMe { cursor: cursor_id });
        self.maybe_release(transaction);
    }
}

/// Position the cursor on the first row and keep the rest for later continuations
fn apply(
    codec: &dyn ValueCodec,
    proxy: &mut CursorProxy,
    rows: Vec<CursorRow>,
) -> std::result::Result<RequestResult, ErrorCode> {
    let mut rows = rows.into_iter();
    let first = match rows.next() {
        Some(row) => row,
        None => return Err(ErrorCode::Unknown),
    };
    proxy.cached.extend(rows);

    let decoded = match (&first.value, proxy.key_only) {
        (Some(value), false) => Some(codec.decode(&value.data)),
        _ => None,
    };
    match decoded.transpose() {
        Ok(value) => proxy.apply_row(first, value),
        Err(e) => {
            log::warn!("{}: failed to decode row value: {}", proxy.id, e);
            proxy.apply_row(first, None);
            return Err(ErrorCode::DataClone);
        }
    }
    Ok(RequestResult::Cursor(proxy.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(source: CursorSource, direction: CursorDirection) -> CursorProxy {
        let params = OpenCursorParams {
            source,
            key_only: false,
            range: None,
            direction,
        };
        CursorProxy::new(CursorId(1), TransactionId(1), RequestId(1), &params)
    }

    fn row(key: f64) -> CursorRow {
        CursorRow {
            key: Key::Number(key),
            sort_key: None,
            object_key: None,
            value: None,
        }
    }

    fn index_row(key: &str, primary: f64) -> CursorRow {
        CursorRow {
            key: Key::string(key),
            sort_key: None,
            object_key: Some(Key::Number(primary)),
            value: None,
        }
    }

    #[test]
    fn test_continue_key_must_move_forward() {
        let mut c = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Next);
        c.apply_row(row(5.0), None);
        assert!(c.validate(&ContinueParams::Continue { key: Some(Key::Number(6.0)) }).is_ok());
        let err = c
            .validate(&ContinueParams::Continue { key: Some(Key::Number(5.0)) })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Data);
    }

    #[test]
    fn test_continue_key_must_move_backward_in_prev() {
        let mut c = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Prev);
        c.apply_row(row(5.0), None);
        assert!(c.validate(&ContinueParams::Continue { key: Some(Key::Number(4.0)) }).is_ok());
        assert!(c.validate(&ContinueParams::Continue { key: Some(Key::Number(7.0)) }).is_err());
    }

    #[test]
    fn test_continue_primary_key_rules() {
        let mut store = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Next);
        store.apply_row(row(1.0), None);
        let params = ContinueParams::ContinuePrimaryKey {
            key: Key::Number(1.0),
            primary_key: Key::Number(2.0),
        };
        assert_eq!(store.validate(&params).unwrap_err().code(), ErrorCode::InvalidState);

        let mut index = cursor(
            CursorSource::Index { object_store: 1, index: 1 },
            CursorDirection::Next,
        );
        index.apply_row(index_row("b", 10.0), None);
        assert_eq!(index.primary_key(), Some(&Key::Number(10.0)));
        let same_key_later_primary = ContinueParams::ContinuePrimaryKey {
            key: Key::string("b"),
            primary_key: Key::Number(11.0),
        };
        assert!(index.validate(&same_key_later_primary).is_ok());
        let same_position = ContinueParams::ContinuePrimaryKey {
            key: Key::string("b"),
            primary_key: Key::Number(10.0),
        };
        assert_eq!(index.validate(&same_position).unwrap_err().code(), ErrorCode::Data);

        let mut unique = cursor(
            CursorSource::Index { object_store: 1, index: 1 },
            CursorDirection::NextUnique,
        );
        unique.apply_row(index_row("b", 10.0), None);
        assert!(unique.validate(&same_key_later_primary).is_err());
    }

    #[test]
    fn test_advance_zero_is_type_error() {
        let mut c = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Next);
        c.apply_row(row(1.0), None);
        let err = c.validate(&ContinueParams::Advance { count: 0 }).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Type);
    }

    #[test]
    fn test_cached_rows_serve_continuations() {
        let mut c = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Next);
        c.apply_row(row(1.0), None);
        c.cached.extend(vec![row(2.0), row(3.0), row(4.0), row(5.0)]);

        assert_eq!(c.take_cached(&ContinueParams::Continue { key: None }).unwrap().key, Key::Number(2.0));
        assert_eq!(c.take_cached(&ContinueParams::Advance { count: 2 }).unwrap().key, Key::Number(4.0));
        assert!(c.take_cached(&ContinueParams::Advance { count: 5 }).is_none());
        assert_eq!(
            c.take_cached(&ContinueParams::Continue { key: Some(Key::Number(5.0)) }).unwrap().key,
            Key::Number(5.0)
        );
        assert_eq!(c.cached_row_count(), 0);
    }

    #[test]
    fn test_reset_exhausts_cursor() {
        let mut c = cursor(CursorSource::ObjectStore { object_store: 1 }, CursorDirection::Next);
        c.apply_row(row(1.0), None);
        c.cached.push_back(row(2.0));
        c.reset();
        assert!(c.is_exhausted());
        assert!(c.key().is_none());
        assert_eq!(c.cached_row_count(), 0);
    }
}
