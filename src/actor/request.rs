//! Request proxies and response dispatch
//!
//! A proxy lives from dispatch until its terminal response. That response is
//! turned into exactly one event. Three things can rewrite it on the way:
//! an aborted transaction (every response becomes `AbortError`), a response
//! shape the request cannot produce (`UnknownError`), and a failed
//! preprocess set (the set's first error).

use bytes::Bytes;

use super::{Client, Deferred, Event};
use crate::error::{ErrorCode, Result};
use crate::preprocess::{PreprocessSet, TaskReport};
use crate::protocol::{
    ChildMessage, CursorId, DatabaseId, PreprocessInfo, PreprocessOutcome, RequestId,
    RequestParams, RequestResponse, TransactionId,
};
use crate::types::Key;
use crate::value::{SerializedValue, StructuredValue, ValueCodec};

/// Result delivered with a success event
#[derive(Debug, Clone, PartialEq)]
pub enum RequestResult {
    /// An open request produced a database handle
    Database(DatabaseId),
    /// A cursor moved to a new position
    Cursor(CursorId),
    /// A cursor ran out of rows
    NoCursor,
    Key(Key),
    Keys(Vec<Key>),
    Value(StructuredValue),
    Values(Vec<StructuredValue>),
    Count(u64),
    Undefined,
}

pub(crate) enum RequestKind {
    Operation(RequestParams),
    Cursor(CursorId),
}

pub(crate) struct RequestProxy {
    id: RequestId,
    transaction: TransactionId,
    serial: u64,
    kind: RequestKind,
    preprocess: Option<PreprocessSet>,
    stashed: Option<RequestResponse>,
    finalized: bool,
}

impl RequestProxy {
    pub(crate) fn new(id: RequestId, transaction: TransactionId, serial: u64, kind: RequestKind) -> Self {
        Self {
            id,
            transaction,
            serial,
            kind,
            preprocess: None,
            stashed: None,
            finalized: false,
        }
    }

    pub(crate) fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn cursor(&self) -> Option<CursorId> {
        match self.kind {
            RequestKind::Cursor(cursor) => Some(cursor),
            RequestKind::Operation(_) => None,
        }
    }

    pub(crate) fn preprocess(&self) -> Option<&PreprocessSet> {
        self.preprocess.as_ref()
    }

    /// Tear the proxy down. Reachable from a response and from local
    /// teardown; only the first call does anything.
    pub(crate) fn finalize(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        if let Some(set) = &self.preprocess {
            set.detach();
        }
        true
    }
}

fn has_out_of_band(response: &RequestResponse) -> bool {
    match response {
        RequestResponse::Value(value) => value.has_preprocess_info,
        RequestResponse::Values(values) => values.iter().any(|v| v.has_preprocess_info),
        _ => false,
    }
}

fn value_bytes(proxy: &mut RequestProxy, clone_index: u32, value: SerializedValue) -> std::result::Result<Bytes, ErrorCode> {
    if !value.has_preprocess_info {
        return Ok(value.data);
    }
    proxy
        .preprocess
        .as_mut()
        .and_then(|set| set.take_prepared(clone_index))
        .ok_or(ErrorCode::DataClone)
}

fn decode(codec: &dyn ValueCodec, proxy: &RequestProxy, data: &[u8]) -> std::result::Result<StructuredValue, ErrorCode> {
    codec.decode(data).map_err(|e| {
        log::warn!("{}: failed to decode value: {}", proxy.id, e);
        ErrorCode::DataClone
    })
}

/// Turn a well-shaped success response into the embedder-facing result
fn build_result(
    codec: &dyn ValueCodec,
    proxy: &mut RequestProxy,
    response: RequestResponse,
) -> std::result::Result<RequestResult, ErrorCode> {
    if let Some(code) = proxy.preprocess.as_ref().and_then(PreprocessSet::error) {
        return Err(code);
    }
    match response {
        RequestResponse::Key(key) => Ok(RequestResult::Key(key)),
        RequestResponse::Keys(keys) => Ok(RequestResult::Keys(keys)),
        RequestResponse::Count(count) => Ok(RequestResult::Count(count)),
        RequestResponse::Undefined => Ok(RequestResult::Undefined),
        RequestResponse::Value(value) => {
            let data = value_bytes(proxy, 0, value)?;
            Ok(RequestResult::Value(decode(codec, proxy, &data)?))
        }
        RequestResponse::Values(values) => {
            let mut decoded = Vec::with_capacity(values.len());
            for (index, value) in values.into_iter().enumerate() {
                let data = value_bytes(proxy, index as u32, value)?;
                decoded.push(decode(codec, proxy, &data)?);
            }
            Ok(RequestResult::Values(decoded))
        }
        RequestResponse::Error(code) => Err(code),
    }
}

impl Client {
    /// Register a request on an active transaction and send it
    pub(crate) fn dispatch_request(
        &mut self,
        transaction: TransactionId,
        params: RequestParams,
    ) -> Result<RequestId> {
        self.ensure_can_issue(transaction, params.is_write())?;

        let request = self.allocate_request_id();
        let controller = self.active_transaction_mut(transaction)?;
        let serial = controller.next_request_serial();
        controller.on_request_dispatched();
        log::debug!(
            "Transaction [{}] request [{}]: {} ({})",
            controller.serial(),
            serial,
            params.name(),
            request
        );

        self.requests.insert(
            request,
            RequestProxy::new(request, transaction, serial, RequestKind::Operation(params.clone())),
        );
        self.send(ChildMessage::Request {
            transaction,
            request,
            params,
        });
        Ok(request)
    }

    /// Check activeness, then write permission
    pub(crate) fn ensure_can_issue(&mut self, transaction: TransactionId, write: bool) -> Result<()> {
        let controller = self.active_transaction_mut(transaction)?;
        if write && !controller.mode().is_writable() {
            return Err(crate::error::IdbError::ReadOnly(format!(
                "Transaction [{}] is read-only",
                controller.serial()
            )));
        }
        Ok(())
    }

    pub(crate) fn on_request_response(&mut self, request: RequestId, response: RequestResponse) {
        let proxy = match self.requests.get_mut(&request) {
            Some(proxy) => proxy,
            None => {
                log::warn!("Response for unknown {}", request);
                return;
            }
        };
        let transaction = proxy.transaction;
        let aborted = self
            .transactions
            .get(&transaction)
            .map_or(true, |c| c.abort_code().is_some());

        if aborted {
            self.complete_request(request, Err(ErrorCode::Abort));
            return;
        }

        let params = match &proxy.kind {
            RequestKind::Operation(params) => params,
            RequestKind::Cursor(cursor) => {
                log::warn!("{}: cursor request got a plain response ({})", request, cursor);
                self.complete_request(request, Err(ErrorCode::Unknown));
                return;
            }
        };
        if !params.accepts(&response) {
            log::warn!("{}: unexpected response shape for {}", request, params.name());
            self.complete_request(request, Err(ErrorCode::Unknown));
            return;
        }

        if has_out_of_band(&response) {
            if let Some(set) = &proxy.preprocess {
                if !set.is_finished() {
                    log::debug!("{}: waiting for {} preprocess tasks", request, set.len());
                    proxy.stashed = Some(response);
                    return;
                }
            }
        }

        let outcome = build_result(self.codec.as_ref(), proxy, response);
        self.complete_request(request, outcome);
    }

    /// Finalize a proxy and queue its one event
    pub(crate) fn complete_request(
        &mut self,
        request: RequestId,
        outcome: std::result::Result<RequestResult, ErrorCode>,
    ) {
        let mut proxy = match self.requests.remove(&request) {
            Some(proxy) => proxy,
            None => return,
        };
        if !proxy.finalize() {
            return;
        }
        let transaction = proxy.transaction;
        let event = match outcome {
            Ok(result) => {
                log::debug!("{} [{}]: success", request, proxy.serial());
                Event::Success {
                    request,
                    transaction: Some(transaction),
                    result,
                }
            }
            Err(code) => {
                log::debug!("{} [{}]: {}", request, proxy.serial(), code);
                Event::Error {
                    request,
                    transaction: Some(transaction),
                    code,
                }
            }
        };
        self.queue_event(
            event,
            Some(transaction),
            Some(Deferred::RequestFinished(transaction)),
        );
    }

    pub(crate) fn on_preprocess(&mut self, request: RequestId, values: Vec<PreprocessInfo>) {
        let transaction = match self.requests.get(&request) {
            Some(proxy) if proxy.cursor().is_none() => proxy.transaction,
            Some(_) => {
                log::warn!("{}: preprocess is not supported for cursors", request);
                self.send_preprocess_outcome(request, PreprocessOutcome::Failed(ErrorCode::Unknown));
                return;
            }
            None => {
                log::warn!("Preprocess for unknown {}", request);
                self.send_preprocess_outcome(request, PreprocessOutcome::Failed(ErrorCode::Unknown));
                return;
            }
        };

        let outstanding = self
            .requests
            .get(&request)
            .and_then(RequestProxy::preprocess)
            .map_or(false, |set| !set.is_finished());
        if outstanding {
            log::warn!("{}: second preprocess while a set is running", request);
            self.send_preprocess_outcome(request, PreprocessOutcome::Failed(ErrorCode::Unknown));
            return;
        }

        if values.is_empty() {
            self.send_preprocess_outcome(
                request,
                PreprocessOutcome::Ready {
                    prepared: Vec::new(),
                    total_bytes: 0,
                },
            );
            return;
        }

        let database = self.transactions.get(&transaction).map(|c| c.database());
        if let Some(db) = database.and_then(|id| self.databases.get_mut(&id)) {
            for info in &values {
                db.delegate_blob(&info.blob);
            }
        }

        let set = PreprocessSet::spawn(
            request,
            &values,
            &self.pool,
            &self.resolver,
            &self.config.preprocess,
            &self.context.sender(),
        );
        if let Some(proxy) = self.requests.get_mut(&request) {
            proxy.preprocess = Some(set);
        }
    }

    pub(crate) fn on_preprocess_finished(&mut self, report: TaskReport) {
        let request = report.request;
        let proxy = match self.requests.get_mut(&request) {
            Some(proxy) => proxy,
            None => {
                log::debug!("{}: discarding preprocess result of finished request", request);
                return;
            }
        };
        let set = match proxy.preprocess.as_mut() {
            Some(set) => set,
            None => return,
        };

        let outcome = match set.on_task_finished(report.slot, report.result) {
            Some(outcome) => outcome,
            None => return,
        };
        let stashed = proxy.stashed.take();
        self.send_preprocess_outcome(request, outcome);
        if let Some(response) = stashed {
            self.on_request_response(request, response);
        }
    }

    fn send_preprocess_outcome(&self, request: RequestId, outcome: PreprocessOutcome) {
        log::debug!("{}: preprocess done: {:?}", request, outcome);
        self.send(ChildMessage::PreprocessContinue { request, outcome });
    }

    /// Fail every request still waiting on preprocess tasks and abort its
    /// transaction. The tasks are detached, so their reports never arrive.
    pub(crate) fn abort_preprocessing_requests(&mut self) {
        let waiting: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, proxy)| proxy.preprocess().map_or(false, |set| !set.is_finished()))
            .map(|(request, _)| *request)
            .collect();

        for request in waiting {
            let mut proxy = match self.requests.remove(&request) {
                Some(proxy) => proxy,
                None => continue,
            };
            proxy.finalize();
            let transaction = proxy.transaction;
            log::info!("{}: preprocessing cut short, failing request", request);
            self.send_preprocess_outcome(request, PreprocessOutcome::Failed(ErrorCode::Abort));

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
            self.abort_transaction(transaction, ErrorCode::Abort);
            self.maybe_finish(transaction);
        }
    }

    /// Running preprocess tasks anywhere in the client
    pub(crate) fn has_running_preprocess(&self) -> bool {
        self.requests
            .values()
            .filter_map(RequestProxy::preprocess)
            .any(|set| !set.is_finished())
    }
}
