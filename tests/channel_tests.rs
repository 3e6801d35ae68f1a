//! Losing the remote side, and shutting the owning context down

mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use idbclient::actor::ClientBuilder;
use idbclient::preprocess::{BlobResolver, ReadStatus, ReadyWaker, ValueSource};
use idbclient::protocol::channel::pair;
use idbclient::protocol::{
    ChildMessage, ParentMessage, PreprocessInfo, PreprocessOutcome, RequestResponse,
};
use idbclient::types::{Key, TransactionMode};
use idbclient::value::{BlobDescriptor, BlobId, SerializedValue};
use idbclient::{Client, Config, ErrorCode, Event, IdbError, RequestResult, TransactionState};
use serde_json::json;

/// Blobs that never become readable
struct StalledResolver;

struct StalledSource;

impl ValueSource for StalledSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<ReadStatus> {
        Ok(ReadStatus::Pending)
    }

    fn notify_when_ready(&mut self, _waker: ReadyWaker) {}
}

impl BlobResolver for StalledResolver {
    fn open(&self, _blob: &BlobDescriptor) -> io::Result<Box<dyn ValueSource>> {
        Ok(Box::new(StalledSource))
    }
}

#[test]
fn test_channel_loss_fails_everything_once() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadWrite).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let first = client.put(&store, &json!(1), Some(Key::Number(1.0))).unwrap();
    let second = client.put(&store, &json!(2), Some(Key::Number(2.0))).unwrap();
    assert_eq!(client.next_event(), None);
    let pending_open = client.open("archive", None).unwrap();

    drop(remote);

    let mut events = Vec::new();
    while let Some(event) = client.next_event() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            Event::Error {
                request: pending_open,
                transaction: None,
                code: ErrorCode::Abort,
            },
            Event::Error {
                request: first,
                transaction: Some(txn),
                code: ErrorCode::Abort,
            },
            Event::Error {
                request: second,
                transaction: Some(txn),
                code: ErrorCode::Abort,
            },
            Event::Abort {
                transaction: txn,
                code: ErrorCode::Abort,
            },
            Event::Close { database: db },
        ]
    );

    assert!(!client.is_channel_open());
    assert!(!client.has_request(first));
    assert_eq!(client.controller(txn).unwrap().state(), TransactionState::Done);
    assert!(client.database(db).unwrap().is_closed());

    let err = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    let err = client.open("library", None).unwrap_err();
    assert!(matches!(err, IdbError::ChannelClosed(_)));
    assert_eq!(client.next_event(), None);
}

#[test]
fn test_channel_loss_keeps_abort_code() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadWrite).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    client.put(&store, &json!(1), Some(Key::Number(1.0))).unwrap();
    client.abort(txn, ErrorCode::QuotaExceeded).unwrap();
    assert_eq!(client.next_event(), None);

    drop(remote);
    let events: Vec<Event> = std::iter::from_fn(|| client.next_event()).collect();
    assert!(events.contains(&Event::Abort {
        transaction: txn,
        code: ErrorCode::QuotaExceeded,
    }));
}

#[tokio::test]
async fn test_wait_event_ends_when_channel_closes() {
    let (endpoint, remote) = pair();
    let mut client = Client::new(Config::default(), endpoint).unwrap();
    drop(remote);

    let event = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
        .await
        .expect("wait_event returned");
    assert_eq!(event, None);
}

#[tokio::test]
async fn test_shutdown_refuses_new_transactions() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    client.shutdown();
    let err = client.transaction(db, &["books"], TransactionMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    let err = client.open("library", None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    assert!(remote.drain().is_empty());
    assert_eq!(client.database(db).unwrap().live_transaction_count(), 0);

    let event = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
        .await
        .expect("wait_event returned");
    assert_eq!(event, None);
}

#[test]
fn test_transaction_built_before_shutdown_still_commits() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadWrite).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.put(&store, &json!("draft"), Some(Key::Number(1.0))).unwrap();
    client.shutdown();
    remote.drain();

    let controller = client.controller(txn).unwrap();
    assert!(!controller.is_creating());
    assert_eq!(controller.state(), TransactionState::Loading);

    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Key(Key::Number(1.0)),
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Success {
            request,
            transaction: Some(txn),
            result: RequestResult::Key(Key::Number(1.0)),
        })
    );
    for _ in 0..4 {
        assert_eq!(client.next_event(), None);
    }

    let sent = remote.drain();
    assert_eq!(
        terminal_messages(&sent, txn),
        vec![ChildMessage::Commit { transaction: txn }]
    );
    assert_eq!(client.controller(txn).unwrap().state(), TransactionState::Committing);

    reply(&remote, ParentMessage::TransactionComplete { transaction: txn, result: Ok(()) });
    assert_eq!(client.next_event(), Some(Event::Complete { transaction: txn }));
}

#[test]
fn test_shutdown_fails_requests_waiting_on_preprocess() {
    let builder = ClientBuilder::new(Config::default()).blob_resolver(Arc::new(StalledResolver));
    let (mut client, mut remote) = client_with(builder);
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.get(&store, Key::Number(1.0)).unwrap();
    assert_eq!(client.next_event(), None);
    remote.drain();

    reply(
        &remote,
        ParentMessage::Preprocess {
            request,
            values: vec![PreprocessInfo {
                clone_index: 0,
                blob: BlobDescriptor {
                    id: BlobId(1),
                    size: None,
                    compressed: false,
                },
            }],
        },
    );
    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Value(SerializedValue::out_of_band()),
        },
    );
    assert_eq!(client.next_event(), None);
    assert!(remote.drain().is_empty());

    client.shutdown();
    assert!(!client.has_request(request));
    assert_eq!(
        remote.drain(),
        vec![
            ChildMessage::PreprocessContinue {
                request,
                outcome: PreprocessOutcome::Failed(ErrorCode::Abort),
            },
            ChildMessage::Abort {
                transaction: txn,
                code: ErrorCode::Abort,
            },
        ]
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Error {
            request,
            transaction: Some(txn),
            code: ErrorCode::Abort,
        })
    );
    assert_eq!(client.next_event(), None);
    assert!(remote.drain().is_empty());
}
