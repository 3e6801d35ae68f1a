//! Out-of-band values streamed before their request completes

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::json;

use common::*;
use idbclient::actor::ClientBuilder;
use idbclient::preprocess::{DirectoryBlobResolver, MemoryBlobResolver};
use idbclient::protocol::{
    ChildMessage, ParentMessage, PreprocessInfo, PreprocessOutcome, RequestResponse,
};
use idbclient::types::{Key, TransactionMode};
use idbclient::value::{BlobDescriptor, BlobId, SerializedValue};
use idbclient::{Config, ErrorCode, Event, RequestResult};

fn info(clone_index: u32, blob: u64, compressed: bool) -> PreprocessInfo {
    PreprocessInfo {
        clone_index,
        blob: BlobDescriptor {
            id: BlobId(blob),
            size: None,
            compressed,
        },
    }
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn preprocess_outcomes(sent: &[ChildMessage]) -> Vec<PreprocessOutcome> {
    sent.iter()
        .filter_map(|m| match m {
            ChildMessage::PreprocessContinue { outcome, .. } => Some(outcome.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_get_all_with_compressed_and_plain_blobs() {
    let resolver = Arc::new(MemoryBlobResolver::new());
    let plain = serde_json::to_vec(&json!({"body": "plain"})).unwrap();
    let packed = serde_json::to_vec(&json!({"body": "x".repeat(4096)})).unwrap();
    resolver.insert(BlobId(1), plain.clone());
    resolver.insert(BlobId(2), zlib(&packed));

    let (mut client, mut remote) =
        client_with(ClientBuilder::new(Config::default()).blob_resolver(resolver.clone()));
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.get_all(&store, None, None).unwrap();
    assert_eq!(client.next_event(), None);
    remote.drain();

    reply(
        &remote,
        ParentMessage::Preprocess {
            request,
            values: vec![info(0, 1, false), info(1, 2, true)],
        },
    );
    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Values(vec![
                SerializedValue::out_of_band(),
                SerializedValue::out_of_band(),
            ]),
        },
    );

    let event = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
        .await
        .expect("preprocess finished in time");
    assert_eq!(
        event,
        Some(Event::Success {
            request,
            transaction: Some(txn),
            result: RequestResult::Values(vec![
                json!({"body": "plain"}),
                json!({"body": "x".repeat(4096)}),
            ]),
        })
    );

    let outcomes = preprocess_outcomes(&remote.drain());
    assert_eq!(
        outcomes,
        vec![PreprocessOutcome::Ready {
            prepared: vec![0, 1],
            total_bytes: (plain.len() + packed.len()) as u64,
        }]
    );
    assert_eq!(client.database(db).unwrap().delegated_blob_count(), 2);
}

#[tokio::test]
async fn test_missing_blob_fails_request() {
    let (mut client, mut remote) = client();
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
            values: vec![info(0, 7, false)],
        },
    );
    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Value(SerializedValue::out_of_band()),
        },
    );

    let event = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
        .await
        .expect("preprocess finished in time");
    assert_eq!(
        event,
        Some(Event::Error {
            request,
            transaction: Some(txn),
            code: ErrorCode::Io,
        })
    );
    assert_eq!(
        preprocess_outcomes(&remote.drain()),
        vec![PreprocessOutcome::Failed(ErrorCode::Io)]
    );
}

#[tokio::test]
async fn test_blob_read_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = DirectoryBlobResolver::new(dir.path());
    std::fs::write(resolver.blob_path(BlobId(3)), br#""from disk""#).unwrap();

    let (mut client, mut remote) =
        client_with(ClientBuilder::new(Config::default()).blob_resolver(Arc::new(resolver)));
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.get(&store, Key::Number(3.0)).unwrap();
    assert_eq!(client.next_event(), None);

    reply(
        &remote,
        ParentMessage::Preprocess {
            request,
            values: vec![info(0, 3, false)],
        },
    );
    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Value(SerializedValue::out_of_band()),
        },
    );

    let event = tokio::time::timeout(Duration::from_secs(5), client.wait_event())
        .await
        .expect("preprocess finished in time");
    assert_eq!(
        event,
        Some(Event::Success {
            request,
            transaction: Some(txn),
            result: RequestResult::Value(json!("from disk")),
        })
    );
}

#[test]
fn test_empty_preprocess_answers_immediately() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.get_all(&store, None, Some(10)).unwrap();
    assert_eq!(client.next_event(), None);
    remote.drain();

    reply(&remote, ParentMessage::Preprocess { request, values: vec![] });
    assert_eq!(client.next_event(), None);
    assert_eq!(
        remote.drain(),
        vec![ChildMessage::PreprocessContinue {
            request,
            outcome: PreprocessOutcome::Ready {
                prepared: vec![],
                total_bytes: 0,
            },
        }]
    );
}

#[test]
fn test_out_of_band_value_without_preprocess_is_data_clone_error() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadOnly).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.get(&store, Key::Number(1.0)).unwrap();
    assert_eq!(client.next_event(), None);

    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Value(SerializedValue::out_of_band()),
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Error {
            request,
            transaction: Some(txn),
            code: ErrorCode::DataClone,
        })
    );
}
