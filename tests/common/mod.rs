//! Shared helpers: a scripted remote side driven message by message
#![allow(dead_code)]

use idbclient::actor::ClientBuilder;
use idbclient::protocol::channel::{pair, RemoteEndpoint};
use idbclient::protocol::{
    ChildMessage, DatabaseId, FactoryResponse, ParentMessage, RequestId, TransactionId,
};
use idbclient::types::{DatabaseSpec, IndexMetadata, KeyPath, ObjectStoreMetadata, ObjectStoreSpec};
use idbclient::{Client, Config, Event, RequestResult};

pub const DB: DatabaseId = DatabaseId(1);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// "library" v1: `books` (in-line keys on isbn, index by_author) and `notes`
/// (out-of-line keys, no generator)
pub fn library_spec() -> DatabaseSpec {
    let mut books = ObjectStoreSpec::new(ObjectStoreMetadata {
        id: 1,
        name: "books".to_string(),
        key_path: KeyPath::Single("isbn".to_string()),
        auto_increment: false,
    });
    books.indexes.push(IndexMetadata {
        id: 1,
        name: "by_author".to_string(),
        key_path: KeyPath::Single("author".to_string()),
        unique: false,
        multi_entry: false,
    });
    let notes = ObjectStoreSpec::new(ObjectStoreMetadata {
        id: 2,
        name: "notes".to_string(),
        key_path: KeyPath::None,
        auto_increment: false,
    });

    let mut spec = DatabaseSpec::new("library", 1);
    spec.object_stores.push(books);
    spec.object_stores.push(notes);
    spec
}

pub fn client() -> (Client, RemoteEndpoint) {
    client_with(ClientBuilder::new(Config::default()))
}

pub fn client_with(builder: ClientBuilder) -> (Client, RemoteEndpoint) {
    init_logging();
    let (endpoint, remote) = pair();
    let client = builder.build(endpoint).expect("client");
    (client, remote)
}

pub fn reply(remote: &RemoteEndpoint, message: ParentMessage) {
    remote.send(message).expect("client endpoint alive");
}

/// Open "library" at version 1 and consume the success event
pub fn open_library(client: &mut Client, remote: &mut RemoteEndpoint) -> DatabaseId {
    let request = client.open("library", Some(1)).unwrap();
    let sent = remote.drain();
    assert!(matches!(
        sent.as_slice(),
        [ChildMessage::FactoryRequest { request: r, .. }] if *r == request
    ));

    reply(
        remote,
        ParentMessage::DatabaseCreated {
            request,
            database: DB,
            spec: library_spec(),
        },
    );
    reply(
        remote,
        ParentMessage::FactoryResponse {
            request,
            response: FactoryResponse::Open { database: DB },
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Success {
            request,
            transaction: None,
            result: RequestResult::Database(DB),
        })
    );
    assert_eq!(client.next_event(), None);
    DB
}

/// Terminal messages (commit or abort) sent for a transaction
pub fn terminal_messages(sent: &[ChildMessage], transaction: TransactionId) -> Vec<ChildMessage> {
    sent.iter()
        .filter(|m| match m {
            ChildMessage::Commit { transaction: t } => *t == transaction,
            ChildMessage::Abort { transaction: t, .. } => *t == transaction,
            _ => false,
        })
        .cloned()
        .collect()
}

/// Request ids carried by `Request` messages, in send order
pub fn sent_requests(sent: &[ChildMessage]) -> Vec<RequestId> {
    sent.iter()
        .filter_map(|m| match m {
            ChildMessage::Request { request, .. } => Some(*request),
            _ => None,
        })
        .collect()
}
