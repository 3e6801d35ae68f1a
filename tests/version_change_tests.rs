//! Upgrades, schema changes, version change notices and invalidation

mod common;

use common::*;
use idbclient::protocol::{
    ChildMessage, FactoryParams, FactoryResponse, ParentMessage, RequestId, RequestResponse,
    TransactionId,
};
use idbclient::types::{Key, KeyPath, TransactionMode};
use idbclient::{Client, ErrorCode, Event, RequestResult, TransactionState};
use serde_json::json;

const UPGRADE: TransactionId = TransactionId(100);

/// Start opening "library" at version 2 and return the UpgradeNeeded event's request
fn begin_upgrade(client: &mut Client, remote: &mut idbclient::protocol::channel::RemoteEndpoint) -> RequestId {
    let request = client.open("library", Some(2)).unwrap();
    remote.drain();
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
        ParentMessage::UpgradeNeeded {
            request,
            database: DB,
            transaction: UPGRADE,
            current_version: 1,
            requested_version: 2,
            next_object_store_id: 2,
            next_index_id: 1,
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::UpgradeNeeded {
            request,
            database: DB,
            transaction: UPGRADE,
            old_version: 1,
            new_version: 2,
        })
    );
    assert_eq!(client.dispatching(), Some(UPGRADE));
    request
}

#[test]
fn test_aborted_upgrade_restores_schema() {
    let (mut client, mut remote) = client();
    let request = begin_upgrade(&mut client, &mut remote);
    assert_eq!(client.database(DB).unwrap().version(), 2);
    assert_eq!(client.factory_request(request).unwrap().upgrade_transaction(), Some(UPGRADE));

    let authors = client
        .create_object_store(UPGRADE, "authors", KeyPath::None, true)
        .unwrap();
    assert_eq!(authors.id(), 3);
    client.delete_object_store(UPGRADE, "notes").unwrap();
    assert_eq!(
        client.object_store_names(DB).unwrap(),
        vec!["authors".to_string(), "books".to_string()]
    );
    assert_eq!(
        client.controller(UPGRADE).unwrap().object_store_names(),
        &["authors".to_string(), "books".to_string()]
    );

    client.abort(UPGRADE, ErrorCode::Abort).unwrap();
    let db = client.database(DB).unwrap();
    assert_eq!(db.version(), 1);
    assert_eq!(
        db.object_store_names(),
        vec!["books".to_string(), "notes".to_string()]
    );
    assert!(db.is_closed());
    assert_eq!(db.running_version_change(), None);
    assert_eq!(
        client.controller(UPGRADE).unwrap().object_store_names(),
        &["books".to_string(), "notes".to_string()]
    );

    let sent = remote.drain();
    assert!(matches!(sent[0], ChildMessage::CreateObjectStore { transaction: UPGRADE, .. }));
    assert_eq!(
        sent[1],
        ChildMessage::DeleteObjectStore {
            transaction: UPGRADE,
            object_store: 2,
        }
    );
    assert_eq!(
        &sent[2..],
        &[
            ChildMessage::DatabaseClose { database: DB },
            ChildMessage::Abort {
                transaction: UPGRADE,
                code: ErrorCode::Abort,
            },
        ]
    );

    reply(
        &remote,
        ParentMessage::TransactionComplete {
            transaction: UPGRADE,
            result: Err(ErrorCode::Abort),
        },
    );
    reply(
        &remote,
        ParentMessage::FactoryResponse {
            request,
            response: FactoryResponse::Error(ErrorCode::Abort),
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Abort {
            transaction: UPGRADE,
            code: ErrorCode::Abort,
        })
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Error {
            request,
            transaction: None,
            code: ErrorCode::Abort,
        })
    );
    assert_eq!(client.next_event(), None);
    assert_eq!(
        remote.drain(),
        vec![ChildMessage::TransactionDeleteMe { transaction: UPGRADE }]
    );
}

#[test]
fn test_empty_upgrade_commits_after_event() {
    let (mut client, mut remote) = client();
    let request = begin_upgrade(&mut client, &mut remote);
    assert!(remote.drain().is_empty(), "nothing sent while the upgrade event is out");

    let err = client.transaction(DB, &["books"], TransactionMode::ReadOnly).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    assert_eq!(client.next_event(), None);
    assert_eq!(remote.drain(), vec![ChildMessage::Commit { transaction: UPGRADE }]);

    reply(&remote, ParentMessage::TransactionComplete { transaction: UPGRADE, result: Ok(()) });
    reply(
        &remote,
        ParentMessage::FactoryResponse {
            request,
            response: FactoryResponse::Open { database: DB },
        },
    );
    assert_eq!(client.next_event(), Some(Event::Complete { transaction: UPGRADE }));
    assert_eq!(
        client.next_event(),
        Some(Event::Success {
            request,
            transaction: None,
            result: RequestResult::Database(DB),
        })
    );
    let db = client.database(DB).unwrap();
    assert_eq!(db.version(), 2);
    assert!(db.previous_spec().is_none());
    assert!(!db.is_closed());
    assert!(client.transaction(DB, &["books"], TransactionMode::ReadOnly).is_ok());
}

#[test]
fn test_upgrade_schema_operations() {
    let (mut client, mut remote) = client();
    begin_upgrade(&mut client, &mut remote);

    let err = client
        .create_object_store(UPGRADE, "books", KeyPath::None, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Constraint);
    let err = client
        .create_object_store(
            UPGRADE,
            "pairs",
            KeyPath::Array(vec!["a".into(), "b".into()]),
            true,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let mut books = client.object_store(UPGRADE, "books").unwrap();
    let err = client
        .create_index(&books, "by_author", KeyPath::Single("author".into()), false, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Constraint);
    let err = client
        .create_index(
            &books,
            "by_pair",
            KeyPath::Array(vec!["a".into(), "b".into()]),
            false,
            true,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);

    let mut by_title = client
        .create_index(&books, "by_title", KeyPath::Single("title".into()), true, false)
        .unwrap();
    assert_eq!(by_title.id(), 2);
    assert!(by_title.is_unique());
    client.rename_index(&mut by_title, "title").unwrap();
    assert_eq!(by_title.name(), "title");
    client.delete_index(&books, "by_author").unwrap();
    let err = client.index(&books, "by_author").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    client.rename_object_store(&mut books, "volumes").unwrap();
    assert_eq!(books.name(), "volumes");
    assert_eq!(
        client.object_store_names(DB).unwrap(),
        vec!["notes".to_string(), "volumes".to_string()]
    );
    let err = client.rename_object_store(&mut books, "notes").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Constraint);

    let sent = remote.drain();
    assert!(matches!(sent[0], ChildMessage::CreateIndex { object_store: 1, .. }));
    assert!(matches!(sent[1], ChildMessage::RenameIndex { ref name, .. } if name == "title"));
    assert!(matches!(sent[2], ChildMessage::DeleteIndex { object_store: 1, index: 1, .. }));
    assert!(matches!(sent[3], ChildMessage::RenameObjectStore { object_store: 1, ref name, .. } if name == "volumes"));
    assert_eq!(sent.len(), 4);

    // Deleted stores reject further use through old handles
    let notes = client.object_store(UPGRADE, "notes").unwrap();
    client.delete_object_store(UPGRADE, "notes").unwrap();
    let err = client.put(&notes, &json!("x"), Some(Key::Number(1.0))).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    assert_eq!(client.controller(UPGRADE).unwrap().deleted_store_handle_count(), 1);

    // Outside the event, schema changes are refused
    assert_eq!(client.next_event(), None);
    let err = client
        .create_object_store(UPGRADE, "late", KeyPath::None, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransactionInactive);
}

#[test]
fn test_schema_operations_require_version_change() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["books"], TransactionMode::ReadWrite).unwrap();
    let err = client
        .create_object_store(txn, "authors", KeyPath::None, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
    let err = client.delete_object_store(txn, "books").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidState);
}

#[test]
fn test_invalidate_aborts_without_message() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    let txn = client.transaction(db, &["notes"], TransactionMode::ReadWrite).unwrap();
    let store = client.object_store(txn, "notes").unwrap();
    let request = client.put(&store, &json!("n"), Some(Key::Number(1.0))).unwrap();
    assert_eq!(client.next_event(), None);
    remote.drain();

    reply(&remote, ParentMessage::Invalidate { database: db });
    assert_eq!(client.next_event(), Some(Event::Close { database: db }));
    assert_eq!(remote.drain(), vec![ChildMessage::DatabaseClose { database: db }]);
    assert!(client.database(db).unwrap().is_invalidated());
    assert_eq!(client.controller(txn).unwrap().abort_code(), Some(ErrorCode::Abort));

    reply(
        &remote,
        ParentMessage::RequestResponse {
            request,
            response: RequestResponse::Key(Key::Number(1.0)),
        },
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
    assert!(terminal_messages(&remote.drain(), txn).is_empty());
    let controller = client.controller(txn).unwrap();
    assert!(controller.sent_commit_or_abort());
    assert_eq!(controller.state(), TransactionState::Committing);

    reply(
        &remote,
        ParentMessage::TransactionComplete {
            transaction: txn,
            result: Err(ErrorCode::Abort),
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Abort {
            transaction: txn,
            code: ErrorCode::Abort,
        })
    );
}

#[test]
fn test_version_change_notice_then_blocked() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    reply(
        &remote,
        ParentMessage::VersionChange {
            database: db,
            old_version: 1,
            new_version: Some(2),
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::VersionChange {
            database: db,
            old_version: 1,
            new_version: Some(2),
        })
    );
    assert!(remote.drain().is_empty());
    assert_eq!(client.next_event(), None);
    assert_eq!(remote.drain(), vec![ChildMessage::DatabaseBlocked { database: db }]);
}

#[test]
fn test_closing_during_version_change_skips_blocked() {
    let (mut client, mut remote) = client();
    let db = open_library(&mut client, &mut remote);

    reply(
        &remote,
        ParentMessage::VersionChange {
            database: db,
            old_version: 1,
            new_version: None,
        },
    );
    assert!(matches!(client.next_event(), Some(Event::VersionChange { .. })));
    client.close(db).unwrap();
    assert_eq!(client.next_event(), None);
    assert_eq!(remote.drain(), vec![ChildMessage::DatabaseClose { database: db }]);
}

#[test]
fn test_factory_requests() {
    let (mut client, mut remote) = client();

    let err = client.open("library", Some(0)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Type);
    assert!(remote.drain().is_empty());

    let request = client.delete_database("library").unwrap();
    assert_eq!(
        remote.drain(),
        vec![ChildMessage::FactoryRequest {
            request,
            params: FactoryParams::Delete {
                name: "library".to_string(),
            },
        }]
    );

    reply(
        &remote,
        ParentMessage::FactoryBlocked {
            request,
            current_version: 3,
            requested_version: None,
        },
    );
    reply(
        &remote,
        ParentMessage::FactoryResponse {
            request,
            response: FactoryResponse::Delete { previous_version: 3 },
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Blocked {
            request,
            old_version: 3,
            new_version: None,
        })
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Success {
            request,
            transaction: None,
            result: RequestResult::Undefined,
        })
    );
    assert!(client.factory_request(request).is_none());
}

#[test]
fn test_mismatched_factory_response_closes_created_database() {
    let (mut client, mut remote) = client();
    let request = client.open("library", None).unwrap();
    remote.drain();

    reply(
        &remote,
        ParentMessage::DatabaseCreated {
            request,
            database: DB,
            spec: library_spec(),
        },
    );
    reply(
        &remote,
        ParentMessage::FactoryResponse {
            request,
            response: FactoryResponse::Delete { previous_version: 1 },
        },
    );
    assert_eq!(
        client.next_event(),
        Some(Event::Error {
            request,
            transaction: None,
            code: ErrorCode::Unknown,
        })
    );
    assert!(client.database(DB).unwrap().is_closed());
    assert_eq!(remote.drain(), vec![ChildMessage::DatabaseClose { database: DB }]);
}
