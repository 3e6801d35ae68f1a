//! Object store and index operations
//!
//! Handles are plain descriptors: a transaction id plus the metadata seen
//! when the handle was taken. Every operation re-checks the live schema so a
//! store deleted by a version change is rejected with InvalidState.

use super::transaction::TransactionState;
use super::Client;
use crate::error::{IdbError, Result};
use crate::protocol::{CursorSource, OpenCursorParams, RequestId, RequestParams, TransactionId};
use crate::types::{
    CursorDirection, IndexMetadata, Key, KeyPath, KeyRange, ObjectStoreMetadata, ObjectStoreSpec,
};
use crate::value::{SerializedValue, StructuredValue};

/// An object store as seen by one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStoreHandle {
    pub(crate) transaction: TransactionId,
    pub(crate) metadata: ObjectStoreMetadata,
}

impl ObjectStoreHandle {
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn id(&self) -> i64 {
        self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.metadata.key_path
    }

    pub fn auto_increment(&self) -> bool {
        self.metadata.auto_increment
    }
}

/// An index as seen by one transaction
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHandle {
    pub(crate) transaction: TransactionId,
    pub(crate) object_store: i64,
    pub(crate) object_store_name: String,
    pub(crate) metadata: IndexMetadata,
}

impl IndexHandle {
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn id(&self) -> i64 {
        self.metadata.id
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn object_store(&self) -> i64 {
        self.object_store
    }

    pub fn object_store_name(&self) -> &str {
        &self.object_store_name
    }

    pub fn is_unique(&self) -> bool {
        self.metadata.unique
    }

    pub fn is_multi_entry(&self) -> bool {
        self.metadata.multi_entry
    }
}

/// Extract an in-line key from a JSON value
fn extract_key(value: &StructuredValue, key_path: &KeyPath) -> Result<Option<Key>> {
    match key_path {
        KeyPath::None => Ok(None),
        KeyPath::Single(path) => lookup(value, path).map(json_to_key).transpose(),
        KeyPath::Array(paths) => {
            let mut keys = Vec::with_capacity(paths.len());
            for path in paths {
                match lookup(value, path) {
                    Some(v) => keys.push(json_to_key(v)?),
                    None => return Ok(None),
                }
            }
            Ok(Some(Key::Array(keys)))
        }
    }
}

fn lookup<'a>(value: &'a StructuredValue, path: &str) -> Option<&'a StructuredValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, part| current.get(part))
}

fn json_to_key(value: &StructuredValue) -> Result<Key> {
    match value {
        StructuredValue::Number(n) => {
            let n = n
                .as_f64()
                .ok_or_else(|| IdbError::Data(format!("Number {} is not a valid key", n)))?;
            Key::number(n)
        }
        StructuredValue::String(s) => Ok(Key::string(s.as_str())),
        StructuredValue::Array(items) => items
            .iter()
            .map(json_to_key)
            .collect::<Result<Vec<_>>>()
            .map(Key::Array),
        other => Err(IdbError::Data(format!("{} is not a valid key", other))),
    }
}

/// `Some(0)` means no limit
fn normalize_limit(limit: Option<u32>) -> Option<u32> {
    limit.filter(|&n| n > 0)
}

impl Client {
    /// Take a handle on an object store in the transaction's scope
    pub fn object_store(
        &mut self,
        transaction: TransactionId,
        name: &str,
    ) -> Result<ObjectStoreHandle> {
        self.context.assert_owning_thread();

        let controller = self
            .transactions
            .get(&transaction)
            .ok_or_else(|| IdbError::unknown_actor("transaction", transaction.0))?;
        if controller.state() == TransactionState::Done {
            return Err(IdbError::InvalidState(format!(
                "Transaction [{}] has finished",
                controller.serial()
            )));
        }
        if !controller.has_object_store(name) {
            return Err(IdbError::object_store_not_found(name));
        }
        let metadata = self
            .databases
            .get(&controller.database())
            .and_then(|db| db.spec().object_store(name))
            .map(|store| store.metadata.clone())
            .ok_or_else(|| IdbError::object_store_not_found(name))?;

        if let Some(controller) = self.transactions.get_mut(&transaction) {
            controller.cache_store_handle(&metadata);
        }
        Ok(ObjectStoreHandle {
            transaction,
            metadata,
        })
    }

    /// Take a handle on an index of an object store
    pub fn index(&self, store: &ObjectStoreHandle, name: &str) -> Result<IndexHandle> {
        self.context.assert_owning_thread();
        let live = self.live_store(store)?;
        let metadata = live
            .index(name)
            .cloned()
            .ok_or_else(|| IdbError::index_not_found(&live.metadata.name, name))?;
        Ok(IndexHandle {
            transaction: store.transaction,
            object_store: store.metadata.id,
            object_store_name: live.metadata.name.clone(),
            metadata,
        })
    }

    /// Current schema entry of a store, or InvalidState if it was deleted
    fn live_store(&self, store: &ObjectStoreHandle) -> Result<&ObjectStoreSpec> {
        let controller = self
            .transactions
            .get(&store.transaction)
            .ok_or_else(|| IdbError::unknown_actor("transaction", store.transaction.0))?;
        self.databases
            .get(&controller.database())
            .and_then(|db| db.spec().object_store_by_id(store.metadata.id))
            .ok_or_else(|| {
                IdbError::InvalidState(format!(
                    "Object store '{}' has been deleted",
                    store.metadata.name
                ))
            })
    }

    fn live_index(&self, index: &IndexHandle) -> Result<()> {
        let controller = self
            .transactions
            .get(&index.transaction)
            .ok_or_else(|| IdbError::unknown_actor("transaction", index.transaction.0))?;
        let exists = self
            .databases
            .get(&controller.database())
            .and_then(|db| db.spec().object_store_by_id(index.object_store))
            .map_or(false, |store| store.indexes.iter().any(|i| i.id == index.metadata.id));
        if exists {
            Ok(())
        } else {
            Err(IdbError::InvalidState(format!(
                "Index '{}' has been deleted",
                index.metadata.name
            )))
        }
    }

    /// Insert or replace a record
    pub fn put(
        &mut self,
        store: &ObjectStoreHandle,
        value: &StructuredValue,
        key: Option<Key>,
    ) -> Result<RequestId> {
        self.store_write(store, value, key, true)
    }

    /// Insert a record; the remote side fails it with ConstraintError if the key exists
    pub fn add(
        &mut self,
        store: &ObjectStoreHandle,
        value: &StructuredValue,
        key: Option<Key>,
    ) -> Result<RequestId> {
        self.store_write(store, value, key, false)
    }

    fn store_write(
        &mut self,
        store: &ObjectStoreHandle,
        value: &StructuredValue,
        key: Option<Key>,
        overwrite: bool,
    ) -> Result<RequestId> {
        self.context.assert_owning_thread();
        self.live_store(store)?;
        self.ensure_can_issue(store.transaction, true)?;

        let metadata = &store.metadata;
        let key = match (&metadata.key_path, key) {
            (KeyPath::None, None) if !metadata.auto_increment => {
                return Err(IdbError::Data(format!(
                    "Object store '{}' uses out-of-line keys and has no key generator; a key is required",
                    metadata.name
                )))
            }
            (KeyPath::None, key) => key,
            (_, Some(_)) => {
                return Err(IdbError::Data(format!(
                    "Object store '{}' uses in-line keys; an explicit key is not allowed",
                    metadata.name
                )))
            }
            (key_path, None) => {
                let extracted = extract_key(value, key_path)?;
                if extracted.is_none() && !metadata.auto_increment {
                    return Err(IdbError::Data(format!(
                        "Value has no key at the key path of '{}'",
                        metadata.name
                    )));
                }
                extracted
            }
        };

        let data = self.codec.encode(value)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::Put {
                object_store: metadata.id,
                value: SerializedValue::inline(data),
                key,
                overwrite,
            },
        )
    }

    /// Read the first record in the range
    pub fn get(&mut self, store: &ObjectStoreHandle, range: impl Into<KeyRange>) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::Get {
                object_store: store.metadata.id,
                range: range.into(),
            },
        )
    }

    pub fn get_all(
        &mut self,
        store: &ObjectStoreHandle,
        range: Option<KeyRange>,
        limit: Option<u32>,
    ) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::GetAll {
                object_store: store.metadata.id,
                range,
                limit: normalize_limit(limit),
            },
        )
    }

    pub fn get_all_keys(
        &mut self,
        store: &ObjectStoreHandle,
        range: Option<KeyRange>,
        limit: Option<u32>,
    ) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::GetAllKeys {
                object_store: store.metadata.id,
                range,
                limit: normalize_limit(limit),
            },
        )
    }

    pub fn count(&mut self, store: &ObjectStoreHandle, range: Option<KeyRange>) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::Count {
                object_store: store.metadata.id,
                range,
            },
        )
    }

    pub fn delete(&mut self, store: &ObjectStoreHandle, range: impl Into<KeyRange>) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::Delete {
                object_store: store.metadata.id,
                range: range.into(),
            },
        )
    }

    pub fn clear(&mut self, store: &ObjectStoreHandle) -> Result<RequestId> {
        self.live_store(store)?;
        self.dispatch_request(
            store.transaction,
            RequestParams::Clear {
                object_store: store.metadata.id,
            },
        )
    }

    /// Open a value cursor; the success event carries the cursor id, or
    /// `NoCursor` when the range is empty
    pub fn open_cursor(
        &mut self,
        store: &ObjectStoreHandle,
        range: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.live_store(store)?;
        self.open_cursor_request(
            store.transaction,
            OpenCursorParams {
                source: CursorSource::ObjectStore {
                    object_store: store.metadata.id,
                },
                key_only: false,
                range,
                direction,
            },
        )
    }

    pub fn open_key_cursor(
        &mut self,
        store: &ObjectStoreHandle,
        range: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.live_store(store)?;
        self.open_cursor_request(
            store.transaction,
            OpenCursorParams {
                source: CursorSource::ObjectStore {
                    object_store: store.metadata.id,
                },
                key_only: true,
                range,
                direction,
            },
        )
    }

    pub fn index_get(&mut self, index: &IndexHandle, range: impl Into<KeyRange>) -> Result<RequestId> {
        self.live_index(index)?;
        self.dispatch_request(
            index.transaction,
            RequestParams::IndexGet {
                object_store: index.object_store,
                index: index.metadata.id,
                range: range.into(),
            },
        )
    }

    /// Primary key of the first record whose index key is in the range
    pub fn index_get_key(&mut self, index: &IndexHandle, range: impl Into<KeyRange>) -> Result<RequestId> {
        self.live_index(index)?;
        self.dispatch_request(
            index.transaction,
            RequestParams::IndexGetKey {
                object_store: index.object_store,
                index: index.metadata.id,
                range: range.into(),
            },
        )
    }

    pub fn index_get_all(
        &mut self,
        index: &IndexHandle,
        range: Option<KeyRange>,
        limit: Option<u32>,
    ) -> Result<RequestId> {
        self.live_index(index)?;
        self.dispatch_request(
            index.transaction,
            RequestParams::IndexGetAll {
                object_store: index.object_store,
                index: index.metadata.id,
                range,
                limit: normalize_limit(limit),
            },
        )
    }

    pub fn index_get_all_keys(
        &mut self,
        index: &IndexHandle,
        range: Option<KeyRange>,
        limit: Option<u32>,
    ) -> Result<RequestId> {
        self.live_index(index)?;
        self.dispatch_request(
            index.transaction,
            RequestParams::IndexGetAllKeys {
                object_store: index.object_store,
                index: index.metadata.id,
                range,
                limit: normalize_limit(limit),
            },
        )
    }

    pub fn index_count(&mut self, index: &IndexHandle, range: Option<KeyRange>) -> Result<RequestId> {
        self.live_index(index)?;
        self.dispatch_request(
            index.transaction,
            RequestParams::IndexCount {
                object_store: index.object_store,
                index: index.metadata.id,
                range,
            },
        )
    }

    pub fn index_open_cursor(
        &mut self,
        index: &IndexHandle,
        range: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.index_cursor(index, range, direction, false)
    }

    pub fn index_open_key_cursor(
        &mut self,
        index: &IndexHandle,
        range: Option<KeyRange>,
        direction: CursorDirection,
    ) -> Result<RequestId> {
        self.index_cursor(index, range, direction, true)
    }

    fn index_cursor(
        &mut self,
        index: &IndexHandle,
        range: Option<KeyRange>,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<RequestId> {
        self.live_index(index)?;
        self.open_cursor_request(
            index.transaction,
            OpenCursorParams {
                source: CursorSource::Index {
                    object_store: index.object_store,
                    index: index.metadata.id,
                },
                key_only,
                range,
                direction,
            },
        )
    }
}
