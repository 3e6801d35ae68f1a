use super::database::DatabaseHandle;
use super::object_store::{IndexHandle, ObjectStoreHandle};
use super::transaction::TransactionController;
use super::Client;
use crate::error::{IdbError, Result};
use crate::protocol::{ChildMessage, TransactionId};
use crate::types::{IndexMetadata, KeyPath, ObjectStoreMetadata, ObjectStoreSpec, TransactionMode};

impl Client {
    /// Controller and database of an active version change transaction
    fn schema_parts(
        &mut self,
        transaction: TransactionId,
    ) -> Result<(&mut TransactionController, &mut DatabaseHandle)> {
        let dispatching = self.dispatching;
        let controller = self
            .transactions
            .get_mut(&transaction)
            .ok_or_else(|| IdbError::unknown_actor("transaction", transaction.0))?;
        if controller.mode() != TransactionMode::VersionChange {
            return Err(IdbError::InvalidState(format!(
                "Transaction [{}] is not a version change transaction",
                controller.serial()
            )));
        }
        if !controller.is_active(dispatching) {
            return Err(IdbError::transaction_inactive(controller.serial()));
        }
        let database = controller.database();
        let db = self
            .databases
            .get_mut(&database)
            .ok_or_else(|| IdbError::unknown_actor("database", database.0))?;
        Ok((controller, db))
    }

    /// Execute createObjectStore
    pub fn create_object_store(
        &mut self,
        transaction: TransactionId,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<ObjectStoreHandle> {
        self.context.assert_owning_thread();
        let (controller, db) = self.schema_parts(transaction)?;
        if db.spec().object_store(name).is_some() {
            return Err(IdbError::Constraint(format!(
                "Object store '{}' already exists",
                name
            )));
        }
        if auto_increment && matches!(key_path, KeyPath::Array(_)) {
            return Err(IdbError::InvalidState(
                "A key generator cannot be used with a compound key path".into(),
            ));
        }

        let metadata = ObjectStoreMetadata {
            id: controller.allocate_object_store_id(),
            name: name.to_string(),
            key_path,
            auto_increment,
        };
        log::info!(
            "Transaction [{}]: create object store '{}' (id {})",
            controller.serial(),
            name,
            metadata.id
        );

        self.send(ChildMessage::CreateObjectStore {
            transaction,
            metadata: metadata.clone(),
        });

        let (controller, db) = self.schema_parts(transaction)?;
        db.spec_mut()
            .object_stores
            .push(ObjectStoreSpec::new(metadata.clone()));
        controller.add_object_store_name(name);
        controller.cache_store_handle(&metadata);
        Ok(ObjectStoreHandle {
            transaction,
            metadata,
        })
    }

    /// Execute deleteObjectStore
    pub fn delete_object_store(&mut self, transaction: TransactionId, name: &str) -> Result<()> {
        self.context.assert_owning_thread();
        let (controller, db) = self.schema_parts(transaction)?;
        let id = db
            .spec()
            .object_store(name)
            .map(|store| store.metadata.id)
            .ok_or_else(|| IdbError::object_store_not_found(name))?;
        log::info!(
            "Transaction [{}]: delete object store '{}' (id {})",
            controller.serial(),
            name,
            id
        );

        self.send(ChildMessage::DeleteObjectStore {
            transaction,
            object_store: id,
        });

        let (controller, db) = self.schema_parts(transaction)?;
        db.spec_mut().object_stores.retain(|store| store.metadata.id != id);
        controller.remove_object_store_name(name);
        controller.delete_store_handle(id);
        Ok(())
    }

    /// Rename an object store, updating the handle in place
    pub fn rename_object_store(&mut self, store: &mut ObjectStoreHandle, name: &str) -> Result<()> {
        self.context.assert_owning_thread();
        let transaction = store.transaction;
        let id = store.metadata.id;
        let (controller, db) = self.schema_parts(transaction)?;
        let old_name = db
            .spec()
            .object_store_by_id(id)
            .map(|s| s.metadata.name.clone())
            .ok_or_else(|| {
                IdbError::InvalidState(format!(
                    "Object store '{}' has been deleted",
                    store.metadata.name
                ))
            })?;
        if old_name == name {
            return Ok(());
        }
        if db.spec().object_store(name).is_some() {
            return Err(IdbError::Constraint(format!(
                "Object store '{}' already exists",
                name
            )));
        }
        log::info!(
            "Transaction [{}]: rename object store '{}' to '{}'",
            controller.serial(),
            old_name,
            name
        );

        self.send(ChildMessage::RenameObjectStore {
            transaction,
            object_store: id,
            name: name.to_string(),
        });

        let (controller, db) = self.schema_parts(transaction)?;
        if let Some(spec) = db.spec_mut().object_store_mut(&old_name) {
            spec.metadata.name = name.to_string();
        }
        controller.remove_object_store_name(&old_name);
        controller.add_object_store_name(name);
        controller.rename_store_handle(id, name);
        store.metadata.name = name.to_string();
        Ok(())
    }

    /// Execute createIndex
    pub fn create_index(
        &mut self,
        store: &ObjectStoreHandle,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<IndexHandle> {
        self.context.assert_owning_thread();
        let transaction = store.transaction;
        let store_id = store.metadata.id;
        let (controller, db) = self.schema_parts(transaction)?;
        let spec = db.spec().object_store_by_id(store_id).ok_or_else(|| {
            IdbError::InvalidState(format!(
                "Object store '{}' has been deleted",
                store.metadata.name
            ))
        })?;
        if spec.index(name).is_some() {
            return Err(IdbError::Constraint(format!(
                "Index '{}' already exists on object store '{}'",
                name, spec.metadata.name
            )));
        }
        if multi_entry && matches!(key_path, KeyPath::Array(_)) {
            return Err(IdbError::InvalidState(
                "A multi-entry index cannot use a compound key path".into(),
            ));
        }
        let store_name = spec.metadata.name.clone();

        let metadata = IndexMetadata {
            id: controller.allocate_index_id(),
            name: name.to_string(),
            key_path,
            unique,
            multi_entry,
        };
        log::info!(
            "Transaction [{}]: create index '{}' on '{}' (id {})",
            controller.serial(),
            name,
            store_name,
            metadata.id
        );

        self.send(ChildMessage::CreateIndex {
            transaction,
            object_store: store_id,
            metadata: metadata.clone(),
        });

        let (_, db) = self.schema_parts(transaction)?;
        if let Some(spec) = db.spec_mut().object_store_mut(&store_name) {
            spec.indexes.push(metadata.clone());
        }
        Ok(IndexHandle {
            transaction,
            object_store: store_id,
            object_store_name: store_name,
            metadata,
        })
    }

    /// Execute deleteIndex
    pub fn delete_index(&mut self, store: &ObjectStoreHandle, name: &str) -> Result<()> {
        self.context.assert_owning_thread();
        let transaction = store.transaction;
        let store_id = store.metadata.id;
        let (controller, db) = self.schema_parts(transaction)?;
        let spec = db.spec().object_store_by_id(store_id).ok_or_else(|| {
            IdbError::InvalidState(format!(
                "Object store '{}' has been deleted",
                store.metadata.name
            ))
        })?;
        let index_id = spec
            .index(name)
            .map(|index| index.id)
            .ok_or_else(|| IdbError::index_not_found(&spec.metadata.name, name))?;
        let store_name = spec.metadata.name.clone();
        log::info!(
            "Transaction [{}]: delete index '{}' on '{}'",
            controller.serial(),
            name,
            store_name
        );

        self.send(ChildMessage::DeleteIndex {
            transaction,
            object_store: store_id,
            index: index_id,
        });

        let (_, db) = self.schema_parts(transaction)?;
        if let Some(spec) = db.spec_mut().object_store_mut(&store_name) {
            spec.indexes.retain(|index| index.id != index_id);
        }
        Ok(())
    }

    /// Rename an index, updating the handle in place
    pub fn rename_index(&mut self, index: &mut IndexHandle, name: &str) -> Result<()> {
        self.context.assert_owning_thread();
        let transaction = index.transaction;
        let store_id = index.object_store;
        let index_id = index.metadata.id;
        let (controller, db) = self.schema_parts(transaction)?;
        let spec = db
            .spec()
            .object_store_by_id(store_id)
            .filter(|spec| spec.indexes.iter().any(|i| i.id == index_id))
            .ok_or_else(|| {
                IdbError::InvalidState(format!("Index '{}' has been deleted", index.metadata.name))
            })?;
        if index.metadata.name == name {
            return Ok(());
        }
        if spec.index(name).is_some() {
            return Err(IdbError::Constraint(format!(
                "Index '{}' already exists on object store '{}'",
                name, spec.metadata.name
            )));
        }
        let store_name = spec.metadata.name.clone();
        log::info!(
            "Transaction [{}]: rename index '{}' on '{}' to '{}'",
            controller.serial(),
            index.metadata.name,
            store_name,
            name
        );

        self.send(ChildMessage::RenameIndex {
            transaction,
            object_store: store_id,
            index: index_id,
            name: name.to_string(),
        });

        let (_, db) = self.schema_parts(transaction)?;
        if let Some(spec) = db.spec_mut().object_store_mut(&store_name) {
            if let Some(meta) = spec.indexes.iter_mut().find(|i| i.id == index_id) {
                meta.name = name.to_string();
            }
        }
        index.metadata.name = name.to_string();
        Ok(())
    }
}
