//! Open and delete-database requests

use super::context::LocalEvent;
use super::database::DatabaseHandle;
use super::request::RequestResult;
use super::transaction::TransactionController;
use super::Client;
use super::Event;
use crate::error::{ErrorCode, IdbError, Result};
use crate::protocol::{
    ChildMessage, DatabaseId, FactoryParams, FactoryResponse, RequestId, TransactionId,
};
use crate::types::DatabaseSpec;

/// An outstanding open or delete-database request
#[derive(Debug)]
pub struct FactoryRequest {
    id: RequestId,
    params: FactoryParams,
    database: Option<DatabaseId>,
    upgrade: Option<TransactionId>,
}

impl FactoryRequest {
    fn new(id: RequestId, params: FactoryParams) -> Self {
        Self {
            id,
            params,
            database: None,
            upgrade: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn params(&self) -> &FactoryParams {
        &self.params
    }

    /// Database created for this request, once the remote side announced it
    pub fn database(&self) -> Option<DatabaseId> {
        self.database
    }

    /// Version change transaction started by this request
    pub fn upgrade_transaction(&self) -> Option<TransactionId> {
        self.upgrade
    }

    fn is_open(&self) -> bool {
        matches!(self.params, FactoryParams::Open { .. })
    }
}

impl Client {
    /// Open a database, upgrading it when `version` is newer than the stored one
    pub fn open(&mut self, name: &str, version: Option<u64>) -> Result<RequestId> {
        if version == Some(0) {
            return Err(IdbError::Type("Version must be greater than zero".into()));
        }
        self.start_factory_request(FactoryParams::Open {
            name: name.to_string(),
            version,
        })
    }

    pub fn delete_database(&mut self, name: &str) -> Result<RequestId> {
        self.start_factory_request(FactoryParams::Delete {
            name: name.to_string(),
        })
    }

    /// Look up an outstanding factory request
    pub fn factory_request(&self, request: RequestId) -> Option<&FactoryRequest> {
        self.factory_requests.get(&request)
    }

    fn start_factory_request(&mut self, params: FactoryParams) -> Result<RequestId> {
        self.context.assert_owning_thread();
        if !self.channel_open {
            return Err(IdbError::ChannelClosed("cannot start a factory request".into()));
        }
        if self.context.is_shutting_down() {
            return Err(IdbError::InvalidState("Owning context is shutting down".into()));
        }

        let request = self.allocate_request_id();
        log::debug!("{}: factory request {:?}", request, params);
        self.factory_requests
            .insert(request, FactoryRequest::new(request, params.clone()));
        self.send(ChildMessage::FactoryRequest { request, params });
        Ok(request)
    }

    pub(crate) fn on_factory_blocked(
        &mut self,
        request: RequestId,
        current_version: u64,
        requested_version: Option<u64>,
    ) {
        if !self.factory_requests.contains_key(&request) {
            log::warn!("Blocked notice for unknown {}", request);
            return;
        }
        self.queue_event(
            Event::Blocked {
                request,
                old_version: current_version,
                new_version: requested_version,
            },
            None,
            None,
        );
    }

    pub(crate) fn on_database_created(
        &mut self,
        request: RequestId,
        database: DatabaseId,
        spec: DatabaseSpec,
    ) {
        let factory = match self.factory_requests.get_mut(&request) {
            Some(factory) if factory.is_open() => factory,
            _ => {
                log::warn!("{} created for unknown or non-open {}", database, request);
                return;
            }
        };
        if self.databases.contains_key(&database) {
            log::warn!("{}: database id {} already in use", request, database);
            return;
        }
        log::info!(
            "{}: database '{}' version {} ({})",
            request,
            spec.name,
            spec.version,
            database
        );
        factory.database = Some(database);
        self.databases
            .insert(database, DatabaseHandle::new(database, spec));
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_upgrade_needed(
        &mut self,
        request: RequestId,
        database: DatabaseId,
        transaction: TransactionId,
        current_version: u64,
        requested_version: u64,
        next_object_store_id: i64,
        next_index_id: i64,
    ) {
        if !self.factory_requests.contains_key(&request) {
            log::warn!("Upgrade for unknown {}", request);
            return;
        }
        let names = match self.databases.get(&database) {
            Some(db) => db.object_store_names(),
            None => {
                log::warn!("{}: upgrade for unknown {}", request, database);
                return;
            }
        };
        if self.transactions.contains_key(&transaction) {
            log::error!("{}: remote reused live transaction id {}", request, transaction);
            return;
        }
        self.reserve_transaction_id(transaction);

        let controller = TransactionController::version_change(
            transaction,
            database,
            names,
            next_object_store_id,
            next_index_id,
        );
        log::info!(
            "Transaction [{}] version change {} -> {} on {}",
            controller.serial(),
            current_version,
            requested_version,
            database
        );
        self.transactions.insert(transaction, controller);
        if let Some(db) = self.databases.get_mut(&database) {
            db.register_transaction(transaction);
            db.enter_version_change(transaction, requested_version);
        }
        if let Some(factory) = self.factory_requests.get_mut(&request) {
            factory.upgrade = Some(transaction);
        }

        if !self
            .context
            .run_before_next_tick(LocalEvent::TransactionCreated(transaction))
        {
            log::warn!("{}: owning context is shutting down, aborting upgrade", request);
            self.abort_transaction(transaction, ErrorCode::Abort);
            return;
        }

        self.queue_event(
            Event::UpgradeNeeded {
                request,
                database,
                transaction,
                old_version: current_version,
                new_version: requested_version,
            },
            Some(transaction),
            None,
        );
    }

    pub(crate) fn on_factory_response(&mut self, request: RequestId, response: FactoryResponse) {
        let factory = match self.factory_requests.remove(&request) {
            Some(factory) => factory,
            None => {
                log::warn!("Response for unknown factory {}", request);
                return;
            }
        };
        self.challenges.remove(&request);

        let outcome = match response {
            FactoryResponse::Open { database } if factory.is_open() => {
                if self.databases.contains_key(&database) {
                    Ok(RequestResult::Database(database))
                } else {
                    log::warn!("{}: opened unknown {}", request, database);
                    Err(ErrorCode::Unknown)
                }
            }
            FactoryResponse::Delete { previous_version } if !factory.is_open() => {
                log::info!("{}: deleted database at version {}", request, previous_version);
                Ok(RequestResult::Undefined)
            }
            FactoryResponse::Error(code) => Err(code),
            other => {
                log::warn!("{}: unexpected factory response {:?}", request, other);
                Err(ErrorCode::Unknown)
            }
        };

        let event = match outcome {
            Ok(result) => Event::Success {
                request,
                transaction: None,
                result,
            },
            Err(code) => {
                if let Some(database) = factory.database {
                    self.close_database(database);
                }
                log::debug!("{}: factory request failed: {}", request, code);
                Event::Error {
                    request,
                    transaction: None,
                    code,
                }
            }
        };
        self.queue_event(event, None, None);
    }
}
