//! Worker-side network operation set. Everything here turns into entries on
//! the outbound queue; the reactor owns the sockets and does the actual IO.

use std::sync::Arc;

use plinth::logging::{self, Logger};

use crate::error::Result;
use crate::package::TriggerSource;
use crate::queue::{DeferredTask, InboundEntry, MessageQueues, NetworkMsg, OutboundEntry, ReactorTask, WorkerTask};
use crate::schema::{CommandTable, Message, RspError};
use crate::service::ServiceManager;
use crate::store::PackageStore;
use crate::{CommandId, ConnId, PackageId, ServiceId, INVALID_ID};

/// Shared bundle of the thread-safe framework state: package store, queues,
/// services and the command table. Cheap to clone; both threads hold one.
#[derive(Clone)]
pub struct Network {
    store: Arc<PackageStore>,
    queues: Arc<MessageQueues>,
    services: Arc<ServiceManager>,
    commands: Arc<CommandTable>,
    log: Logger,
}

impl Network {
    pub fn new(
        store: Arc<PackageStore>,
        queues: Arc<MessageQueues>,
        services: Arc<ServiceManager>,
        commands: Arc<CommandTable>,
        log: Logger,
    ) -> Network {
        Network {
            store,
            queues,
            services,
            commands,
            log,
        }
    }

    #[inline]
    pub fn store(&self) -> &PackageStore {
        &self.store
    }

    #[inline]
    pub fn queues(&self) -> &MessageQueues {
        &self.queues
    }

    #[inline]
    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    #[inline]
    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Queues an already-encoded package for a connection.
    pub fn send_package(&self, conn_id: ConnId, package_id: PackageId) -> Result<()> {
        self.push_outbound(NetworkMsg {
            conn_id,
            service_id: INVALID_ID,
            package_id,
        })
    }

    /// Queues an already-encoded package for a service.
    pub fn service_send_package(&self, service_id: ServiceId, package_id: PackageId) -> Result<()> {
        self.push_outbound(NetworkMsg {
            conn_id: INVALID_ID,
            service_id,
            package_id,
        })
    }

    /// Encodes and sends an unsolicited message to a connection.
    pub fn send_message<M: Message>(&self, conn_id: ConnId, msg: &M) -> Result<PackageId> {
        self.send_message_impl(conn_id, INVALID_ID, false, msg, None)
    }

    /// Encodes and sends an unsolicited message to a service.
    pub fn service_send_message<M: Message>(&self, service_id: ServiceId, msg: &M) -> Result<PackageId> {
        self.send_message_impl(INVALID_ID, service_id, false, msg, None)
    }

    /// Encodes and sends a reply, echoing the trigger source of the request.
    pub fn send_back_message<M: Message>(
        &self,
        conn_id: ConnId,
        msg: &M,
        trigger: &TriggerSource,
    ) -> Result<PackageId> {
        self.send_message_impl(conn_id, INVALID_ID, false, msg, Some(trigger))
    }

    /// Sends an `RspError` reply to the origin of a failed request. Failures
    /// here are logged and swallowed; there is nobody left to tell.
    pub fn send_back_error(&self, conn_id: ConnId, trigger: &TriggerSource, code: i32) {
        logging::error!(self.log, "send back error";
                        "conn_id" => conn_id,
                        "trigger_cmd" => trigger.command,
                        "code" => code);

        let reply = RspError { result: code };
        if let Err(err) = self.send_back_message(conn_id, &reply, trigger) {
            logging::error!(self.log, "error reply failed";
                            "conn_id" => conn_id,
                            "error" => ?err);
        }
    }

    /// Encodes a request whose `self_id` is set to the fresh package id, so a
    /// reply carrying it as `trigger_id` can be routed back. Used by
    /// multi-phase transactions.
    pub(crate) fn send_bound_message<M: Message>(
        &self,
        conn_id: ConnId,
        service_id: ServiceId,
        msg: &M,
    ) -> Result<PackageId> {
        self.send_message_impl(conn_id, service_id, true, msg, None)
    }

    fn send_message_impl<M: Message>(
        &self,
        conn_id: ConnId,
        service_id: ServiceId,
        correlate: bool,
        msg: &M,
        trigger: Option<&TriggerSource>,
    ) -> Result<PackageId> {
        let command = self.resolve_command::<M>(trigger)?;
        let trigger_id = trigger.map(|source| source.self_id).unwrap_or(0);

        let package = self.store.encode(command, 0, trigger_id, msg)?;
        let package_id = package.id();
        if correlate {
            package.update_header(|header| header.self_id = package_id);
        }

        logging::debug!(self.log, "send message";
                        "conn_id" => conn_id,
                        "service_id" => service_id,
                        "cmd" => command,
                        "name" => M::NAME,
                        "trigger_id" => trigger_id);

        self.push_outbound(NetworkMsg {
            conn_id,
            service_id,
            package_id,
        })?;

        Ok(package_id)
    }

    /// An error reply converts to the `Rsp*` command paired with the failed
    /// request, so the requester can decode it under the command it awaits.
    fn resolve_command<M: Message>(&self, trigger: Option<&TriggerSource>) -> Result<CommandId> {
        if M::NAME == RspError::NAME {
            if let Some(source) = trigger {
                if let Some(command) = self.commands.response_command_for(source.command) {
                    return Ok(command);
                }
            }
        }

        self.commands.get_command(M::NAME)
    }

    fn push_outbound(&self, msg: NetworkMsg) -> Result<()> {
        let package_id = msg.package_id;
        match self.queues.outbound.push(OutboundEntry::Network(msg)) {
            Ok(()) => Ok(()),
            Err(err) => {
                logging::error!(self.log, "outbound queue rejected package";
                                "package_id" => package_id,
                                "error" => ?err);
                self.store.remove(package_id);
                Err(err)
            }
        }
    }

    /// Hands an inbound package to the worker, stamped with the service the
    /// connection belongs to (if any).
    pub(crate) fn deliver_inbound(&self, conn_id: ConnId, package_id: PackageId) {
        let service_id = self
            .services
            .find_by_connection(conn_id)
            .unwrap_or(INVALID_ID);

        let msg = NetworkMsg {
            conn_id,
            service_id,
            package_id,
        };

        if let Err(err) = self.queues.inbound.push(InboundEntry::Network(msg)) {
            logging::error!(self.log, "inbound queue rejected package";
                            "conn_id" => conn_id,
                            "package_id" => package_id,
                            "error" => ?err);
            self.store.remove(package_id);
        }
    }

    /// Runs a closure on the reactor thread.
    pub fn post_reactor_task(&self, caller: &'static str, action: ReactorTask) -> Result<()> {
        self.queues
            .outbound
            .push(OutboundEntry::Task(DeferredTask { caller, action }))
    }

    /// Runs a closure on the worker thread.
    pub fn post_worker_task(&self, caller: &'static str, action: WorkerTask) -> Result<()> {
        self.queues
            .inbound
            .push(InboundEntry::Task(DeferredTask { caller, action }))
    }

    /// Removes a service and tears down its cached connection on the reactor.
    pub fn remove_service(&self, service_id: ServiceId) {
        if let Some(conn_id) = self.services.remove(service_id) {
            let _ = self.post_reactor_task(
                "remove_service",
                Box::new(move |reactor| reactor.close_connection(conn_id)),
            );
        }
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }
}
