//! Process bootstrapper. Owns every framework component, wires the two
//! threads together and tears them down in reverse order of creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use plinth::logging::{self, Logger};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::network::Network;
use crate::queue::MessageQueues;
use crate::reactor::Reactor;
use crate::registry::{ErrorHandler, MptFactory, OnePhaseHandler, TransactionRegistry};
use crate::schema::{CommandTable, Message};
use crate::service::ServiceManager;
use crate::store::PackageStore;
use crate::worker::Worker;
use crate::ServiceId;

/// A node before launch: the registration surface for messages, handlers and
/// services.
pub struct Node {
    config: NodeConfig,
    commands: CommandTable,
    registry: TransactionRegistry,
    services: Arc<ServiceManager>,
    log: Logger,
}

impl Node {
    /// Creates a node from its configuration. Peers listed in the config are
    /// registered as services up front, in order.
    pub fn new(config: NodeConfig, log: Logger) -> Node {
        let services = Arc::new(ServiceManager::new());

        for peer in &config.peers {
            let service_id = services.register(&peer.ip, peer.port);
            logging::info!(log, "registers peer service";
                           "service_id" => service_id,
                           "ip" => %peer.ip,
                           "port" => peer.port);
        }

        Node {
            config,
            commands: CommandTable::new(),
            registry: TransactionRegistry::new(),
            services,
            log,
        }
    }

    #[inline]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline]
    pub fn commands(&mut self) -> &mut CommandTable {
        &mut self.commands
    }

    /// Assigns the next user command number to a message type.
    pub fn register_message<M: Message>(&mut self) -> Result<()> {
        self.commands.register::<M>()?;
        Ok(())
    }

    /// Registers a one-phase handler for the command of request type `M`.
    pub fn register_one_phase<M: Message>(&mut self, handler: OnePhaseHandler) -> Result<()> {
        let command = self.commands.command_of::<M>()?;
        self.registry.register_one_phase(command, handler, None)
    }

    /// Like [`register_one_phase`](Self::register_one_phase) with a custom
    /// error handler.
    pub fn register_one_phase_with<M: Message>(
        &mut self,
        handler: OnePhaseHandler,
        error_handler: ErrorHandler,
    ) -> Result<()> {
        let command = self.commands.command_of::<M>()?;
        self.registry
            .register_one_phase(command, handler, Some(error_handler))
    }

    /// Registers a multi-phase transaction factory for the command of request
    /// type `M`.
    pub fn register_multi_phase<M: Message>(&mut self, factory: MptFactory) -> Result<()> {
        let command = self.commands.command_of::<M>()?;
        self.registry.register_multi_phase(command, factory, None)
    }

    /// Registers an additional service beyond the configured peers.
    pub fn register_service(&self, ip: &str, port: u16) -> ServiceId {
        self.services.register(ip, port)
    }

    pub fn find_service(&self, ip: &str, port: u16) -> Option<ServiceId> {
        self.services.find_by_addr(ip, port)
    }

    /// Launches the reactor and worker threads and returns the running pair.
    pub fn spawn(self) -> Result<RunningNode> {
        let store = Arc::new(PackageStore::new());
        let queues = Arc::new(MessageQueues::new());
        let commands = Arc::new(self.commands);
        let stop = Arc::new(AtomicBool::new(false));

        let net = Network::new(
            store,
            queues,
            self.services,
            commands,
            self.log.new(logging::o!("component" => "network")),
        );

        let mut reactor = Reactor::new(
            net.clone(),
            stop.clone(),
            self.log.new(logging::o!("thread" => "reactor")),
        )?;
        reactor.register_listener(
            &self.config.listen.ip,
            self.config.listen.port,
            self.config.listen.security,
        )?;

        let mut worker = Worker::new(
            net.clone(),
            Arc::new(self.registry),
            stop.clone(),
            self.log.new(logging::o!("thread" => "worker")),
        );

        let worker_thread = thread::Builder::new()
            .name("worker".to_string())
            .spawn(move || worker.run())?;

        let reactor_thread = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || reactor.run())?;

        Ok(RunningNode {
            net,
            stop,
            reactor: Some(reactor_thread),
            worker: Some(worker_thread),
            log: self.log,
        })
    }

    /// Runs the node until it is stopped from another thread or killed.
    pub fn run(self) -> Result<()> {
        let running = self.spawn()?;
        running.join();
        Ok(())
    }
}

/// Handle to the two running threads. Dropping it stops the node.
pub struct RunningNode {
    net: Network,
    stop: Arc<AtomicBool>,
    reactor: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    log: Logger,
}

impl RunningNode {
    #[inline]
    pub fn network(&self) -> &Network {
        &self.net
    }

    /// Signals both threads to wind down. Idempotent; returns immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Waits for both threads to finish. The reactor returns first, then the
    /// worker observes the flag.
    pub fn join(mut self) {
        self.join_threads();
    }

    fn join_threads(&mut self) {
        if let Some(handle) = self.reactor.take() {
            if handle.join().is_err() {
                logging::error!(self.log, "reactor thread panicked");
            }
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                logging::error!(self.log, "worker thread panicked");
            }
        }
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.stop();
        self.join_threads();
    }
}
