//! The single-threaded network reactor. Owns every socket; after each poll
//! cycle it drains a bounded batch of outbound entries from the worker.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use plinth::logging::{self, Logger};

use crate::connection::{token_for, Connection, Status, TOKEN_BASE};
use crate::error::{Error, Result};
use crate::network::Network;
use crate::queue::{NetworkMsg, OutboundEntry};
use crate::{ConnId, SecuritySetting, ServiceId, INVALID_ID};

const POLL_TIMEOUT: Duration = Duration::from_millis(5);
const EVENTS_CAPACITY: usize = 1024;

/// Outbound entries processed per poll cycle.
const MAX_OUT_PROCESS_PER_CYCLE: usize = 10;

pub struct Reactor {
    poll: Poll,
    events: Events,
    listeners: Vec<(TcpListener, SecuritySetting)>,
    connections: IndexMap<ConnId, Connection>,
    next_conn_id: ConnId,
    net: Network,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl Reactor {
    pub fn new(net: Network, stop: Arc<AtomicBool>, log: Logger) -> Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners: Vec::new(),
            connections: IndexMap::new(),
            next_conn_id: 1,
            net,
            stop,
            log,
        })
    }

    /// Binds a listening socket. Every accepted connection inherits the
    /// listener's security setting.
    pub fn register_listener(&mut self, ip: &str, port: u16, security: SecuritySetting) -> Result<()> {
        let addr = parse_addr(ip, port)?;
        let mut listener = TcpListener::bind(addr)?;

        let token = Token(self.listeners.len());
        if token.0 >= TOKEN_BASE {
            return Err(Error::Io(io::ErrorKind::Other));
        }

        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;

        logging::info!(self.log, "creates network listener";
                       "address" => %addr,
                       "security" => ?security);

        self.listeners.push((listener, security));
        Ok(())
    }

    /// Opens an outbound connection (active open).
    pub fn register_connection(&mut self, ip: &str, port: u16) -> Result<ConnId> {
        let addr = parse_addr(ip, port)?;
        let mut socket = TcpStream::connect(addr)?;

        let id = self.alloc_conn_id();
        self.poll
            .registry()
            .register(&mut socket, token_for(id), Interest::READABLE)?;

        let peer = addr.to_string();
        let conn = Connection::connect(id, socket, &peer, &self.log);
        self.connections.insert(id, conn);

        Ok(id)
    }

    /// Requests closure of a connection; it is reclaimed after its write
    /// queue drains.
    pub fn close_connection(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.close();
        }
    }

    pub fn find_connection(&self, conn_id: ConnId) -> Option<&Connection> {
        self.connections.get(&conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    /// Blocks driving the event loop until the stop flag is raised, then
    /// tears every connection down.
    pub fn run(&mut self) {
        logging::info!(self.log, "starting network scheduler");

        while !self.stop.load(Ordering::Relaxed) {
            self.poll_once();
        }

        self.stop_all();
        logging::info!(self.log, "stopped network scheduler");
    }

    /// One poll cycle: socket events, reclamation sweep, outbound drain.
    pub fn poll_once(&mut self) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
            if err.kind() != io::ErrorKind::Interrupted {
                logging::error!(self.log, "poll failed"; "error" => %err);
            }
            return;
        }

        let events: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in events {
            if token.0 < TOKEN_BASE {
                self.accept_all(token.0);
                continue;
            }

            let conn_id = (token.0 - TOKEN_BASE) as ConnId;
            if let Some(conn) = self.connections.get_mut(&conn_id) {
                if readable {
                    conn.on_readable(&self.net, self.poll.registry());
                }
                if writable {
                    conn.on_writable(&self.net, self.poll.registry());
                }
            }
        }

        self.sweep_closed();
        self.process_out_messages();
    }

    fn accept_all(&mut self, listener_index: usize) {
        loop {
            let accepted = self.listeners[listener_index].0.accept();
            let security = self.listeners[listener_index].1;

            match accepted {
                Ok((socket, _peer)) => {
                    let id = self.alloc_conn_id();
                    let mut socket = socket;

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut socket, token_for(id), Interest::READABLE)
                    {
                        logging::error!(self.log, "stream registration failed"; "error" => %err);
                        continue;
                    }

                    let conn =
                        Connection::accept(id, socket, security, &self.net, self.poll.registry(), &self.log);
                    self.connections.insert(id, conn);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// Reclaims connections that finished closing.
    fn sweep_closed(&mut self) {
        let closed: Vec<ConnId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.status() == Status::Closed)
            .map(|(&id, _)| id)
            .collect();

        for conn_id in closed {
            if let Some(mut conn) = self.connections.swap_remove(&conn_id) {
                conn.destroy(&self.net, self.poll.registry());
            }
        }
    }

    /// Drains a bounded batch from the outbound queue.
    fn process_out_messages(&mut self) {
        for _ in 0..MAX_OUT_PROCESS_PER_CYCLE {
            match self.net.queues().outbound.pop() {
                None => break,
                Some(OutboundEntry::Task(task)) => {
                    logging::debug!(self.log, "run deferred task"; "caller" => task.caller);
                    (task.action)(self);
                }
                Some(OutboundEntry::Network(msg)) => self.send_queued(msg),
            }
        }
    }

    fn send_queued(&mut self, msg: NetworkMsg) {
        let conn_id = if msg.conn_id != INVALID_ID {
            msg.conn_id
        } else {
            match self.service_connection(msg.service_id) {
                Ok(conn_id) => conn_id,
                Err(err) => {
                    logging::error!(self.log, "service resolution failed";
                                    "service_id" => msg.service_id,
                                    "error" => ?err);
                    self.net.store().remove(msg.package_id);
                    return;
                }
            }
        };

        let package = self.net.store().find(msg.package_id);
        let conn_ready = self
            .connections
            .get(&conn_id)
            .map(|conn| conn.is_send_ready())
            .unwrap_or(false);

        if !conn_ready {
            logging::info!(self.log, "connection already closed"; "conn_id" => conn_id);
        }

        match package {
            Some(package) if conn_ready => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    conn.send(&self.net, self.poll.registry(), package);
                }
            }
            Some(package) => {
                // Connection gone; the package must not leak.
                self.net.store().remove(package.id());
            }
            None => {
                logging::error!(self.log, "package already removed";
                                "conn_id" => conn_id,
                                "package_id" => msg.package_id);
            }
        }
    }

    /// Resolves a service to a live connection, creating one when the cache
    /// is empty or stale.
    fn service_connection(&mut self, service_id: ServiceId) -> Result<ConnId> {
        let record = self
            .net
            .services()
            .find(service_id)
            .ok_or(Error::ServiceNotExist)?;

        if let Some(conn_id) = self.net.services().cached_connection(service_id) {
            let alive = self
                .connections
                .get(&conn_id)
                .map(|conn| conn.is_send_ready())
                .unwrap_or(false);
            if alive {
                return Ok(conn_id);
            }
        }

        let conn_id = self.register_connection(&record.ip, record.port)?;
        self.net.services().cache_connection(service_id, conn_id);

        logging::info!(self.log, "service connection created";
                       "service_id" => service_id,
                       "conn_id" => conn_id);

        Ok(conn_id)
    }

    /// Closes and reclaims everything. Run on the way out of the loop.
    fn stop_all(&mut self) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn_id in ids {
            if let Some(mut conn) = self.connections.swap_remove(&conn_id) {
                conn.destroy(&self.net, self.poll.registry());
            }
        }
        self.listeners.clear();
    }
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", ip, port)
        .parse::<SocketAddr>()
        .map_err(|_| Error::Io(io::ErrorKind::InvalidInput))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MessageQueues;
    use crate::schema::CommandTable;
    use crate::service::ServiceManager;
    use crate::store::PackageStore;

    fn test_reactor() -> Reactor {
        let net = Network::new(
            Arc::new(PackageStore::new()),
            Arc::new(MessageQueues::new()),
            Arc::new(ServiceManager::new()),
            Arc::new(CommandTable::new()),
            plinth::logging::discard(),
        );

        Reactor::new(net, Arc::new(AtomicBool::new(false)), plinth::logging::discard()).unwrap()
    }

    #[test]
    fn test_send_to_missing_connection_frees_package() {
        let mut reactor = test_reactor();

        let package = reactor.net.store().register(4).unwrap();
        let package_id = package.id();

        reactor.send_queued(NetworkMsg {
            conn_id: 99,
            service_id: INVALID_ID,
            package_id,
        });

        assert!(reactor.net.store().find(package_id).is_none());
    }

    #[test]
    fn test_send_missing_package_logs_and_continues() {
        let mut reactor = test_reactor();

        reactor.send_queued(NetworkMsg {
            conn_id: 99,
            service_id: INVALID_ID,
            package_id: 12345,
        });

        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_unknown_service_frees_package() {
        let mut reactor = test_reactor();

        let package = reactor.net.store().register(4).unwrap();
        let package_id = package.id();

        reactor.send_queued(NetworkMsg {
            conn_id: INVALID_ID,
            service_id: 42,
            package_id,
        });

        assert!(reactor.net.store().find(package_id).is_none());
    }

    #[test]
    fn test_service_connection_created_lazily_and_recreated() {
        let mut reactor = test_reactor();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let service_id = reactor
            .net
            .services()
            .register(&addr.ip().to_string(), addr.port());

        let first = reactor.service_connection(service_id).unwrap();
        assert_eq!(reactor.net.services().cached_connection(service_id), Some(first));
        assert_eq!(reactor.connection_count(), 1);

        // Cache hit while the connection is alive.
        let again = reactor.service_connection(service_id).unwrap();
        assert_eq!(again, first);
        assert_eq!(reactor.connection_count(), 1);

        // Once the connection dies, the next resolution opens a new one.
        reactor.connections.get_mut(&first).unwrap().close_now();
        reactor.sweep_closed();
        assert_eq!(reactor.connection_count(), 0);

        let second = reactor.service_connection(service_id).unwrap();
        assert_ne!(second, first);
        assert_eq!(reactor.net.services().cached_connection(service_id), Some(second));
    }

    #[test]
    fn test_deferred_task_runs_on_reactor() {
        let mut reactor = test_reactor();

        reactor
            .net
            .post_reactor_task(
                "test",
                Box::new(|reactor: &mut Reactor| {
                    // Visible side effect on reactor state.
                    reactor.next_conn_id = 500;
                }),
            )
            .unwrap();

        reactor.process_out_messages();
        assert_eq!(reactor.next_conn_id, 500);
    }

    #[test]
    fn test_listener_accepts_connection() {
        let mut reactor = test_reactor();
        reactor.register_listener("127.0.0.1", 0, SecuritySetting::Close).unwrap();

        let addr = reactor.listeners[0].0.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        // A few cycles for the accept event to surface.
        for _ in 0..50 {
            reactor.poll_once();
            if reactor.connection_count() == 1 {
                break;
            }
        }

        assert_eq!(reactor.connection_count(), 1);
    }
}
