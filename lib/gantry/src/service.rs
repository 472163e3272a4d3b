//! Symbolic peers. A service is an `(ip, port)` pair whose underlying
//! connection is materialized lazily by the reactor on first send and
//! re-created whenever the cached connection has gone away.

use std::sync::{Mutex, MutexGuard};

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::{ConnId, ServiceId};

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub service_id: ServiceId,
    pub ip: String,
    pub port: u16,
}

struct ServiceInner {
    next_id: ServiceId,
    services: IndexMap<ServiceId, ServiceRecord>,
    conn_of_service: HashMap<ServiceId, ConnId>,
    service_of_conn: HashMap<ConnId, ServiceId>,
}

/// Registry of services and their cached connections. Registration happens on
/// the worker (or at startup); the connection cache is touched only by the
/// reactor.
pub struct ServiceManager {
    inner: Mutex<ServiceInner>,
}

impl ServiceManager {
    pub fn new() -> ServiceManager {
        ServiceManager {
            inner: Mutex::new(ServiceInner {
                next_id: 1,
                services: IndexMap::new(),
                conn_of_service: HashMap::new(),
                service_of_conn: HashMap::new(),
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, ServiceInner> {
        self.inner.lock().expect("service manager lock poisoned")
    }

    /// Registers a service, or returns the existing id for the same
    /// `(ip, port)`.
    pub fn register(&self, ip: &str, port: u16) -> ServiceId {
        let mut inner = self.lock();

        let existing = inner
            .services
            .values()
            .find(|record| record.ip == ip && record.port == port)
            .map(|record| record.service_id);
        if let Some(service_id) = existing {
            return service_id;
        }

        let service_id = inner.next_id;
        inner.next_id += 1;
        inner.services.insert(
            service_id,
            ServiceRecord {
                service_id,
                ip: ip.to_string(),
                port,
            },
        );

        service_id
    }

    /// Removes a service record. Returns the cached connection id, if any, so
    /// the caller can tear the connection down on the reactor.
    pub fn remove(&self, service_id: ServiceId) -> Option<ConnId> {
        let mut inner = self.lock();

        inner.services.swap_remove(&service_id);
        let conn_id = inner.conn_of_service.remove(&service_id);
        if let Some(conn_id) = conn_id {
            inner.service_of_conn.remove(&conn_id);
        }

        conn_id
    }

    pub fn find(&self, service_id: ServiceId) -> Option<ServiceRecord> {
        self.lock().services.get(&service_id).cloned()
    }

    pub fn find_by_addr(&self, ip: &str, port: u16) -> Option<ServiceId> {
        self.lock()
            .services
            .values()
            .find(|record| record.ip == ip && record.port == port)
            .map(|record| record.service_id)
    }

    /// The service a connection was created for, if any. Used to stamp
    /// inbound messages so transactions can wait on a service.
    pub fn find_by_connection(&self, conn_id: ConnId) -> Option<ServiceId> {
        self.lock().service_of_conn.get(&conn_id).copied()
    }

    pub fn cached_connection(&self, service_id: ServiceId) -> Option<ConnId> {
        self.lock().conn_of_service.get(&service_id).copied()
    }

    /// Overwrites the cached connection for a service.
    pub fn cache_connection(&self, service_id: ServiceId, conn_id: ConnId) {
        let mut inner = self.lock();

        if let Some(old) = inner.conn_of_service.insert(service_id, conn_id) {
            inner.service_of_conn.remove(&old);
        }
        inner.service_of_conn.insert(conn_id, service_id);
    }

    /// Drops the cache entry of a destroyed connection.
    pub fn uncache_connection(&self, conn_id: ConnId) {
        let mut inner = self.lock();

        if let Some(service_id) = inner.service_of_conn.remove(&conn_id) {
            inner.conn_of_service.remove(&service_id);
        }
    }

    pub fn size(&self) -> usize {
        self.lock().services.len()
    }
}
