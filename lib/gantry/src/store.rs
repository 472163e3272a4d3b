//! Registry of in-flight package buffers. The store is the only owner of
//! package memory; reactor and worker pass integer handles through the
//! message queues and the receiving side looks the buffer up again.

use std::sync::{Mutex, MutexGuard};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use plinth::crypto::aes_cipher_length;

use crate::error::{Error, Result};
use crate::package::{Package, HEADER_LEN, MAX_CONTENT_LEN};
use crate::schema::{self, Message};
use crate::{CommandId, PackageId, INVALID_ID, PACKAGE_VERSION};

struct StoreInner {
    next_id: PackageId,
    packages: HashMap<PackageId, Package>,
}

/// Thread-safe handle-indexed store of live packages.
pub struct PackageStore {
    inner: Mutex<StoreInner>,
}

impl PackageStore {
    pub fn new() -> PackageStore {
        PackageStore {
            inner: Mutex::new(StoreInner {
                next_id: 1,
                packages: HashMap::new(),
            }),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("package store lock poisoned")
    }

    /// Allocates a package buffer able to hold `content_length` bytes of body
    /// plus the padding of its encrypted form, so encryption can happen in
    /// place. The header is zeroed apart from version and content length.
    pub fn register(&self, content_length: i32) -> Result<Package> {
        if content_length < 0 || content_length as usize > MAX_CONTENT_LEN {
            return Err(Error::BufferTooLarge);
        }

        let len = HEADER_LEN + aes_cipher_length(content_length as usize);
        let buf = vec![0u8; len].into_boxed_slice();

        let mut inner = self.lock();

        let id = inner.next_id;
        inner.next_id = match inner.next_id.checked_add(1) {
            Some(next) => next,
            None => 1,
        };

        let package = Package::new(id, buf);
        match inner.packages.entry(id) {
            Entry::Occupied(_) => return Err(Error::PackageAlreadyExist),
            Entry::Vacant(entry) => entry.insert(package.clone()),
        };
        drop(inner);

        package.update_header(|header| {
            header.version = PACKAGE_VERSION;
            header.content_length = content_length;
        });

        Ok(package)
    }

    /// Serializes a message into a fresh package with the supplied header
    /// fields.
    pub fn encode<M: Message>(
        &self,
        command: CommandId,
        self_id: i32,
        trigger_id: i32,
        msg: &M,
    ) -> Result<Package> {
        let body = schema::encode(msg)?;
        if body.len() > MAX_CONTENT_LEN {
            return Err(Error::BufferTooLarge);
        }

        let package = self.register(body.len() as i32)?;
        package.update_header(|header| {
            header.command = command;
            header.self_id = self_id;
            header.trigger_id = trigger_id;
        });
        package.write_content(&body);

        Ok(package)
    }

    /// Removes a package. Removing an unknown handle is a no-op.
    pub fn remove(&self, package_id: PackageId) {
        self.lock().packages.remove(&package_id);
    }

    pub fn find(&self, package_id: PackageId) -> Option<Package> {
        if package_id == INVALID_ID {
            return None;
        }
        self.lock().packages.get(&package_id).cloned()
    }

    /// Like [`find`](Self::find) but missing handles are an error.
    pub fn get(&self, package_id: PackageId) -> Result<Package> {
        self.find(package_id).ok_or(Error::PackageNotExist)
    }

    pub fn size(&self) -> usize {
        self.lock().packages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_register_find_remove() {
        let store = PackageStore::new();

        let package = store.register(100).unwrap();
        assert_ne!(package.id(), INVALID_ID);
        assert_eq!(store.size(), 1);

        let header = package.header();
        assert_eq!(header.version, PACKAGE_VERSION);
        assert_eq!(header.content_length, 100);

        let found = store.find(package.id()).unwrap();
        assert_eq!(found.id(), package.id());

        store.remove(package.id());
        assert!(store.find(package.id()).is_none());
        assert_eq!(store.size(), 0);

        // Idempotent.
        store.remove(package.id());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_register_sizes_for_cipher() {
        let store = PackageStore::new();

        let package = store.register(17).unwrap();
        assert_eq!(package.buffer_len(), HEADER_LEN + 32);

        let package = store.register(0).unwrap();
        assert_eq!(package.buffer_len(), HEADER_LEN);
    }

    #[test]
    fn test_register_rejects_oversize() {
        let store = PackageStore::new();

        assert_eq!(store.register(-1).unwrap_err(), Error::BufferTooLarge);
        assert_eq!(
            store.register(MAX_CONTENT_LEN as i32 + 1).unwrap_err(),
            Error::BufferTooLarge
        );
    }

    #[test]
    fn test_get_missing() {
        let store = PackageStore::new();
        assert_eq!(store.get(123).unwrap_err(), Error::PackageNotExist);
        assert!(store.find(INVALID_ID).is_none());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = PackageStore::new();

        let first = store.register(0).unwrap().id();
        let second = store.register(0).unwrap().id();
        assert!(second > first);
    }

    #[test]
    fn test_concurrent_register() {
        let store = Arc::new(PackageStore::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let package = store.register(16).unwrap();
                        store.remove(package.id());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.size(), 0);
    }
}
