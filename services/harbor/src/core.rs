//! In-memory file table shared by the storage handlers.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

pub type SharedFileStore = Arc<Mutex<FileStore>>;

pub struct FileStore {
    files: HashMap<String, Vec<u8>>,
}

impl FileStore {
    pub fn new() -> FileStore {
        FileStore {
            files: HashMap::new(),
        }
    }

    pub fn shared() -> SharedFileStore {
        Arc::new(Mutex::new(FileStore::new()))
    }

    pub fn put(&mut self, file_name: &str, content: Vec<u8>) {
        self.files.insert(file_name.to_string(), content);
    }

    pub fn get(&self, file_name: &str) -> Option<Vec<u8>> {
        self.files.get(file_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let mut store = FileStore::new();
        assert_eq!(store.get("a.txt"), None);

        store.put("a.txt", b"one".to_vec());
        store.put("a.txt", b"two".to_vec());

        assert_eq!(store.get("a.txt"), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }
}
