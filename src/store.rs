use std::sync::Mutex;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::command::ErrorCode;

/// A store failure, carrying the wire-level error code so a server session can answer the
///  peer with a faithful Error command.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("{message}")]
pub struct StoreError {
    pub code: ErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn not_found(path: &str) -> StoreError {
        StoreError {
            code: ErrorCode::FILE_NOT_FOUND,
            message: format!("file not found: {}", path),
        }
    }

    pub fn already_exists(path: &str) -> StoreError {
        StoreError {
            code: ErrorCode::FILE_EXISTS,
            message: format!("file already exists: {}", path),
        }
    }
}

/// The narrow file-access seam consumed by server sessions.
///
/// Hosting concerns (directories, permissions, persistence) live behind this trait and are
///  none of the protocol engine's business.
pub trait FileStore: Send + Sync + 'static {
    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Reserves `path` for a transfer that is about to start, so a colliding write request
    ///  is answered before any data flows.
    fn create(&self, path: &str) -> Result<(), StoreError>;

    fn write(&self, path: &str, contents: Vec<u8>) -> Result<(), StoreError>;
}

/// In-memory store for tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        Default::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().expect("store lock poisoned").get(path).cloned()
    }
}

impl FileStore for MemoryStore {
    fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.files.lock().expect("store lock poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::not_found(path))
    }

    fn create(&self, path: &str) -> Result<(), StoreError> {
        let mut files = self.files.lock().expect("store lock poisoned");
        if files.contains_key(path) {
            return Err(StoreError::already_exists(path));
        }
        files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn write(&self, path: &str, contents: Vec<u8>) -> Result<(), StoreError> {
        self.files.lock().expect("store lock poisoned")
            .insert(path.to_string(), contents);
        Ok(())
    }
}
