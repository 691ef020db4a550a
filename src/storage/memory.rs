// src/storage/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use super::Storage;

/// In-process storage; objects live as long as the value (and its clones).
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// URIs currently stored, sorted.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.lock().keys().cloned().collect();
        uris.sort();
        uris
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn put(&self, uri: &str, payload: &[u8]) -> Result<()> {
        self.lock().insert(uri.to_string(), payload.to_vec());
        Ok(())
    }

    fn get(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(uri).cloned())
    }

    fn contains(&self, uri: &str) -> bool {
        self.lock().contains_key(uri)
    }

    fn remove(&self, uri: &str) -> Result<()> {
        self.lock().remove(uri);
        Ok(())
    }
}
