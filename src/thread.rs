// Thread Store - external collaborator
//
// Message threads live outside this crate. The core only needs to read who
// takes part in a thread and which listing it is about, when the offer
// workflow opens a transaction for it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ExchangeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub listing_id: String,
    pub participants: Vec<String>,
}

impl ThreadInfo {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// Read access to message threads. Implementations map their own failures
/// into ExchangeError (usually StorageUnavailable).
pub trait ThreadStore: Send + Sync {
    fn thread(&self, thread_id: &str) -> Result<Option<ThreadInfo>>;
}

/// Thread directory held in memory (tests, single-process deployments)
#[derive(Debug, Default, Clone)]
pub struct InMemoryThreadStore {
    threads: Arc<RwLock<HashMap<String, ThreadInfo>>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, thread: ThreadInfo) {
        if let Ok(mut threads) = self.threads.write() {
            threads.insert(thread.thread_id.clone(), thread);
        }
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn thread(&self, thread_id: &str) -> Result<Option<ThreadInfo>> {
        let threads = self
            .threads
            .read()
            .map_err(|_| ExchangeError::StorageUnavailable { attempts: 1 })?;
        Ok(threads.get(thread_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let store = InMemoryThreadStore::new();
        store.insert(ThreadInfo {
            thread_id: "th-1".to_string(),
            listing_id: "lst-1".to_string(),
            participants: vec!["u-buyer".to_string(), "u-seller".to_string()],
        });

        let thread = store.thread("th-1").unwrap().unwrap();
        assert!(thread.has_participant("u-buyer"));
        assert!(!thread.has_participant("u-stranger"));
        assert!(store.thread("th-404").unwrap().is_none());
    }
}
