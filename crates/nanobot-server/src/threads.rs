//! The thread store contract.
//!
//! Sessions surface to users as named threads. The store is a pluggable
//! collaborator; the in-memory implementation backs tests and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One thread as listed to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadInfo {
    pub session_id: String,
    pub title: String,
    pub created: DateTime<Utc>,
}

/// Pluggable thread persistence.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Threads belonging to an account, newest first.
    async fn find_by_account(&self, account_id: &str) -> Vec<ThreadInfo>;
    /// One thread, scoped to its owning account.
    async fn get_by_id_by_account(&self, session_id: &str, account_id: &str) -> Option<ThreadInfo>;
    /// Record a thread.
    async fn put(&self, account_id: &str, info: ThreadInfo);
    /// Delete a thread.
    async fn delete(&self, session_id: &str);
    /// Retitle a thread.
    async fn rename(&self, session_id: &str, title: &str);
}

/// A process-local thread store.
#[derive(Default)]
pub struct InMemoryThreadStore {
    // session_id → (account_id, info)
    threads: Mutex<HashMap<String, (String, ThreadInfo)>>,
}

impl InMemoryThreadStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn find_by_account(&self, account_id: &str) -> Vec<ThreadInfo> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<ThreadInfo> = threads
            .values()
            .filter(|(owner, _)| owner == account_id)
            .map(|(_, info)| info.clone())
            .collect();
        found.sort_by(|a, b| b.created.cmp(&a.created));
        found
    }

    async fn get_by_id_by_account(&self, session_id: &str, account_id: &str) -> Option<ThreadInfo> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads
            .get(session_id)
            .filter(|(owner, _)| owner == account_id)
            .map(|(_, info)| info.clone())
    }

    async fn put(&self, account_id: &str, info: ThreadInfo) {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.session_id.clone(), (account_id.to_string(), info));
    }

    async fn delete(&self, session_id: &str) {
        self.threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    async fn rename(&self, session_id: &str, title: &str) {
        if let Some((_, info)) = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(session_id)
        {
            info.title = title.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(session_id: &str) -> ThreadInfo {
        ThreadInfo {
            session_id: session_id.to_string(),
            title: "untitled".to_string(),
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn threads_scope_to_account() {
        let store = InMemoryThreadStore::new();
        store.put("alice", thread("s1")).await;
        store.put("bob", thread("s2")).await;

        assert_eq!(store.find_by_account("alice").await.len(), 1);
        assert!(store.get_by_id_by_account("s1", "alice").await.is_some());
        assert!(store.get_by_id_by_account("s1", "bob").await.is_none());
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let store = InMemoryThreadStore::new();
        store.put("alice", thread("s1")).await;

        store.rename("s1", "planning session").await;
        let info = store.get_by_id_by_account("s1", "alice").await.unwrap();
        assert_eq!(info.title, "planning session");

        store.delete("s1").await;
        assert!(store.get_by_id_by_account("s1", "alice").await.is_none());
    }
}
