//! Registry of resident shared documents.
//!
//! Uses DashMap so sessions for unrelated documents never contend. The map
//! is the single source of truth for which instance is resident under a key:
//! creation goes through the entry API and eviction removes an entry only if
//! it still carries the evicting instance's generation.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::document::{DocumentDiagnostics, DocumentHandle, DocumentLocation, SharedDocument};
use super::{DocumentKey, SessionId, SyncConfig, SyncError, SyncResult};

/// Attach attempts before giving up on a key that keeps closing
const ATTACH_ATTEMPTS: usize = 3;

/// Creates, reuses and evicts shared documents
pub struct DocumentRegistry {
    documents: Arc<DashMap<DocumentKey, DocumentHandle>>,
    next_generation: AtomicU64,
    config: SyncConfig,
}

impl DocumentRegistry {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            documents: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Handle of the resident document for `key`, starting one if needed
    pub fn get_or_create(&self, key: &str, location: DocumentLocation) -> DocumentHandle {
        match self.documents.entry(key.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                // Actor gone without deregistering
                let handle = self.spawn(key, location);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(key, location);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn(&self, key: &str, location: DocumentLocation) -> DocumentHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        info!("Opening document {} (generation {})", key, generation);
        SharedDocument::spawn(
            key.to_string(),
            generation,
            location,
            self.config.clone(),
            self.documents.clone(),
        )
    }

    pub fn get(&self, key: &str) -> Option<DocumentHandle> {
        self.documents.get(key).map(|entry| entry.value().clone())
    }

    /// Attach a session to the document for `key`. An instance that stops
    /// between lookup and attach is replaced by a freshly loaded one.
    pub async fn attach(
        &self,
        key: &str,
        location: DocumentLocation,
        session_id: SessionId,
        outbound: mpsc::Sender<Bytes>,
    ) -> SyncResult<DocumentHandle> {
        for _ in 0..ATTACH_ATTEMPTS {
            let handle = self.get_or_create(key, location.clone());
            match handle.attach(session_id, outbound.clone()).await {
                Ok(()) => return Ok(handle),
                Err(SyncError::DocumentClosed(_)) => {
                    debug!("Document {} closed during attach, retrying", key);
                    self.documents
                        .remove_if(key, |_, resident| resident.generation() == handle.generation());
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::DocumentClosed(key.to_string()))
    }

    /// Flush a resident document now. Nothing to do when it is not resident.
    pub async fn flush_now(&self, key: &str) -> SyncResult<()> {
        let Some(handle) = self.get(key) else {
            return Ok(());
        };
        match handle.flush_now().await {
            // Eviction flushes before stopping
            Err(SyncError::DocumentClosed(_)) => Ok(()),
            result => result,
        }
    }

    pub async fn diagnostics(&self, key: &str) -> Option<DocumentDiagnostics> {
        let handle = self.get(key)?;
        handle.diagnostics().await.ok()
    }

    pub fn is_resident(&self, key: &str) -> bool {
        self.documents.contains_key(key)
    }

    /// Number of resident documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Flush and stop every resident document
    pub async fn shutdown(&self) {
        // Handles are collected first; actors remove themselves from the map
        let handles: Vec<DocumentHandle> = self
            .documents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("Shutting down {} document(s)", handles.len());
        join_all(handles.iter().map(|handle| handle.shutdown())).await;
    }
}
