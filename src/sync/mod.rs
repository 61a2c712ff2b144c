//! Synchronization engine for real-time collaborative text documents.
//!
//! This module implements the session/protocol/persistence engine around a
//! CRDT text replica:
//! - Binary WebSocket protocol multiplexing content and presence
//! - One actor task per shared document, serializing every mutation
//! - A registry that creates, reuses and evicts documents
//! - Debounced persistence of document text to the project directory
//! - Admission control and session lifecycle for inbound connections

pub mod document;
pub mod gateway;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;

pub use document::DocumentDiagnostics;
pub use gateway::SyncGateway;
pub use registry::DocumentRegistry;

use std::time::Duration;
use thiserror::Error;

use persistence::PersistError;
use protocol::ProtocolError;
use replica::ReplicaError;

/// Registry key of a shared document: `project_id:file_path`
pub type DocumentKey = String;

/// Presence client identifier chosen by the client
pub type ClientId = u64;

/// Unique identifier for an attached session
pub type SessionId = uuid::Uuid;

/// Separator between project id and file path in a document key
pub const KEY_SEPARATOR: char = ':';

/// Build the registry key for a file in a project
pub fn document_key(project_id: &str, file_path: &str) -> DocumentKey {
    format!("{}{}{}", project_id, KEY_SEPARATOR, file_path)
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    /// The document actor stopped (evicted or shut down)
    #[error("Document closed: {0}")]
    DocumentClosed(DocumentKey),

    /// Malformed wire message
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The replica rejected an operation
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Flushing to disk failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistError),
}

/// Configuration for shared documents
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between the first unsaved mutation and the flush
    pub flush_debounce: Duration,
    /// How long an empty document stays resident
    pub eviction_grace: Duration,
    /// Presence entries not renewed within this window are retracted
    pub presence_timeout: Duration,
    /// How often stale presence is swept
    pub presence_sweep_interval: Duration,
    /// Queue depth of a document actor
    pub command_buffer: usize,
    /// Outbound frames buffered per session before broadcasts skip it
    pub outbound_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(500),
            eviction_grace: Duration::from_secs(60),
            presence_timeout: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(15),
            command_buffer: 256,
            outbound_buffer: 1024,
        }
    }
}
