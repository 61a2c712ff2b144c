//! Shared document actor.
//!
//! Every resident document is owned by a single tokio task. Sessions, the
//! registry and HTTP handlers talk to it through a [`DocumentHandle`], which
//! queues [`DocumentCommand`]s on a bounded channel. Because only the actor
//! touches the replica, presence table and session list, content merges,
//! presence changes, attaches, detaches and flushes of one document are
//! strictly serialized while different documents proceed in parallel.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::persistence::{self, PersistError, PersistenceScheduler};
use super::presence::{self, PresenceState};
use super::protocol::{self, ContentMessage, Frame};
use super::replica::{Replica, TextReplica};
use super::{ClientId, DocumentKey, SessionId, SyncConfig, SyncError, SyncResult};

/// Snapshot of a document's health for the status endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDiagnostics {
    pub session_count: usize,
    pub last_persist_error: Option<String>,
}

/// Requests processed by a document actor, in arrival order
pub(crate) enum DocumentCommand {
    Attach {
        session_id: SessionId,
        outbound: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<()>,
    },
    Message {
        session_id: SessionId,
        frame: Bytes,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Detach {
        session_id: SessionId,
    },
    FlushNow {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Diagnostics {
        reply: oneshot::Sender<DocumentDiagnostics>,
    },
    Snapshot {
        reply: oneshot::Sender<SyncResult<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable address of a running document actor
#[derive(Clone)]
pub struct DocumentHandle {
    key: Arc<str>,
    generation: u64,
    tx: mpsc::Sender<DocumentCommand>,
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl DocumentHandle {
    /// Distinguishes successive instances resident under the same key
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> SyncError {
        SyncError::DocumentClosed(self.key.to_string())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DocumentCommand,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Join a session. The session immediately receives the server's state
    /// vector and, if anyone is present, the presence of everyone else.
    pub async fn attach(&self, session_id: SessionId, outbound: mpsc::Sender<Bytes>) -> SyncResult<()> {
        self.request(|reply| DocumentCommand::Attach {
            session_id,
            outbound,
            reply,
        })
        .await
    }

    /// Hand an inbound binary frame to the document
    pub async fn deliver(&self, session_id: SessionId, frame: Bytes) -> SyncResult<()> {
        self.request(|reply| DocumentCommand::Message {
            session_id,
            frame,
            reply,
        })
        .await?
    }

    pub async fn detach(&self, session_id: SessionId) {
        if self.tx.send(DocumentCommand::Detach { session_id }).await.is_err() {
            debug!("Detach from closed document {}", self.key);
        }
    }

    /// Write the current text to disk, bypassing the debounce
    pub async fn flush_now(&self) -> SyncResult<()> {
        self.request(|reply| DocumentCommand::FlushNow { reply }).await?
    }

    pub async fn diagnostics(&self) -> SyncResult<DocumentDiagnostics> {
        self.request(|reply| DocumentCommand::Diagnostics { reply }).await
    }

    /// Current text of the replica
    pub async fn snapshot_text(&self) -> SyncResult<String> {
        self.request(|reply| DocumentCommand::Snapshot { reply }).await?
    }

    /// Flush pending changes and stop the actor
    pub async fn shutdown(&self) {
        if self.request(|reply| DocumentCommand::Shutdown { reply }).await.is_err() {
            debug!("Document {} already closed", self.key);
        }
    }
}

/// An attached session as seen by the document
struct Session {
    outbound: mpsc::Sender<Bytes>,
    /// Presence client ids this session has announced
    owned_presence: HashSet<ClientId>,
}

/// State owned by the actor task
pub(crate) struct SharedDocument {
    key: Arc<str>,
    generation: u64,
    absolute_path: PathBuf,
    metadata_path: Option<PathBuf>,
    replica: TextReplica,
    presence: PresenceState,
    sessions: HashMap<SessionId, Session>,
    persistence: PersistenceScheduler,
    eviction_deadline: Option<Instant>,
    config: SyncConfig,
    /// Registry map the document removes itself from when evicted
    documents: Arc<DashMap<DocumentKey, DocumentHandle>>,
}

/// Location of a document's backing file
#[derive(Debug, Clone)]
pub struct DocumentLocation {
    pub absolute_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
}

impl SharedDocument {
    /// Start the actor. The backing file is loaded by the task itself, ahead
    /// of any queued command.
    pub(crate) fn spawn(
        key: DocumentKey,
        generation: u64,
        location: DocumentLocation,
        config: SyncConfig,
        documents: Arc<DashMap<DocumentKey, DocumentHandle>>,
    ) -> DocumentHandle {
        let key: Arc<str> = Arc::from(key);
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));

        let document = SharedDocument {
            key: key.clone(),
            generation,
            absolute_path: location.absolute_path,
            metadata_path: location.metadata_path,
            replica: TextReplica::new(key.to_string()),
            presence: PresenceState::new(),
            sessions: HashMap::new(),
            persistence: PersistenceScheduler::new(config.flush_debounce),
            eviction_deadline: None,
            config,
            documents,
        };
        tokio::spawn(document.run(rx));

        DocumentHandle { key, generation, tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocumentCommand>) {
        self.load().await;

        let mut sweep = tokio::time::interval(self.config.presence_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        // Registry dropped every handle
                        self.flush_if_unsaved().await;
                        break;
                    };
                    if let Some(ack) = self.handle_command(command).await {
                        rx.close();
                        let _ = ack.send(());
                        break;
                    }
                }
                _ = self.persistence.fired() => {
                    // Failures are recorded for diagnostics
                    let _ = self.flush().await;
                }
                _ = sleep_until_opt(self.eviction_deadline) => {
                    if self.try_evict().await {
                        rx.close();
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_presence();
                }
            }
        }

        debug!("Document actor {} (generation {}) stopped", self.key, self.generation);
    }

    /// Returns the shutdown acknowledgement when the actor should stop
    async fn handle_command(&mut self, command: DocumentCommand) -> Option<oneshot::Sender<()>> {
        match command {
            DocumentCommand::Attach {
                session_id,
                outbound,
                reply,
            } => {
                self.attach(session_id, outbound);
                let _ = reply.send(());
            }
            DocumentCommand::Message {
                session_id,
                frame,
                reply,
            } => {
                let result = self.handle_frame(session_id, &frame);
                let _ = reply.send(result);
            }
            DocumentCommand::Detach { session_id } => {
                self.detach(session_id);
            }
            DocumentCommand::FlushNow { reply } => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
            DocumentCommand::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics());
            }
            DocumentCommand::Snapshot { reply } => {
                let _ = reply.send(self.replica.serialize_full().map_err(SyncError::from));
            }
            DocumentCommand::Shutdown { reply } => {
                self.flush_if_unsaved().await;
                self.deregister();
                return Some(reply);
            }
        }
        None
    }

    // ===== LIFECYCLE =====

    async fn load(&mut self) {
        let content = match tokio::fs::read(&self.absolute_path).await {
            Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                error!("Failed to read {}: {}", self.absolute_path.display(), e);
                self.persistence
                    .record_error(format!("Failed to read {}: {}", self.absolute_path.display(), e));
                String::new()
            }
        };

        match self.replica.seed(&content) {
            Ok(true) => info!("Loaded document {} ({} bytes)", self.key, content.len()),
            Ok(false) => debug!("Document {} already populated, not seeding", self.key),
            Err(e) => {
                error!("Failed to seed document {}: {}", self.key, e);
                self.persistence.record_error(&e);
            }
        }
    }

    fn attach(&mut self, session_id: SessionId, outbound: mpsc::Sender<Bytes>) {
        self.eviction_deadline = None;

        let session = Session {
            outbound,
            owned_presence: HashSet::new(),
        };

        let handshake = ContentMessage::StateVector(Bytes::from(self.replica.state_vector()));
        session.send(session_id, protocol::encode_content(&handshake));
        if !self.presence.is_empty() {
            session.send(session_id, protocol::encode_presence(&self.presence.encode_snapshot()));
        }

        self.sessions.insert(session_id, session);
        info!(
            "Session {} attached to {} ({} sessions)",
            session_id,
            self.key,
            self.sessions.len()
        );
    }

    fn detach(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };

        let removed = self.presence.remove_states(session.owned_presence);
        if !removed.is_empty() {
            let update = self.presence.encode_update(&removed);
            self.broadcast(protocol::encode_presence(&update), None);
        }

        info!(
            "Session {} detached from {} ({} sessions)",
            session_id,
            self.key,
            self.sessions.len()
        );

        if self.sessions.is_empty() {
            self.eviction_deadline = Some(Instant::now() + self.config.eviction_grace);
            debug!("Document {} idle, eviction in {:?}", self.key, self.config.eviction_grace);
        }
    }

    /// Returns true when the document left the registry
    async fn try_evict(&mut self) -> bool {
        self.eviction_deadline = None;
        if !self.sessions.is_empty() {
            return false;
        }

        if self.persistence.has_unsaved() {
            if let Err(e) = self.flush().await {
                warn!("Keeping {} resident, final flush failed: {}", self.key, e);
                self.eviction_deadline = Some(Instant::now() + self.config.eviction_grace);
                return false;
            }
        }

        self.deregister();
        info!("Evicted idle document {}", self.key);
        true
    }

    /// Remove this instance from the registry unless a newer one replaced it
    fn deregister(&self) {
        self.documents
            .remove_if(&*self.key, |_, handle| handle.generation == self.generation);
    }

    // ===== MESSAGES =====

    fn handle_frame(&mut self, session_id: SessionId, frame: &[u8]) -> SyncResult<()> {
        if !self.sessions.contains_key(&session_id) {
            debug!("Dropping frame from unattached session {}", session_id);
            return Ok(());
        }

        match protocol::decode_frame(frame)? {
            Frame::Content(ContentMessage::StateVector(peer_state)) => {
                let missing = self.replica.missing_operations(&peer_state)?;
                let reply = ContentMessage::MissingOperations(Bytes::from(missing));
                if let Some(session) = self.sessions.get(&session_id) {
                    session.send(session_id, protocol::encode_content(&reply));
                }
            }
            Frame::Content(ContentMessage::MissingOperations(update))
            | Frame::Content(ContentMessage::Update(update)) => {
                if let Some(delta) = self.replica.apply_remote_operation(&update)? {
                    let relay = ContentMessage::Update(Bytes::from(delta));
                    self.broadcast(protocol::encode_content(&relay), Some(session_id));
                    self.persistence.on_mutation();
                }
            }
            Frame::Presence(update) => self.apply_presence(session_id, &update),
            Frame::Unknown(kind) => {
                warn!("Ignoring message kind {} on {}", kind, self.key);
            }
        }
        Ok(())
    }

    fn apply_presence(&mut self, session_id: SessionId, update: &[u8]) {
        let announced = presence::decode_client_ids(update);
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.owned_presence.extend(announced);
        }

        match self.presence.apply_update(update) {
            Ok(change) if !change.is_empty() => {
                let relay = self.presence.encode_update(&change.clients());
                self.broadcast(protocol::encode_presence(&relay), Some(session_id));
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring malformed presence on {}: {}", self.key, e),
        }
    }

    fn sweep_presence(&mut self) {
        let removed = self.presence.prune_stale(self.config.presence_timeout);
        if removed.is_empty() {
            return;
        }
        debug!("Presence of {} client(s) on {} timed out", removed.len(), self.key);
        let update = self.presence.encode_update(&removed);
        self.broadcast(protocol::encode_presence(&update), None);
    }

    /// Send to every session except `origin`
    fn broadcast(&self, frame: Bytes, origin: Option<SessionId>) {
        for (session_id, session) in &self.sessions {
            if Some(*session_id) == origin {
                continue;
            }
            session.send(*session_id, frame.clone());
        }
    }

    // ===== PERSISTENCE =====

    async fn flush(&mut self) -> SyncResult<()> {
        self.persistence.disarm();

        let text = match self.replica.serialize_full() {
            Ok(text) => text,
            Err(e) => {
                let err = PersistError::Snapshot(e.to_string());
                error!("Flush of {} failed: {}", self.key, err);
                self.persistence.record_error(&err);
                return Err(err.into());
            }
        };

        match persistence::write_snapshot(&self.absolute_path, self.metadata_path.as_deref(), &text).await {
            Ok(report) => {
                self.persistence.mark_saved();
                match report.metadata_error {
                    Some(e) => {
                        warn!("Flushed {} but metadata update failed: {}", self.key, e);
                        self.persistence.record_error(&e);
                    }
                    None => self.persistence.clear_error(),
                }
                debug!("Flushed {} ({} bytes)", self.key, text.len());
                Ok(())
            }
            Err(e) => {
                error!("Flush of {} failed: {}", self.key, e);
                self.persistence.record_error(&e);
                Err(e.into())
            }
        }
    }

    async fn flush_if_unsaved(&mut self) {
        if self.persistence.has_unsaved() {
            let _ = self.flush().await;
        }
    }

    fn diagnostics(&self) -> DocumentDiagnostics {
        DocumentDiagnostics {
            session_count: self.sessions.len(),
            last_persist_error: self.persistence.last_error().map(str::to_string),
        }
    }
}

impl Session {
    /// Queue a frame without waiting; slow or gone peers are skipped
    fn send(&self, session_id: SessionId, frame: Bytes) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue of session {} full, frame skipped", session_id);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Session {} outbound closed", session_id);
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::presence::encode_entries;
    use std::time::Duration;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_config() -> SyncConfig {
        SyncConfig {
            flush_debounce: Duration::from_millis(20),
            eviction_grace: Duration::from_millis(50),
            ..SyncConfig::default()
        }
    }

    fn spawn_at(path: PathBuf, config: SyncConfig) -> (DocumentHandle, Arc<DashMap<DocumentKey, DocumentHandle>>) {
        let documents = Arc::new(DashMap::new());
        let key = "p1:main.tex".to_string();
        let handle = SharedDocument::spawn(
            key.clone(),
            1,
            DocumentLocation {
                absolute_path: path,
                metadata_path: None,
            },
            config,
            documents.clone(),
        );
        documents.insert(key, handle.clone());
        (handle, documents)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Bytes>) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound closed");
        protocol::decode_frame(&bytes).unwrap()
    }

    async fn assert_silent(rx: &mut mpsc::Receiver<Bytes>) {
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "unexpected frame");
    }

    async fn attach(handle: &DocumentHandle) -> (SessionId, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        handle.attach(id, tx).await.unwrap();
        (id, rx)
    }

    /// A client replica brought up to date with the server
    async fn synced_client(handle: &DocumentHandle, session: SessionId, rx: &mut mpsc::Receiver<Bytes>) -> TextReplica {
        let Frame::Content(ContentMessage::StateVector(_)) = next_frame(rx).await else {
            panic!("expected handshake");
        };
        let mut client = TextReplica::new("client");
        let request = ContentMessage::StateVector(Bytes::from(client.state_vector()));
        handle.deliver(session, protocol::encode_content(&request)).await.unwrap();
        let Frame::Content(ContentMessage::MissingOperations(ops)) = next_frame(rx).await else {
            panic!("expected missing operations");
        };
        client.apply_remote_operation(&ops).unwrap();
        client
    }

    #[tokio::test]
    async fn test_loads_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        std::fs::write(&path, "\\documentclass{article}").unwrap();

        let (handle, _) = spawn_at(path, test_config());
        assert_eq!(handle.snapshot_text().await.unwrap(), "\\documentclass{article}");
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let (handle, _) = spawn_at(dir.path().join("new.tex"), test_config());
        assert_eq!(handle.snapshot_text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_sync_step_and_update_relay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        std::fs::write(&path, "Hello").unwrap();
        let (handle, _) = spawn_at(path.clone(), test_config());

        let (a, mut rx_a) = attach(&handle).await;
        let (b, mut rx_b) = attach(&handle).await;
        let mut client_a = synced_client(&handle, a, &mut rx_a).await;
        let mut client_b = synced_client(&handle, b, &mut rx_b).await;
        assert_eq!(client_a.serialize_full().unwrap(), "Hello");

        let update = client_a.splice(5, 0, " world").unwrap();
        let frame = protocol::encode_content(&ContentMessage::Update(Bytes::from(update)));
        handle.deliver(a, frame).await.unwrap();

        let Frame::Content(ContentMessage::Update(delta)) = next_frame(&mut rx_b).await else {
            panic!("expected update");
        };
        client_b.apply_remote_operation(&delta).unwrap();
        assert_eq!(client_b.serialize_full().unwrap(), "Hello world");
        assert_silent(&mut rx_a).await;

        // Debounced flush reaches the disk
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Hello world");
    }

    #[tokio::test]
    async fn test_duplicate_update_not_relayed() {
        let dir = tempdir().unwrap();
        let (handle, _) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, mut rx_a) = attach(&handle).await;
        let (_b, mut rx_b) = attach(&handle).await;
        let mut client = synced_client(&handle, a, &mut rx_a).await;
        next_frame(&mut rx_b).await;

        let update = Bytes::from(client.splice(0, 0, "x").unwrap());
        let frame = protocol::encode_content(&ContentMessage::Update(update));
        handle.deliver(a, frame.clone()).await.unwrap();
        next_frame(&mut rx_b).await;

        handle.deliver(a, frame).await.unwrap();
        assert_silent(&mut rx_b).await;
        assert_eq!(handle.snapshot_text().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_presence_relayed_without_echo() {
        let dir = tempdir().unwrap();
        let (handle, _) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, mut rx_a) = attach(&handle).await;
        let (_b, mut rx_b) = attach(&handle).await;
        next_frame(&mut rx_a).await;
        next_frame(&mut rx_b).await;

        let update = encode_entries([(7, 1, Some(r#"{"user":"ada"}"#))]);
        handle.deliver(a, protocol::encode_presence(&update)).await.unwrap();

        let Frame::Presence(relayed) = next_frame(&mut rx_b).await else {
            panic!("expected presence");
        };
        assert_eq!(presence::decode_client_ids(&relayed), vec![7]);
        assert_silent(&mut rx_a).await;

        // A late joiner receives the presence snapshot after the handshake
        let (_c, mut rx_c) = attach(&handle).await;
        assert!(matches!(next_frame(&mut rx_c).await, Frame::Content(ContentMessage::StateVector(_))));
        let Frame::Presence(snapshot) = next_frame(&mut rx_c).await else {
            panic!("expected presence snapshot");
        };
        assert_eq!(presence::decode_client_ids(&snapshot), vec![7]);
    }

    #[tokio::test]
    async fn test_detach_retracts_owned_presence() {
        let dir = tempdir().unwrap();
        let (handle, _) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, mut rx_a) = attach(&handle).await;
        let (_b, mut rx_b) = attach(&handle).await;
        next_frame(&mut rx_a).await;
        next_frame(&mut rx_b).await;

        let update = encode_entries([(42, 1, Some(r#"{"cursor":3}"#))]);
        handle.deliver(a, protocol::encode_presence(&update)).await.unwrap();
        next_frame(&mut rx_b).await;

        handle.detach(a).await;
        let Frame::Presence(removal) = next_frame(&mut rx_b).await else {
            panic!("expected removal");
        };
        assert_eq!(presence::decode_client_ids(&removal), vec![42]);
        assert_eq!(handle.diagnostics().await.unwrap().session_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let dir = tempdir().unwrap();
        let (handle, _) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, mut rx_a) = attach(&handle).await;
        next_frame(&mut rx_a).await;

        // Truncated presence is ignored
        handle.deliver(a, Bytes::from_static(&[1, 9, 1])).await.unwrap();
        // Unknown kinds are ignored
        handle.deliver(a, Bytes::from_static(&[7, 0])).await.unwrap();
        // Truncated content is a protocol error
        let err = handle.deliver(a, Bytes::from_static(&[0, 2, 10, 1])).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        assert_eq!(handle.snapshot_text().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_truncated_update_is_replica_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        std::fs::write(&path, "Hello").unwrap();
        let (handle, _) = spawn_at(path, test_config());
        let (a, mut rx_a) = attach(&handle).await;
        let (_b, mut rx_b) = attach(&handle).await;
        let mut client = synced_client(&handle, a, &mut rx_a).await;
        next_frame(&mut rx_b).await;

        let mut update = client.splice(5, 0, " world").unwrap();
        update.truncate(update.len() - 5);
        let frame = protocol::encode_content(&ContentMessage::Update(Bytes::from(update)));

        let err = handle.deliver(a, frame).await.unwrap_err();
        assert!(matches!(err, SyncError::Replica(_)));
        assert_silent(&mut rx_b).await;
        assert_eq!(handle.snapshot_text().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_presence_sweep_retracts_stale_clients() {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            presence_timeout: Duration::from_millis(100),
            presence_sweep_interval: Duration::from_millis(30),
            ..test_config()
        };
        let (handle, _) = spawn_at(dir.path().join("main.tex"), config);
        let (a, mut rx_a) = attach(&handle).await;
        let (_b, mut rx_b) = attach(&handle).await;
        next_frame(&mut rx_a).await;
        next_frame(&mut rx_b).await;

        let update = encode_entries([(5, 1, Some(r#"{"cursor":0}"#))]);
        handle.deliver(a, protocol::encode_presence(&update)).await.unwrap();
        next_frame(&mut rx_b).await;

        // Both sessions receive the removal, the announcer included
        for rx in [&mut rx_a, &mut rx_b] {
            let Frame::Presence(removal) = next_frame(rx).await else {
                panic!("expected removal");
            };
            let mut peer = PresenceState::new();
            peer.apply_update(&update).unwrap();
            let change = peer.apply_update(&removal).unwrap();
            assert_eq!(change.removed, vec![5]);
        }
        assert_eq!(handle.diagnostics().await.unwrap().session_count, 2);
    }

    #[tokio::test]
    async fn test_failed_debounced_flush_rearmed_by_next_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        let (handle, _) = spawn_at(path.clone(), test_config());
        let (a, mut rx_a) = attach(&handle).await;
        let mut client = synced_client(&handle, a, &mut rx_a).await;

        std::fs::create_dir(&path).unwrap();
        let update = Bytes::from(client.splice(0, 0, "one").unwrap());
        handle
            .deliver(a, protocol::encode_content(&ContentMessage::Update(update)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.diagnostics().await.unwrap().last_persist_error.is_some());

        std::fs::remove_dir(&path).unwrap();
        let update = Bytes::from(client.splice(3, 0, " two").unwrap());
        handle
            .deliver(a, protocol::encode_content(&ContentMessage::Update(update)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one two");
        assert_eq!(handle.diagnostics().await.unwrap().last_persist_error, None);
    }

    #[tokio::test]
    async fn test_failed_final_flush_postpones_eviction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        let config = SyncConfig {
            flush_debounce: Duration::from_secs(60),
            ..test_config()
        };
        let (handle, documents) = spawn_at(path.clone(), config);
        let (a, mut rx_a) = attach(&handle).await;
        let mut client = synced_client(&handle, a, &mut rx_a).await;

        let update = Bytes::from(client.splice(0, 0, "unsaved").unwrap());
        handle
            .deliver(a, protocol::encode_content(&ContentMessage::Update(update)))
            .await
            .unwrap();
        std::fs::create_dir(&path).unwrap();
        handle.detach(a).await;

        // Several grace periods pass without the write succeeding
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(documents.len(), 1);
        assert!(!handle.is_closed());
        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.session_count, 0);
        assert!(diagnostics.last_persist_error.is_some());

        // Once the file is writable again the next attempt evicts
        std::fs::remove_dir(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(documents.is_empty());
        assert!(handle.is_closed());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "unsaved");
    }

    #[tokio::test]
    async fn test_flush_failure_recorded_then_cleared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        let (handle, _) = spawn_at(path.clone(), test_config());
        assert_eq!(handle.snapshot_text().await.unwrap(), "");

        // A directory in place of the file makes the write fail
        std::fs::create_dir(&path).unwrap();
        assert!(handle.flush_now().await.is_err());
        let diagnostics = handle.diagnostics().await.unwrap();
        assert!(diagnostics.last_persist_error.is_some());

        std::fs::remove_dir(&path).unwrap();
        handle.flush_now().await.unwrap();
        assert_eq!(handle.diagnostics().await.unwrap().last_persist_error, None);
    }

    #[tokio::test]
    async fn test_evicted_after_grace() {
        let dir = tempdir().unwrap();
        let (handle, documents) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, _rx) = attach(&handle).await;
        handle.detach(a).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(documents.is_empty());
        assert!(handle.is_closed());
        assert!(matches!(handle.diagnostics().await, Err(SyncError::DocumentClosed(_))));
    }

    #[tokio::test]
    async fn test_reattach_cancels_eviction() {
        let dir = tempdir().unwrap();
        let (handle, documents) = spawn_at(dir.path().join("main.tex"), test_config());
        let (a, _rx_a) = attach(&handle).await;
        handle.detach(a).await;
        let (_b, _rx_b) = attach(&handle).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(documents.len(), 1);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_unsaved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        let config = SyncConfig {
            flush_debounce: Duration::from_secs(60),
            ..test_config()
        };
        let (handle, documents) = spawn_at(path.clone(), config);
        let (a, mut rx_a) = attach(&handle).await;
        let mut client = synced_client(&handle, a, &mut rx_a).await;

        let update = Bytes::from(client.splice(0, 0, "draft").unwrap());
        handle
            .deliver(a, protocol::encode_content(&ContentMessage::Update(update)))
            .await
            .unwrap();

        handle.shutdown().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "draft");
        assert!(documents.is_empty());
    }
}
