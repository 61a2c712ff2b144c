//! Replicated text content backed by an Automerge document.
//!
//! The session engine only relies on the [`Replica`] contract: idempotent
//! application of remote operations, a compact state vector, the set of
//! operations a peer is missing, and the full text. How concurrent edits
//! are merged is entirely Automerge's business.
//!
//! Encodings used on the wire:
//! - state vector: varuint count followed by the 32-byte change hashes of
//!   the document heads
//! - operations: concatenated Automerge change chunks, as produced by
//!   `save_after` and accepted by `load_incremental`

use automerge::{
    transaction::{CommitOptions, Transactable},
    ActorId, AutoCommit, Automerge, ChangeHash, LoadOptions, ObjId, ObjType, OnPartialLoad, ReadDoc, Value,
    ROOT,
};
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::protocol::{read_var_uint, write_var_uint};

/// Root key of the shared text object
pub const CONTENT_KEY: &str = "content";

/// Every Automerge chunk starts with these magic bytes
const CHUNK_MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];

const HASH_LEN: usize = 32;

/// Errors that can occur while applying or reading replica state
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Document has no text content")]
    MissingContent,
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Capabilities the sync engine needs from a replicated text structure
pub trait Replica: Send {
    /// Apply operations received from a peer. Returns the operations that
    /// were new to this replica, or `None` if nothing changed.
    fn apply_remote_operation(&mut self, update: &[u8]) -> ReplicaResult<Option<Vec<u8>>>;

    /// Compact summary of everything this replica has incorporated
    fn state_vector(&mut self) -> Vec<u8>;

    /// Operations a peer with the given state vector has not seen yet
    fn missing_operations(&mut self, peer_state_vector: &[u8]) -> ReplicaResult<Vec<u8>>;

    /// Current text
    fn serialize_full(&mut self) -> ReplicaResult<String>;

    /// Insert `text` as the initial operation if the replica is still empty.
    /// Returns false when the replica already had content and `text` was
    /// discarded.
    fn seed(&mut self, text: &str) -> ReplicaResult<bool>;
}

/// Automerge-backed text replica
pub struct TextReplica {
    /// The underlying Automerge document
    doc: AutoCommit,
    /// Seeding identity; the document key this replica belongs to
    key: String,
}

impl TextReplica {
    /// Create a replica with no operations
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            doc: AutoCommit::new(),
            key: key.into(),
        }
    }

    /// Whether any operation has been applied yet
    pub fn is_empty(&mut self) -> bool {
        self.doc.get_heads().is_empty()
    }

    /// Apply a local edit and return the resulting update. Clients use this
    /// to produce operations; the server never edits on its own.
    pub fn splice(&mut self, pos: usize, delete: usize, insert: &str) -> ReplicaResult<Vec<u8>> {
        let text = self.text_obj()?.ok_or(ReplicaError::MissingContent)?;
        let before = self.doc.get_heads();
        self.doc.splice_text(&text, pos, delete as isize, insert)?;
        self.doc.commit();
        Ok(self.doc.save_after(&before))
    }

    fn text_obj(&self) -> ReplicaResult<Option<ObjId>> {
        Ok(match self.doc.get(ROOT, CONTENT_KEY)? {
            Some((Value::Object(ObjType::Text), id)) => Some(id),
            _ => None,
        })
    }

    /// Seed actor: the same key and text always yield the same actor, so a
    /// reseeded replica produces a byte-identical first change.
    fn seed_actor(&self, text: &str) -> ActorId {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        ActorId::from(&digest[..16])
    }
}

impl Replica for TextReplica {
    fn apply_remote_operation(&mut self, update: &[u8]) -> ReplicaResult<Option<Vec<u8>>> {
        if update.is_empty() {
            return Ok(None);
        }
        if !update.starts_with(&CHUNK_MAGIC) {
            return Err(ReplicaError::MalformedUpdate(
                "missing chunk header".to_string(),
            ));
        }

        check_chunks(update)?;

        let before = self.doc.get_heads();
        self.doc.load_incremental(update)?;
        let after = self.doc.get_heads();

        if before == after {
            return Ok(None);
        }
        // Changes queued on missing dependencies only appear here once they
        // actually apply, so the delta is computed from the heads rather
        // than echoed from the input.
        Ok(Some(self.doc.save_after(&before)))
    }

    fn state_vector(&mut self) -> Vec<u8> {
        let heads = self.doc.get_heads();
        encode_state_vector(&heads)
    }

    fn missing_operations(&mut self, peer_state_vector: &[u8]) -> ReplicaResult<Vec<u8>> {
        let peer_heads = decode_state_vector(peer_state_vector)?;
        // Heads we have never seen cannot bound the delta; the peer simply
        // receives a superset of what it lacks.
        let known: Vec<ChangeHash> = peer_heads
            .into_iter()
            .filter(|hash| self.doc.get_change_by_hash(hash).is_some())
            .collect();
        Ok(self.doc.save_after(&known))
    }

    fn serialize_full(&mut self) -> ReplicaResult<String> {
        match self.text_obj()? {
            Some(text) => Ok(self.doc.text(&text)?),
            None => Ok(String::new()),
        }
    }

    fn seed(&mut self, text: &str) -> ReplicaResult<bool> {
        if !self.is_empty() {
            return Ok(false);
        }

        let mut doc = AutoCommit::new().with_actor(self.seed_actor(text));
        let content = doc.put_object(ROOT, CONTENT_KEY, ObjType::Text)?;
        if !text.is_empty() {
            doc.splice_text(&content, 0, 0, text)?;
        }
        doc.commit_with(CommitOptions::default().with_time(0));

        self.doc = doc;
        Ok(true)
    }
}

/// Parse every chunk of `update` into a scratch document. `load_incremental`
/// on a non-empty document skips chunks it cannot decode, so corrupt input
/// has to be caught before merging.
fn check_chunks(update: &[u8]) -> ReplicaResult<()> {
    let options = LoadOptions::new().on_partial_load(OnPartialLoad::Error);
    Automerge::load_with_options(update, options)
        .map(|_| ())
        .map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))
}

pub fn encode_state_vector(heads: &[ChangeHash]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(1 + heads.len() * HASH_LEN);
    write_var_uint(&mut buf, heads.len() as u64);
    for head in heads {
        buf.extend_from_slice(&head.0);
    }
    buf.to_vec()
}

pub fn decode_state_vector(data: &[u8]) -> ReplicaResult<Vec<ChangeHash>> {
    let mut cursor = data;
    let count = read_var_uint(&mut cursor)
        .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;

    let expected = (count as usize).checked_mul(HASH_LEN);
    if expected != Some(cursor.len()) {
        return Err(ReplicaError::MalformedStateVector(format!(
            "{} heads need {} bytes, got {}",
            count,
            count.saturating_mul(HASH_LEN as u64),
            cursor.len()
        )));
    }

    cursor
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            Ok(ChangeHash(hash))
        })
        .collect()
}
