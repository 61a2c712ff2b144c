//! Presence (awareness) state for real-time collaboration.
//!
//! Presence is ephemeral and never persisted. Each client announces an
//! opaque JSON state (cursor, identity) tagged with a logical clock:
//!
//! ```text
//! update := varuint count, count * (varuint client_id, varuint clock, varstring state_json)
//! ```
//!
//! A state of `null` is an explicit removal. Clocks of removed clients are
//! kept as tombstones so an older announcement cannot bring them back.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::protocol::{
    read_var_string, read_var_uint, write_var_string, write_var_uint, ProtocolError,
};
use super::ClientId;

/// Serialized removal marker
const NULL_STATE: &str = "null";

/// Per-client presence record
#[derive(Debug, Clone)]
struct PresenceEntry {
    clock: u64,
    /// `None` once the client has been removed
    state: Option<String>,
    last_updated: Instant,
}

/// Clients affected by one applied update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every affected client, in added/updated/removed order
    pub fn clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// One decoded update entry
#[derive(Debug, Clone, PartialEq, Eq)]
struct UpdateEntry {
    client_id: ClientId,
    clock: u64,
    state: Option<String>,
}

/// Presence map for a single shared document
#[derive(Debug, Default)]
pub struct PresenceState {
    entries: HashMap<ClientId, PresenceEntry>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an encoded update. The whole update is decoded before anything
    /// is applied, so a malformed update leaves the map untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<PresenceChange, ProtocolError> {
        let entries = decode_update(update)?;
        let now = Instant::now();
        let mut change = PresenceChange::default();

        for entry in entries {
            let current = self.entries.get(&entry.client_id);
            let current_clock = current.map(|e| e.clock).unwrap_or(0);
            let currently_live = current.map(|e| e.state.is_some()).unwrap_or(false);

            let newer = current_clock < entry.clock;
            let same_clock_removal =
                current_clock == entry.clock && entry.state.is_none() && currently_live;
            if !newer && !same_clock_removal {
                continue;
            }

            match (currently_live, entry.state.is_some()) {
                (false, true) => change.added.push(entry.client_id),
                (true, true) => change.updated.push(entry.client_id),
                (true, false) => change.removed.push(entry.client_id),
                // Removal of something already gone only advances the clock
                (false, false) => {}
            }

            self.entries.insert(
                entry.client_id,
                PresenceEntry {
                    clock: entry.clock,
                    state: entry.state,
                    last_updated: now,
                },
            );
        }

        Ok(change)
    }

    /// Retract the given clients, bumping their clocks so peers accept the
    /// removal. Returns the clients that were actually live.
    pub fn remove_states(&mut self, clients: impl IntoIterator<Item = ClientId>) -> Vec<ClientId> {
        let now = Instant::now();
        let mut removed = Vec::new();
        for client_id in clients {
            if let Some(entry) = self.entries.get_mut(&client_id) {
                if entry.state.take().is_some() {
                    entry.clock += 1;
                    entry.last_updated = now;
                    removed.push(client_id);
                }
            }
        }
        removed
    }

    /// Retract live clients that have not renewed their state within
    /// `timeout`. Tombstones older than `timeout` are forgotten.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<ClientId> {
        self.entries
            .retain(|_, e| e.state.is_some() || e.last_updated.elapsed() <= timeout);

        let stale: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some() && e.last_updated.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove_states(stale)
    }

    /// Encode the current state of the given clients as an update.
    /// Clients without a live state are encoded as removals.
    pub fn encode_update(&self, clients: &[ClientId]) -> Bytes {
        let known: Vec<(ClientId, &PresenceEntry)> = clients
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e)))
            .collect();

        let mut buf = BytesMut::new();
        write_var_uint(&mut buf, known.len() as u64);
        for (client_id, entry) in known {
            write_var_uint(&mut buf, client_id);
            write_var_uint(&mut buf, entry.clock);
            write_var_string(&mut buf, entry.state.as_deref().unwrap_or(NULL_STATE));
        }
        buf.freeze()
    }

    /// Encode every live client, used for the snapshot sent on attach
    pub fn encode_snapshot(&self) -> Bytes {
        self.encode_update(&self.live_clients())
    }

    pub fn live_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(id, _)| *id)
            .collect();
        clients.sort_unstable();
        clients
    }

    pub fn get_state(&self, client_id: ClientId) -> Option<&str> {
        self.entries.get(&client_id).and_then(|e| e.state.as_deref())
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    /// True when no client has a live state
    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }
}

/// Extract the client ids named in an update without applying it.
/// Malformed input yields an empty list.
pub fn decode_client_ids(update: &[u8]) -> Vec<ClientId> {
    decode_update(update)
        .map(|entries| entries.into_iter().map(|e| e.client_id).collect())
        .unwrap_or_default()
}

fn decode_update(update: &[u8]) -> Result<Vec<UpdateEntry>, ProtocolError> {
    let mut cursor = update;
    let count = read_var_uint(&mut cursor)?;
    // Each entry needs at least three bytes; reject absurd counts up front
    if count > (cursor.len() as u64) / 3 + 1 {
        return Err(ProtocolError::UnexpectedEof);
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let client_id = read_var_uint(&mut cursor)?;
        let clock = read_var_uint(&mut cursor)?;
        let state = read_var_string(&mut cursor)?;
        entries.push(UpdateEntry {
            client_id,
            clock,
            state: (state != NULL_STATE).then(|| state.to_string()),
        });
    }
    Ok(entries)
}

/// Build an update from raw entries. Used by clients and tests.
pub fn encode_entries<'a>(entries: impl IntoIterator<Item = (ClientId, u64, Option<&'a str>)>) -> Bytes {
    let entries: Vec<_> = entries.into_iter().collect();
    let mut buf = BytesMut::new();
    write_var_uint(&mut buf, entries.len() as u64);
    for (client_id, clock, state) in entries {
        write_var_uint(&mut buf, client_id);
        write_var_uint(&mut buf, clock);
        write_var_string(&mut buf, state.unwrap_or(NULL_STATE));
    }
    buf.freeze()
}
