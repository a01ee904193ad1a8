// Router state — sessions, group membership and the transfer buffer
//
// Every session is an entity keyed by its session id. Lookups by client id
// and by group go through secondary indexes that are kept in step with the
// session table under their own locks; lock order is sessions, clients,
// groups, transfers.

use crate::command::CommandError;
use crate::config::Limits;
use crate::crypto::CipherChain;
use crate::entity::{
    ClientComponent, Entity, GroupComponent, MailboxComponent, SessionComponent, TimerComponent,
};
use crate::message::Data;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bytes the router holds for uploads across all sessions
pub const MAX_TRANSFER_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
struct TransferBuffer {
    chunks: HashMap<(String, u64), Vec<u8>>,
    /// transfer id -> owning session id
    owners: HashMap<String, String>,
    bytes: usize,
}

impl TransferBuffer {
    /// Buffer size after storing `chunks` for `owner`, or why they cannot
    /// be stored. A later chunk with the same key replaces an earlier one.
    fn admit(
        &self,
        owner: &str,
        chunks: &[(&str, u64, usize)],
    ) -> Result<usize, CommandError> {
        let mut sizes: HashMap<(&str, u64), usize> = HashMap::new();
        for &(transfer_id, chunk_id, len) in chunks {
            match self.owners.get(transfer_id) {
                Some(existing) if existing.as_str() != owner => {
                    return Err(CommandError::Validation(format!(
                        "transfer {} belongs to another session",
                        transfer_id
                    )));
                }
                _ => {}
            }
            sizes.insert((transfer_id, chunk_id), len);
        }

        let mut bytes = self.bytes;
        for ((transfer_id, chunk_id), len) in sizes {
            let replaced = self
                .chunks
                .get(&(transfer_id.to_string(), chunk_id))
                .map(Vec::len)
                .unwrap_or(0);
            bytes = bytes - replaced + len;
        }
        if bytes > MAX_TRANSFER_BYTES {
            return Err(CommandError::Validation("transfer buffer full".into()));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    rejected: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_evicted: AtomicU64,
}

/// Point-in-time router statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub requests: u64,
    pub rejected: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_evicted: u64,
    pub active_sessions: u64,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub struct RouterState {
    chain: Arc<CipherChain>,
    limits: Limits,
    sessions: RwLock<HashMap<String, Arc<Entity>>>,
    /// client id -> newest session id
    clients: RwLock<HashMap<String, String>>,
    /// group id -> session ids
    groups: RwLock<HashMap<String, HashSet<String>>>,
    transfers: Mutex<TransferBuffer>,
    counters: Counters,
}

impl RouterState {
    pub fn new(chain: Arc<CipherChain>, limits: Limits) -> Self {
        Self {
            chain,
            limits,
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            transfers: Mutex::new(TransferBuffer::default()),
            counters: Counters::default(),
        }
    }

    pub fn chain(&self) -> &Arc<CipherChain> {
        &self.chain
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Create a session entity for a client. Returns the new session id.
    pub fn open_session(&self, client_id: &str, name: &str) -> (String, Arc<Entity>) {
        let session_id = Uuid::new_v4().simple().to_string();

        let entity = Entity::new();
        entity.add(ClientComponent::new(client_id, name));
        entity.add(SessionComponent::with_id(self.chain.clone(), session_id.clone()));
        entity.add(TimerComponent::default());
        entity.add(MailboxComponent::default());

        self.sessions
            .write()
            .insert(session_id.clone(), entity.clone());
        self.clients
            .write()
            .insert(client_id.to_string(), session_id.clone());

        self.counters.sessions_opened.fetch_add(1, Ordering::Relaxed);
        info!("Opened session {} for client {}", session_id, client_id);
        (session_id, entity)
    }

    /// Resumable session: it exists and belongs to `client_id`.
    pub fn resume(&self, session_id: &str, client_id: &str) -> Option<Arc<Entity>> {
        if session_id.is_empty() {
            return None;
        }
        let entity = self.session(session_id)?;
        let owner = entity.get::<ClientComponent>()?;
        if owner.client_id != client_id {
            warn!("Client {} tried to resume session {} it does not own", client_id, session_id);
            return None;
        }
        self.clients
            .write()
            .insert(client_id.to_string(), session_id.to_string());
        Some(entity)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Entity>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn session_for_client(&self, client_id: &str) -> Option<(String, Arc<Entity>)> {
        let session_id = self.clients.read().get(client_id).cloned()?;
        let entity = self.session(&session_id)?;
        Some((session_id, entity))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop a session and everything indexed under it.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some(entity) = self.sessions.write().remove(session_id) else {
            return false;
        };

        if let Some(client) = entity.get::<ClientComponent>() {
            let mut clients = self.clients.write();
            if clients.get(&client.client_id).map(String::as_str) == Some(session_id) {
                clients.remove(&client.client_id);
            }
        }
        if let Some(group_id) = entity.get::<GroupComponent>().and_then(|g| g.id()) {
            self.leave_group(&group_id, session_id);
        }
        self.drop_transfers(session_id);
        if let Some(timer) = entity.get::<TimerComponent>() {
            timer.stop();
        }

        self.counters.sessions_closed.fetch_add(1, Ordering::Relaxed);
        debug!("Closed session {}", session_id);
        true
    }

    /// Close every session idle for longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, entity)| {
                entity
                    .get::<TimerComponent>()
                    .map(|timer| timer.expired(timeout))
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for session_id in idle {
            if self.close_session(&session_id) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.counters
                .sessions_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!("Evicted {} idle sessions", evicted);
        }
        evicted
    }

    // ========================================================================
    // GROUPS
    // ========================================================================

    /// Move a session into `group_id`. Returns the group's member count.
    pub fn join_group(&self, session_id: &str, entity: &Entity, group_id: &str) -> usize {
        let group = entity.add(GroupComponent::default());
        if let Some(previous) = group.id() {
            if previous != group_id {
                self.leave_group(&previous, session_id);
            }
        }
        group.set_id(group_id);

        let mut groups = self.groups.write();
        let members = groups.entry(group_id.to_string()).or_default();
        members.insert(session_id.to_string());
        members.len()
    }

    fn leave_group(&self, group_id: &str, session_id: &str) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(group_id) {
            members.remove(session_id);
            if members.is_empty() {
                groups.remove(group_id);
            }
        }
    }

    /// Sessions in `group_id`, excluding `except`.
    pub fn group_members(&self, group_id: &str, except: &str) -> Vec<(String, Arc<Entity>)> {
        let ids: Vec<String> = self
            .groups
            .read()
            .get(group_id)
            .map(|members| members.iter().filter(|id| *id != except).cloned().collect())
            .unwrap_or_default();

        let sessions = self.sessions.read();
        ids.into_iter()
            .filter_map(|id| sessions.get(&id).cloned().map(|entity| (id, entity)))
            .collect()
    }

    // ========================================================================
    // DELIVERIES
    // ========================================================================

    /// Queue a delivery for one session. False when the target is gone or
    /// its mailbox is full.
    pub fn deliver(&self, entity: &Entity, data: Data) -> bool {
        let Some(mailbox) = entity.get::<MailboxComponent>() else {
            return false;
        };
        if !mailbox.push(data) {
            warn!("Mailbox full, dropping delivery");
            return false;
        }
        true
    }

    // ========================================================================
    // TRANSFERS
    // ========================================================================

    /// Whether `owner` may store every chunk of `(transfer_id, chunk_id, len)`.
    /// Changes nothing.
    pub fn can_store(
        &self,
        owner: &str,
        chunks: &[(&str, u64, usize)],
    ) -> Result<(), CommandError> {
        self.transfers.lock().admit(owner, chunks).map(|_| ())
    }

    pub fn store_chunk(
        &self,
        owner: &str,
        transfer_id: &str,
        chunk_id: u64,
        data: Vec<u8>,
    ) -> Result<(), CommandError> {
        self.store_chunks(owner, vec![(transfer_id.to_string(), chunk_id, data)])
    }

    /// Store all of `chunks` or none of them.
    pub fn store_chunks(
        &self,
        owner: &str,
        chunks: Vec<(String, u64, Vec<u8>)>,
    ) -> Result<(), CommandError> {
        let mut transfers = self.transfers.lock();
        let sizes: Vec<(&str, u64, usize)> = chunks
            .iter()
            .map(|(transfer_id, chunk_id, data)| (transfer_id.as_str(), *chunk_id, data.len()))
            .collect();
        let bytes = transfers.admit(owner, &sizes)?;

        transfers.bytes = bytes;
        for (transfer_id, chunk_id, data) in chunks {
            transfers
                .owners
                .entry(transfer_id.clone())
                .or_insert_with(|| owner.to_string());
            transfers.chunks.insert((transfer_id, chunk_id), data);
        }
        Ok(())
    }

    pub fn fetch_chunk(&self, transfer_id: &str, chunk_id: u64) -> Option<Vec<u8>> {
        self.transfers
            .lock()
            .chunks
            .get(&(transfer_id.to_string(), chunk_id))
            .cloned()
    }

    pub fn has_chunk(&self, transfer_id: &str, chunk_id: u64) -> bool {
        self.transfers
            .lock()
            .chunks
            .contains_key(&(transfer_id.to_string(), chunk_id))
    }

    pub fn transfer_bytes(&self) -> usize {
        self.transfers.lock().bytes
    }

    fn drop_transfers(&self, owner: &str) {
        let mut transfers = self.transfers.lock();
        let owned: HashSet<String> = transfers
            .owners
            .iter()
            .filter(|(_, session_id)| session_id.as_str() == owner)
            .map(|(transfer_id, _)| transfer_id.clone())
            .collect();
        if owned.is_empty() {
            return;
        }

        let mut freed = 0;
        transfers.chunks.retain(|(transfer_id, _), data| {
            if owned.contains(transfer_id) {
                freed += data.len();
                false
            } else {
                true
            }
        });
        transfers.owners.retain(|transfer_id, _| !owned.contains(transfer_id));
        transfers.bytes -= freed;
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub(crate) fn record_request(&self) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Session and request counters. Connection and byte counters are
    /// filled in by the router.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            sessions_opened: self.counters.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.counters.sessions_closed.load(Ordering::Relaxed),
            sessions_evicted: self.counters.sessions_evicted.load(Ordering::Relaxed),
            active_sessions: self.session_count() as u64,
            ..Default::default()
        }
    }
}
