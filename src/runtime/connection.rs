//! Connection state machine and the registry of live connections.
//!
//! The registry owns every connection's outbound handle and all group
//! membership. Group membership is kept as two maps (group -> ids and
//! id -> groups) that are only ever touched under the registry lock, so
//! a fan-out snapshot never observes half of a join or leave.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{HubError, Result};
use crate::runtime::token::{ConnectionId, IdArena};

/// Lifecycle state of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, handshake not finished.
    Connecting = 0,
    /// Handshake done, frames are dispatched.
    Connected = 1,
    /// Close requested, cleanup running.
    Disconnecting = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Closed,
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    /// Feeds the connection's writer task.
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    /// Cancelled once the connection has been fully torn down.
    finished: CancellationToken,
    transport_failed: AtomicBool,
    peer: Option<String>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    fn new(id: ConnectionId, outbound: mpsc::Sender<Bytes>, peer: Option<String>) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnState::Connecting as u8),
            outbound,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            transport_failed: AtomicBool::new(false),
            peer,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Remote address reported by the transport, if any.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Move to `next`, which must be strictly later than the current state.
    ///
    /// Returns the state that was replaced.
    pub fn advance(&self, next: ConnState) -> Result<ConnState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnState::from_u8(current) >= next {
                return Err(HubError::InvalidState(format!(
                    "connection {} cannot move from {:?} to {:?}",
                    self.id,
                    ConnState::from_u8(current),
                    next
                )));
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(conn_id = %self.id, from = ?ConnState::from_u8(current), to = ?next, "State change");
                    return Ok(ConnState::from_u8(current));
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn finished_token(&self) -> &CancellationToken {
        &self.finished
    }

    /// Record that the transport broke, then stop the connection's tasks.
    pub(crate) fn fail_transport(&self) {
        self.transport_failed.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn transport_failed(&self) -> bool {
        self.transport_failed.load(Ordering::Acquire)
    }

    /// Queue a frame for a connected client.
    ///
    /// Waits up to `timeout` for queue space; a client that stays full
    /// for that long is reported as a slow consumer.
    pub async fn send(&self, frame: Bytes, timeout: Duration) -> Result<()> {
        if !self.is_connected() {
            return Err(HubError::InvalidState(format!(
                "connection {} is {:?}",
                self.id,
                self.state()
            )));
        }
        self.enqueue(frame, timeout).await
    }

    /// Queue a frame regardless of state. Used for handshake and close frames.
    pub(crate) async fn enqueue(&self, frame: Bytes, timeout: Duration) -> Result<()> {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(HubError::InvalidState(format!(
                    "connection {} is closing",
                    self.id
                )));
            }
            sent = tokio::time::timeout(timeout, self.outbound.send(frame)) => sent,
        };
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(HubError::InvalidState(format!(
                "connection {} writer has stopped",
                self.id
            ))),
            Err(_) => Err(HubError::SlowConsumer(self.id)),
        }
    }

    /// Queue a frame for a connected client without waiting.
    ///
    /// A full queue is reported as a slow consumer.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() || self.cancel.is_cancelled() {
            return Err(HubError::InvalidState(format!(
                "connection {} is {:?}",
                self.id,
                self.state()
            )));
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(HubError::SlowConsumer(self.id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::InvalidState(format!(
                "connection {} writer has stopped",
                self.id
            ))),
        }
    }

    /// Queue a frame only if there is room right now.
    pub(crate) fn try_enqueue(&self, frame: Bytes) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}

struct RegistryInner {
    connections: IdArena<Arc<Connection>>,
    groups: HashMap<String, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

/// Registry of live connections and their groups.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry that admits at most `max_connections` connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                connections: IdArena::with_capacity(max_connections.min(1024)),
                groups: HashMap::new(),
                memberships: HashMap::new(),
            }),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection in the `Connecting` state.
    pub fn register(
        &self,
        outbound: mpsc::Sender<Bytes>,
        peer: Option<String>,
    ) -> Result<Arc<Connection>> {
        let mut inner = self.lock();
        if inner.connections.len() >= self.max_connections {
            return Err(HubError::CapacityExceeded(self.max_connections));
        }
        let id = inner
            .connections
            .insert_with(|id| Arc::new(Connection::new(id, outbound, peer)));
        let conn = inner
            .connections
            .get(id)
            .cloned()
            .ok_or(HubError::ConnectionNotFound(id))?;
        debug!(conn_id = %id, active = inner.connections.len(), "Connection registered");
        Ok(conn)
    }

    /// Remove a connection, drop it from every group and mark it `Closed`.
    pub fn unregister(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let conn = inner
            .connections
            .remove(id)
            .ok_or(HubError::ConnectionNotFound(id))?;

        if let Some(groups) = inner.memberships.remove(&id) {
            for group in groups {
                if let Some(members) = inner.groups.get_mut(&group) {
                    members.remove(&id);
                    if members.is_empty() {
                        inner.groups.remove(&group);
                    }
                }
            }
        }
        drop(guard);

        let _ = conn.advance(ConnState::Closed);
        conn.cancel.cancel();
        debug!(conn_id = %id, "Connection unregistered");
        Ok(conn)
    }

    /// Find a live connection.
    pub fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        let inner = self.lock();
        match inner.connections.get(id) {
            Some(conn) if conn.state() != ConnState::Closed => Ok(Arc::clone(conn)),
            _ => Err(HubError::ConnectionNotFound(id)),
        }
    }

    /// Add a connection to a group. Idempotent.
    pub fn join_group(&self, id: ConnectionId, group: &str) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let state = inner
            .connections
            .get(id)
            .ok_or(HubError::ConnectionNotFound(id))?
            .state();
        if state >= ConnState::Disconnecting {
            return Err(HubError::InvalidState(format!(
                "connection {id} is {state:?} and cannot join '{group}'"
            )));
        }

        inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(id);
        inner
            .memberships
            .entry(id)
            .or_default()
            .insert(group.to_string());
        trace!(conn_id = %id, group, "Joined group");
        Ok(())
    }

    /// Remove a connection from a group. Returns whether it was a member.
    pub fn leave_group(&self, id: ConnectionId, group: &str) -> Result<bool> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.connections.get(id).is_none() {
            return Err(HubError::ConnectionNotFound(id));
        }

        let was_member = inner
            .memberships
            .get_mut(&id)
            .is_some_and(|groups| groups.remove(group));
        if inner.memberships.get(&id).is_some_and(HashSet::is_empty) {
            inner.memberships.remove(&id);
        }
        if let Some(members) = inner.groups.get_mut(group) {
            members.remove(&id);
            if members.is_empty() {
                inner.groups.remove(group);
            }
        }
        trace!(conn_id = %id, group, was_member, "Left group");
        Ok(was_member)
    }

    /// Ids of every member of `group`. Empty for unknown groups.
    pub fn members_of(&self, group: &str) -> HashSet<ConnectionId> {
        self.lock().groups.get(group).cloned().unwrap_or_default()
    }

    /// Groups a connection belongs to.
    pub fn groups_of(&self, id: ConnectionId) -> Result<HashSet<String>> {
        let inner = self.lock();
        if inner.connections.get(id).is_none() {
            return Err(HubError::ConnectionNotFound(id));
        }
        Ok(inner.memberships.get(&id).cloned().unwrap_or_default())
    }

    /// Snapshot of the connections in `group`, taken under one lock.
    pub fn group_recipients(&self, group: &str) -> Vec<Arc<Connection>> {
        let inner = self.lock();
        match inner.groups.get(group) {
            Some(members) => members
                .iter()
                .filter_map(|id| inner.connections.get(*id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock()
            .connections
            .iter()
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
