//! Send API and per-invocation context handed to handlers and hooks.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::connection::{ConnState, Connection};
use super::{ConnectionId, HubShared};
use crate::error::{HandlerError, HubError, Result};
use crate::protocol::{HubMessage, Invocation};

/// Which connections a push goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    Group(String),
    GroupExcept(String, Vec<ConnectionId>),
    All,
    AllExcept(Vec<ConnectionId>),
}

/// Pushes invocations to connected clients.
///
/// Cheap to clone. Every push is encoded once and the same bytes are queued
/// on each recipient.
#[derive(Clone)]
pub struct Clients {
    shared: Arc<HubShared>,
}

impl Clients {
    pub(crate) fn new(shared: Arc<HubShared>) -> Self {
        Self { shared }
    }

    /// Invoke `method` on every connection selected by `target`.
    ///
    /// Returns the number of connections the message was queued for. A
    /// [`Target::Connection`] that does not exist is an error; empty groups
    /// are not. A single connection is given up to `send_timeout` to make
    /// room; group and broadcast pushes never wait.
    pub async fn send(&self, target: Target, method: &str, args: Vec<Value>) -> Result<usize> {
        let frame = self
            .shared
            .codec
            .encode(&HubMessage::Invocation(Invocation::new(method, args)))?;

        match target {
            Target::Connection(id) => {
                let conn = self.shared.registry.lookup(id)?;
                self.deliver(&conn, frame).await?;
                Ok(1)
            }
            Target::Group(group) => {
                let recipients = self.shared.registry.group_recipients(&group);
                Ok(self.fan_out(recipients, &[], frame, &group))
            }
            Target::GroupExcept(group, excluded) => {
                let recipients = self.shared.registry.group_recipients(&group);
                Ok(self.fan_out(recipients, &excluded, frame, &group))
            }
            Target::All => {
                let recipients = self.shared.registry.connections();
                Ok(self.fan_out(recipients, &[], frame, "all"))
            }
            Target::AllExcept(excluded) => {
                let recipients = self.shared.registry.connections();
                Ok(self.fan_out(recipients, &excluded, frame, "all"))
            }
        }
    }

    pub async fn connection(&self, id: ConnectionId, method: &str, args: Vec<Value>) -> Result<()> {
        self.send(Target::Connection(id), method, args).await.map(|_| ())
    }

    pub async fn group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<usize> {
        self.send(Target::Group(group.to_string()), method, args).await
    }

    pub async fn all(&self, method: &str, args: Vec<Value>) -> Result<usize> {
        self.send(Target::All, method, args).await
    }

    /// Queue an already built message on one connection.
    pub(crate) async fn send_message(&self, id: ConnectionId, msg: &HubMessage) -> Result<()> {
        let frame = self.shared.codec.encode(msg)?;
        let conn = self.shared.registry.lookup(id)?;
        self.deliver(&conn, frame).await
    }

    /// Ask a connection to close. Does not wait for teardown.
    ///
    /// The client gets a close message carrying `reason`, and nothing
    /// further is dispatched for it. A client still in its handshake is
    /// dropped without a close message.
    pub fn close(&self, id: ConnectionId, reason: Option<String>) -> Result<()> {
        let conn = self.shared.registry.lookup(id)?;
        if conn.state() == ConnState::Connected {
            let frame = self.shared.codec.encode(&HubMessage::Close { error: reason })?;
            if !conn.try_enqueue(frame) {
                debug!(conn_id = %id, "Close message dropped, send queue full");
            }
            let _ = conn.advance(ConnState::Disconnecting);
        }
        conn.cancel_token().cancel();
        Ok(())
    }

    async fn deliver(&self, conn: &Connection, frame: Bytes) -> Result<()> {
        match conn.send(frame, self.shared.config.send_timeout).await {
            Err(HubError::SlowConsumer(id)) => {
                warn!(conn_id = %id, "Closing slow consumer");
                conn.cancel_token().cancel();
                Err(HubError::SlowConsumer(id))
            }
            other => other,
        }
    }

    /// Queue `frame` on every recipient without waiting on any of them.
    ///
    /// A recipient whose queue is full is closed as a slow consumer.
    fn fan_out(
        &self,
        recipients: Vec<Arc<Connection>>,
        excluded: &[ConnectionId],
        frame: Bytes,
        label: &str,
    ) -> usize {
        let mut delivered = 0;
        for conn in recipients {
            if excluded.contains(&conn.id()) || !conn.is_connected() {
                continue;
            }
            match conn.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(HubError::SlowConsumer(id)) => {
                    warn!(conn_id = %id, label, "Closing slow consumer");
                    conn.cancel_token().cancel();
                }
                Err(e) => debug!(conn_id = %conn.id(), label, error = %e, "Skipped recipient"),
            }
        }
        trace!(label, delivered, "Fan-out complete");
        delivered
    }
}

/// What a handler or lifecycle hook knows about its connection.
#[derive(Clone)]
pub struct HubContext {
    caller: ConnectionId,
    clients: Clients,
}

impl HubContext {
    pub(crate) fn new(caller: ConnectionId, clients: Clients) -> Self {
        Self { caller, clients }
    }

    /// Id of the connection this context belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.caller
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// The caller's connection record.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.clients.shared.registry.lookup(self.caller)
    }

    pub async fn send_to_caller(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.clients.connection(self.caller, method, args).await
    }

    pub async fn send_to_connection(
        &self,
        id: ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        self.clients.connection(id, method, args).await
    }

    pub async fn send_to_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<usize> {
        self.clients.group(group, method, args).await
    }

    /// Every member of `group` except the caller.
    pub async fn send_to_others_in_group(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<usize> {
        let target = Target::GroupExcept(group.to_string(), vec![self.caller]);
        self.clients.send(target, method, args).await
    }

    pub async fn send_to_all(&self, method: &str, args: Vec<Value>) -> Result<usize> {
        self.clients.all(method, args).await
    }

    /// Every connection except the caller.
    pub async fn send_to_others(&self, method: &str, args: Vec<Value>) -> Result<usize> {
        self.clients
            .send(Target::AllExcept(vec![self.caller]), method, args)
            .await
    }

    pub fn join_group(&self, group: &str) -> Result<()> {
        self.clients.shared.registry.join_group(self.caller, group)
    }

    pub fn leave_group(&self, group: &str) -> Result<bool> {
        self.clients.shared.registry.leave_group(self.caller, group)
    }

    /// Groups the caller currently belongs to, sorted.
    pub fn groups(&self) -> Result<Vec<String>> {
        let mut groups: Vec<String> = self
            .clients
            .shared
            .registry
            .groups_of(self.caller)?
            .into_iter()
            .collect();
        groups.sort();
        Ok(groups)
    }

    /// Close the caller's connection once the current invocation returns.
    pub fn close(&self, reason: Option<String>) -> Result<()> {
        self.clients.close(self.caller, reason)
    }

    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
        let value = args.get(index).ok_or_else(|| {
            HandlerError::InvalidArguments(format!(
                "expected at least {} argument(s), got {}",
                index + 1,
                args.len()
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            HandlerError::InvalidArguments(format!("argument {index}: {e}"))
        })
    }
}
