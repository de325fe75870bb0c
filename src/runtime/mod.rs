//! Hub runtime.
//!
//! One tokio task reads each connection and one writes it:
//! - `pump`: handshake, read loop, keep-alive writer, teardown
//! - `dispatch`: method table, handler isolation, completions
//! - `context`: send API and the context handed to handlers
//! - `connection`: connection state machine and the registry
//! - `token`: generational connection ids over a slab arena

mod connection;
mod context;
mod dispatch;
mod pump;
mod token;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use context::{Clients, HubContext, Target};
pub use dispatch::{Dispatcher, Handler, HandlerFuture};
pub use token::ConnectionId;

use crate::error::{HandlerError, Result};
use crate::protocol::{Codec, HubMessage, DEFAULT_MAX_ARGUMENTS, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::Transport;

/// Sent when the hub closes every connection.
const SHUTDOWN_REASON: &str = "Server is shutting down.";

/// Runtime limits and timers.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_arguments: usize,
    /// Frames buffered per connection before senders wait.
    pub send_buffer: usize,
    /// How long a send may wait for buffer space before the connection
    /// is treated as a slow consumer.
    pub send_timeout: Duration,
    pub keepalive_interval: Duration,
    pub client_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Report handler failure reasons to clients.
    pub detailed_errors: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_arguments: DEFAULT_MAX_ARGUMENTS,
            send_buffer: 256,
            send_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            client_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            detailed_errors: false,
        }
    }
}

/// State shared by the runtime, the send API and the dispatcher.
pub(crate) struct HubShared {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) codec: Codec,
    pub(crate) config: HubConfig,
}

/// Future returned by a lifecycle hook.
pub type HookFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Connect/disconnect callback.
pub type LifecycleHook = Arc<dyn Fn(HubContext) -> HookFuture + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_connect: Option<LifecycleHook>,
    pub(crate) on_disconnect: Option<LifecycleHook>,
}

/// Collects methods and hooks before any traffic flows.
pub struct HubBuilder {
    config: HubConfig,
    handlers: Vec<(String, Arc<dyn Handler>)>,
    hooks: Hooks,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    /// Register a hub method. Names are case-insensitive and must be unique.
    pub fn handler<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.handlers.push((name.to_string(), handler));
        self
    }

    /// Run `hook` after a connection completes its handshake.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: LifecycleHook =
            Arc::new(move |ctx: HubContext| -> HookFuture { Box::pin(hook(ctx)) });
        self.hooks.on_connect = Some(hook);
        self
    }

    /// Run `hook` while a connection is torn down, before it leaves its groups.
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HubContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: LifecycleHook =
            Arc::new(move |ctx: HubContext| -> HookFuture { Box::pin(hook(ctx)) });
        self.hooks.on_disconnect = Some(hook);
        self
    }

    pub fn build(self) -> Result<Arc<Hub>> {
        let codec = Codec::new(self.config.max_message_size, self.config.max_arguments);
        let ping_frame = codec.encode(&HubMessage::Ping)?;
        let detailed_errors = self.config.detailed_errors;
        let shared = Arc::new(HubShared {
            registry: ConnectionRegistry::new(self.config.max_connections),
            codec,
            config: self.config,
        });
        let dispatcher = Dispatcher::new(
            self.handlers,
            Clients::new(Arc::clone(&shared)),
            detailed_errors,
        )?;
        debug!(methods = ?dispatcher.methods(), "Hub built");

        Ok(Arc::new(Hub {
            shared,
            dispatcher,
            hooks: self.hooks,
            ping_frame,
        }))
    }
}

/// The hub: accepts transports and runs their connections.
pub struct Hub {
    shared: Arc<HubShared>,
    dispatcher: Dispatcher,
    hooks: Hooks,
    ping_frame: Bytes,
}

impl Hub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    /// Start serving a new transport.
    ///
    /// Registers the connection and spawns its reader and writer tasks. The
    /// handshake happens on the reader task, so this returns immediately.
    pub fn on_connection_opened<T: Transport>(
        self: &Arc<Self>,
        transport: T,
    ) -> Result<ConnectionId> {
        let (tx, rx) = mpsc::channel(self.shared.config.send_buffer);
        let conn = self.shared.registry.register(tx, transport.peer())?;
        let id = conn.id();
        debug!(conn_id = %id, peer = ?conn.peer(), "Connection opened");

        let (reader, writer) = transport.split();
        let writer_task = tokio::spawn(pump::write_loop(
            Arc::clone(&conn),
            writer,
            rx,
            self.ping_frame.clone(),
            self.shared.config.keepalive_interval,
            self.shared.config.send_timeout,
        ));
        tokio::spawn(pump::read_loop(Arc::clone(self), conn, reader, writer_task));
        Ok(id)
    }

    /// Close a connection from the server side and wait for its teardown.
    pub async fn on_connection_closed(&self, id: ConnectionId) -> Result<()> {
        let conn = self.shared.registry.lookup(id)?;
        let _ = conn.advance(ConnState::Disconnecting);
        conn.cancel_token().cancel();
        conn.finished_token().cancelled().await;
        Ok(())
    }

    /// Send a close message to a connection and start tearing it down.
    pub fn close_connection(&self, id: ConnectionId, reason: Option<String>) -> Result<()> {
        self.clients().close(id, reason)
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self, id: ConnectionId) {
        if let Ok(conn) = self.shared.registry.lookup(id) {
            conn.finished_token().cancelled().await;
        }
    }

    /// Close every connection and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let connections = self.shared.registry.connections();
        info!(connections = connections.len(), "Hub shutting down");
        for conn in &connections {
            if let Err(e) = self.close_connection(conn.id(), Some(SHUTDOWN_REASON.to_string())) {
                debug!(conn_id = %conn.id(), error = %e, "Already closed");
            }
        }
        for conn in connections {
            conn.finished_token().cancelled().await;
        }
    }

    /// Send API usable outside of any handler.
    pub fn clients(&self) -> Clients {
        Clients::new(Arc::clone(&self.shared))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }
}
