//! Per-connection reader and writer tasks.
//!
//! The reader owns the connection's lifecycle: it runs the handshake, feeds
//! frames to the dispatcher one at a time and performs teardown. The writer
//! drains the outbound queue and sends keep-alive pings when the queue has
//! been quiet.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::connection::{ConnState, Connection};
use super::context::HubContext;
use super::{Hub, HubShared, LifecycleHook};
use crate::error::{HubError, Result};
use crate::protocol::HubMessage;
use crate::transport::{FrameReader, FrameWriter};

/// Close reason sent to a client that stopped talking.
const IDLE_TIMEOUT_REASON: &str =
    "Server timeout elapsed without receiving a message from the client.";

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Closed by the server, or the writer stopped.
    Requested,
    /// The client sent a close message.
    ClientClosed,
    EndOfStream,
    IdleTimeout,
    HandshakeFailed,
    TransportError,
}

/// Drain `rx` into `writer` until the connection is cancelled.
///
/// Sends a ping whenever nothing was written for `keepalive`. Once
/// cancelled, an in-flight write and whatever is still queued get `grace`
/// to go out, then the stream is shut down.
pub(crate) async fn write_loop<W: FrameWriter>(
    conn: Arc<Connection>,
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    ping_frame: Bytes,
    keepalive: Duration,
    grace: Duration,
) {
    let id = conn.id();
    let cancel = conn.cancel_token().clone();
    let mut keepalive_timer = time::interval_at(Instant::now() + keepalive, keepalive);
    keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut healthy = true;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = keepalive_timer.tick() => {
                trace!(conn_id = %id, "Keep-alive ping");
                ping_frame.clone()
            }
        };

        let written = tokio::select! {
            result = writer.write_frame(frame) => result,
            _ = async {
                cancel.cancelled().await;
                time::sleep(grace).await;
            } => {
                debug!(conn_id = %id, "Write abandoned on close");
                healthy = false;
                break;
            }
        };
        if let Err(e) = written {
            debug!(conn_id = %id, error = %e, "Write failed");
            conn.fail_transport();
            healthy = false;
            break;
        }
        keepalive_timer.reset();
    }

    if healthy {
        let drain = async {
            while let Ok(frame) = rx.try_recv() {
                writer.write_frame(frame).await?;
            }
            writer.shutdown().await
        };
        match time::timeout(grace, drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(conn_id = %id, error = %e, "Flush on close failed"),
            Err(_) => debug!(conn_id = %id, "Flush on close timed out"),
        }
    }
    trace!(conn_id = %id, "Writer stopped");
}

/// Run a connection from handshake to teardown.
pub(crate) async fn read_loop<R: FrameReader>(
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut reader: R,
    writer_task: JoinHandle<()>,
) {
    let id = conn.id();
    let shared = &hub.shared;
    let cancel = conn.cancel_token().clone();

    let handshake_timeout = shared.config.handshake_timeout;
    let greeted = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HubError::InvalidState("closed during handshake".into())),
        result = time::timeout(handshake_timeout, handshake(shared, &conn, &mut reader)) => {
            result.unwrap_or_else(|_| Err(HubError::Handshake("handshake timed out".into())))
        }
    };

    let reason = match greeted {
        Ok(()) => {
            debug!(conn_id = %id, "Handshake complete");
            run_hook(&hub, &conn, hub.hooks.on_connect.as_ref(), "on_connect").await;
            read_frames(&hub, &conn, &mut reader).await
        }
        Err(e) => {
            warn!(conn_id = %id, error = %e, "Handshake failed");
            CloseReason::HandshakeFailed
        }
    };

    if reason == CloseReason::TransportError || conn.transport_failed() {
        let _ = conn.advance(ConnState::Closed);
    } else {
        let _ = conn.advance(ConnState::Disconnecting);
    }

    if reason != CloseReason::HandshakeFailed {
        run_hook(&hub, &conn, hub.hooks.on_disconnect.as_ref(), "on_disconnect").await;
    }

    if let Err(e) = shared.registry.unregister(id) {
        debug!(conn_id = %id, error = %e, "Unregister failed");
    }
    if let Err(e) = writer_task.await {
        warn!(conn_id = %id, error = %e, "Writer task failed");
    }
    let connected_for = Utc::now() - conn.connected_at();
    debug!(
        conn_id = %id,
        ?reason,
        connected_ms = connected_for.num_milliseconds(),
        "Connection closed"
    );
    conn.finished_token().cancel();
}

async fn handshake<R: FrameReader>(
    shared: &HubShared,
    conn: &Connection,
    reader: &mut R,
) -> Result<()> {
    let frame = reader
        .read_frame()
        .await?
        .ok_or_else(|| HubError::Handshake("connection closed before handshake".into()))?;

    let request = shared
        .codec
        .decode_handshake(&frame)
        .and_then(|request| request.validate());

    match request {
        Ok(()) => {
            let response = shared.codec.encode_handshake_response(None)?;
            conn.enqueue(response, shared.config.send_timeout).await?;
            conn.advance(ConnState::Connected)?;
            Ok(())
        }
        Err(e) => {
            let message = match &e {
                HubError::Handshake(message) => message.clone(),
                other => other.to_string(),
            };
            let response = shared.codec.encode_handshake_response(Some(&message))?;
            if let Err(send_err) = conn.enqueue(response, shared.config.send_timeout).await {
                debug!(conn_id = %conn.id(), error = %send_err, "Handshake response not sent");
            }
            Err(e)
        }
    }
}

async fn read_frames<R: FrameReader>(
    hub: &Hub,
    conn: &Connection,
    reader: &mut R,
) -> CloseReason {
    let id = conn.id();
    let cancel = conn.cancel_token().clone();
    let client_timeout = hub.shared.config.client_timeout;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CloseReason::Requested,
            read = time::timeout(client_timeout, reader.read_frame()) => read,
        };

        match read {
            Err(_) => {
                debug!(conn_id = %id, "Client timed out");
                let close = HubMessage::Close {
                    error: Some(IDLE_TIMEOUT_REASON.to_string()),
                };
                if let Ok(frame) = hub.shared.codec.encode(&close) {
                    conn.try_enqueue(frame);
                }
                return CloseReason::IdleTimeout;
            }
            Ok(Ok(Some(frame))) => {
                trace!(conn_id = %id, len = frame.len(), "Frame received");
                if let Some(reason) = handle_frame(hub, conn, &frame).await {
                    return reason;
                }
            }
            Ok(Ok(None)) => return CloseReason::EndOfStream,
            Ok(Err(HubError::Transport(e))) => {
                debug!(conn_id = %id, error = %e, "Read failed");
                return CloseReason::TransportError;
            }
            Ok(Err(e)) => warn!(conn_id = %id, error = %e, "Dropped inbound frame"),
        }
    }
}

/// Decode and act on one frame. Returns a reason when the connection
/// should close.
async fn handle_frame(hub: &Hub, conn: &Connection, frame: &[u8]) -> Option<CloseReason> {
    let id = conn.id();
    let msg = match hub.shared.codec.decode(frame) {
        Ok(msg) => msg,
        Err(HubError::UnknownMessageType(kind)) => {
            debug!(conn_id = %id, kind, "Ignored message of unknown type");
            return None;
        }
        Err(e) => {
            warn!(conn_id = %id, error = %e, "Dropped malformed message");
            if let Some(invocation_id) = hub.shared.codec.peek_invocation_id(frame) {
                hub.dispatcher.reject(id, invocation_id, &e).await;
            }
            return None;
        }
    };

    if !conn.is_connected() {
        let violation = HubError::ProtocolViolation(format!(
            "{:?} message received while {:?}",
            msg.kind(),
            conn.state()
        ));
        warn!(conn_id = %id, error = %violation, "Dropped message");
        return None;
    }

    match msg {
        HubMessage::Invocation(invocation) => {
            match hub.dispatcher.dispatch(invocation, id).await {
                Ok(()) | Err(HubError::HandlerFailure { .. }) => {}
                Err(e) => warn!(conn_id = %id, error = %e, "Invocation rejected"),
            }
            None
        }
        HubMessage::Ping => {
            trace!(conn_id = %id, "Ping");
            None
        }
        HubMessage::Close { error } => {
            debug!(conn_id = %id, error = ?error, "Client sent close");
            Some(CloseReason::ClientClosed)
        }
        HubMessage::Result { invocation_id, .. } | HubMessage::Error { invocation_id, .. } => {
            let violation = HubError::ProtocolViolation(format!(
                "unexpected completion for invocation '{invocation_id}'"
            ));
            warn!(conn_id = %id, error = %violation, "Dropped message");
            None
        }
    }
}

/// Run a lifecycle hook on its own task so a panic stays contained.
async fn run_hook(hub: &Hub, conn: &Connection, hook: Option<&LifecycleHook>, name: &str) {
    let Some(hook) = hook else {
        return;
    };
    let ctx = HubContext::new(conn.id(), hub.clients());
    if let Err(e) = tokio::spawn(hook(ctx)).await {
        warn!(conn_id = %conn.id(), hook = name, error = %e, "Lifecycle hook failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::protocol::Invocation;
    use crate::runtime::{ConnectionId, HubConfig};
    use crate::transport::memory::{self, MemoryClient};
    use crate::transport::StreamTransport;
    use serde_json::{json, Value};
    use std::io;
    use tokio_test::io::Builder;

    type Outcome = std::result::Result<Option<Value>, HandlerError>;

    async fn echo(_ctx: HubContext, args: Vec<Value>) -> Outcome {
        Ok(Some(Value::Array(args)))
    }

    async fn join(ctx: HubContext, args: Vec<Value>) -> Outcome {
        let group: String = HubContext::arg(&args, 0)?;
        ctx.join_group(&group)?;
        Ok(None)
    }

    fn hub_with(config: HubConfig) -> Arc<Hub> {
        Hub::builder(config)
            .handler("Echo", echo)
            .handler("Join", join)
            .build()
            .unwrap()
    }

    async fn connect(hub: &Arc<Hub>) -> (ConnectionId, MemoryClient) {
        let (transport, mut client) = memory::pair(64);
        let id = hub.on_connection_opened(transport).unwrap();
        client.handshake().await.unwrap();
        (id, client)
    }

    async fn next(client: &mut MemoryClient) -> Option<HubMessage> {
        time::timeout(Duration::from_secs(5), client.recv_skip_pings())
            .await
            .expect("timed out")
            .map(|msg| msg.expect("decode"))
    }

    async fn wait_closed(hub: &Hub, id: ConnectionId) {
        time::timeout(Duration::from_secs(5), hub.closed(id))
            .await
            .expect("connection did not close");
    }

    #[tokio::test]
    async fn test_handshake_then_invoke() {
        let hub = hub_with(HubConfig::default());
        let (id, mut client) = connect(&hub).await;
        assert!(hub.registry().lookup(id).unwrap().is_connected());

        client.invoke("Echo", vec![json!("a")], Some("1")).await.unwrap();
        assert_eq!(
            next(&mut client).await,
            Some(HubMessage::Result {
                invocation_id: "1".into(),
                result: json!(["a"]),
            })
        );
    }

    #[tokio::test]
    async fn test_unsupported_protocol_rejected() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(8);
        let id = hub.on_connection_opened(transport).unwrap();

        client
            .send_raw(&b"{\"protocol\":\"msgpack\",\"version\":1}\x1e"[..])
            .await
            .unwrap();
        let err = client.read_handshake_response().await.unwrap_err();
        assert!(matches!(err, HubError::Handshake(msg) if msg.contains("msgpack")));

        assert!(client.recv_raw().await.is_none());
        wait_closed(&hub, id).await;
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_invocation_before_handshake_closes() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(8);
        let id = hub.on_connection_opened(transport).unwrap();

        client.invoke("Echo", vec![], Some("1")).await.unwrap();
        assert!(client.read_handshake_response().await.is_err());
        assert!(client.recv_raw().await.is_none());
        wait_closed(&hub, id).await;
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let hub = hub_with(HubConfig {
            handshake_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        });
        let (transport, mut client) = memory::pair(8);
        let id = hub.on_connection_opened(transport).unwrap();

        assert!(next(&mut client).await.is_none());
        wait_closed(&hub, id).await;
    }

    #[tokio::test]
    async fn test_client_close_leaves_groups() {
        let hub = hub_with(HubConfig::default());
        let (a, mut alice) = connect(&hub).await;
        let (b, _bob) = connect(&hub).await;

        alice.invoke("Join", vec![json!("room")], Some("1")).await.unwrap();
        assert!(matches!(next(&mut alice).await, Some(HubMessage::Result { .. })));
        hub.registry().join_group(b, "room").unwrap();
        assert_eq!(hub.registry().members_of("room").len(), 2);

        alice.send(&HubMessage::Close { error: None }).await.unwrap();
        wait_closed(&hub, a).await;

        assert!(!hub.registry().members_of("room").contains(&a));
        assert!(hub.registry().members_of("room").contains(&b));
        assert_eq!(hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_server_close_sends_reason_and_stops_dispatch() {
        let hub = hub_with(HubConfig::default());
        let (id, mut client) = connect(&hub).await;

        hub.close_connection(id, Some("bye".into())).unwrap();
        // Anything sent now is never answered.
        let _ = client.invoke("Echo", vec![], Some("late")).await;

        assert_eq!(
            next(&mut client).await,
            Some(HubMessage::Close {
                error: Some("bye".into())
            })
        );
        assert!(next(&mut client).await.is_none());
        wait_closed(&hub, id).await;
        assert!(matches!(
            hub.close_connection(id, None),
            Err(HubError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_on_connection_closed_waits_for_teardown() {
        let hub = hub_with(HubConfig::default());
        let (id, mut client) = connect(&hub).await;

        hub.on_connection_closed(id).await.unwrap();
        assert!(hub.registry().lookup(id).is_err());
        assert!(next(&mut client).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_client_is_closed() {
        let hub = hub_with(HubConfig {
            client_timeout: Duration::from_millis(100),
            keepalive_interval: Duration::from_secs(60),
            ..HubConfig::default()
        });
        let (id, mut client) = connect(&hub).await;

        assert_eq!(
            next(&mut client).await,
            Some(HubMessage::Close {
                error: Some(IDLE_TIMEOUT_REASON.into())
            })
        );
        wait_closed(&hub, id).await;
    }

    #[tokio::test]
    async fn test_keepalive_ping_sent_when_quiet() {
        let hub = hub_with(HubConfig {
            keepalive_interval: Duration::from_millis(30),
            ..HubConfig::default()
        });
        let (_id, mut client) = connect(&hub).await;

        let msg = time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg, HubMessage::Ping);
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_close_connection() {
        let hub = hub_with(HubConfig {
            max_message_size: 128,
            max_arguments: 2,
            ..HubConfig::default()
        });
        let (_id, mut client) = connect(&hub).await;

        // Unknown type: ignored silently.
        client.send_raw(&b"{\"type\":4}\x1e"[..]).await.unwrap();
        // Malformed JSON: dropped.
        client.send_raw(&b"{oops\x1e"[..]).await.unwrap();
        // Completion from a client: protocol violation, dropped.
        client
            .send(&HubMessage::Result {
                invocation_id: "x".into(),
                result: json!(1),
            })
            .await
            .unwrap();
        // Oversized: dropped.
        client
            .send_raw(format!("{{\"type\":1,\"target\":\"{}\"}}\x1e", "e".repeat(200)))
            .await
            .unwrap();
        // Too many arguments: the caller is told.
        client.invoke("Echo", vec![json!(1), json!(2), json!(3)], Some("big")).await.unwrap();
        match next(&mut client).await {
            Some(HubMessage::Error { invocation_id, .. }) => assert_eq!(invocation_id, "big"),
            other => panic!("unexpected {other:?}"),
        }

        client.invoke("Echo", vec![json!(1)], Some("ok")).await.unwrap();
        assert_eq!(
            next(&mut client).await,
            Some(HubMessage::Result {
                invocation_id: "ok".into(),
                result: json!([1]),
            })
        );
    }

    #[tokio::test]
    async fn test_lifecycle_hooks() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connect_tx = events_tx.clone();
        let hub = Hub::builder(HubConfig::default())
            .on_connect(move |ctx: HubContext| {
                let events = connect_tx.clone();
                async move {
                    ctx.join_group("lobby").unwrap();
                    ctx.send_to_caller("Welcome", vec![json!(ctx.connection_id().to_string())])
                        .await
                        .unwrap();
                    events.send(("connect", ctx.connection_id(), Vec::new())).unwrap();
                }
            })
            .on_disconnect(move |ctx: HubContext| {
                let events = events_tx.clone();
                async move {
                    let groups = ctx.groups().unwrap_or_default();
                    events.send(("disconnect", ctx.connection_id(), groups)).unwrap();
                }
            })
            .build()
            .unwrap();

        let (id, mut client) = connect(&hub).await;
        assert_eq!(
            next(&mut client).await,
            Some(HubMessage::Invocation(Invocation::new(
                "Welcome",
                vec![json!(id.to_string())]
            )))
        );
        assert_eq!(events.recv().await.unwrap(), ("connect", id, Vec::new()));

        client.close();
        assert_eq!(
            events.recv().await.unwrap(),
            ("disconnect", id, vec!["lobby".to_string()])
        );
        wait_closed(&hub, id).await;
        assert!(hub.registry().members_of("lobby").is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_still_runs_disconnect_hook() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let hub = Hub::builder(HubConfig::default())
            .on_disconnect(move |ctx: HubContext| {
                let events = events_tx.clone();
                async move {
                    events.send(ctx.connection_id()).unwrap();
                }
            })
            .build()
            .unwrap();

        let reader = Builder::new()
            .read(b"{\"protocol\":\"json\",\"version\":1}\x1e")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let transport = StreamTransport::from_parts(reader, tokio::io::sink(), 1024);
        let id = hub.on_connection_opened(transport).unwrap();

        let fired = time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired, id);
        wait_closed(&hub, id).await;
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_closed() {
        let hub = hub_with(HubConfig {
            send_buffer: 1,
            send_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        });
        // A one-slot transport whose client never reads.
        let (transport, mut client) = memory::pair(1);
        let id = hub.on_connection_opened(transport).unwrap();
        client.handshake().await.unwrap();

        let mut refused = false;
        for i in 0..10 {
            match hub.clients().connection(id, "Flood", vec![json!(i)]).await {
                Ok(()) => {}
                Err(HubError::SlowConsumer(slow)) => {
                    assert_eq!(slow, id);
                    refused = true;
                    break;
                }
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(refused);
        wait_closed(&hub, id).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everyone() {
        let hub = hub_with(HubConfig::default());
        let (_a, mut alice) = connect(&hub).await;
        let (_b, mut bob) = connect(&hub).await;

        time::timeout(Duration::from_secs(5), hub.shutdown())
            .await
            .unwrap();
        assert!(hub.registry().is_empty());

        for client in [&mut alice, &mut bob] {
            assert_eq!(
                next(client).await,
                Some(HubMessage::Close {
                    error: Some("Server is shutting down.".into())
                })
            );
            assert!(next(client).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let hub = hub_with(HubConfig {
            max_connections: 1,
            ..HubConfig::default()
        });
        let (_id, _client) = connect(&hub).await;
        let (transport, _second) = memory::pair(8);
        assert!(matches!(
            hub.on_connection_opened(transport),
            Err(HubError::CapacityExceeded(1))
        ));
    }

    #[tokio::test]
    async fn test_close_during_handshake_sends_no_close_message() {
        let hub = hub_with(HubConfig::default());
        let (transport, mut client) = memory::pair(8);
        let id = hub.on_connection_opened(transport).unwrap();

        hub.close_connection(id, Some("bye".into())).unwrap();
        wait_closed(&hub, id).await;
        // No handshake response and no close record, just end of stream.
        assert!(time::timeout(Duration::from_secs(5), client.recv_raw())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_group_push_does_not_wait_on_full_member() {
        let hub = hub_with(HubConfig {
            send_buffer: 2,
            send_timeout: Duration::from_secs(1),
            ..HubConfig::default()
        });
        let (fast_id, mut fast) = connect(&hub).await;
        // A one-slot transport whose client never reads after the handshake.
        let (transport, mut slow) = memory::pair(1);
        let slow_id = hub.on_connection_opened(transport).unwrap();
        slow.handshake().await.unwrap();
        hub.registry().join_group(fast_id, "room").unwrap();
        hub.registry().join_group(slow_id, "room").unwrap();

        let clients = hub.clients();
        time::timeout(Duration::from_millis(500), async {
            for i in 0..10 {
                clients.group("room", "Tick", vec![json!(i)]).await.unwrap();
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("group push waited on a full member");

        wait_closed(&hub, slow_id).await;
        for i in 0..10 {
            assert_eq!(
                next(&mut fast).await,
                Some(HubMessage::Invocation(Invocation::new("Tick", vec![json!(i)])))
            );
        }
        assert!(hub.registry().lookup(fast_id).is_ok());
    }
}
