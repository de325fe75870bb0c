//! Group membership and message relay methods.

use serde_json::{json, Value};
use tracing::debug;

use super::RECEIVE_METHOD;
use crate::error::HandlerError;
use crate::runtime::{ConnectionId, HubBuilder, HubContext};

pub fn register(builder: HubBuilder) -> HubBuilder {
    builder
        .handler("JoinGroup", join_group)
        .handler("LeaveGroup", leave_group)
        .handler("SendToGroup", send_to_group)
        .handler("SendToConnection", send_to_connection)
        .handler("Broadcast", broadcast)
}

pub async fn join_group(ctx: HubContext, args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    let group: String = HubContext::arg(&args, 0)?;
    ctx.join_group(&group)?;
    Ok(None)
}

/// Returns whether the caller was a member.
pub async fn leave_group(ctx: HubContext, args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    let group: String = HubContext::arg(&args, 0)?;
    Ok(Some(json!(ctx.leave_group(&group)?)))
}

/// Relay a payload to every member of a group. Returns the number of
/// recipients.
pub async fn send_to_group(
    ctx: HubContext,
    args: Vec<Value>,
) -> Result<Option<Value>, HandlerError> {
    let group: String = HubContext::arg(&args, 0)?;
    let payload = payload(&args, 1)?;
    let sent = ctx
        .send_to_group(&group, RECEIVE_METHOD, receive_args(&ctx, payload))
        .await?;
    debug!(conn_id = %ctx.connection_id(), group = %group, sent, "Relayed to group");
    Ok(Some(json!(sent)))
}

pub async fn send_to_connection(
    ctx: HubContext,
    args: Vec<Value>,
) -> Result<Option<Value>, HandlerError> {
    let raw: String = HubContext::arg(&args, 0)?;
    let target: ConnectionId = raw.parse().map_err(|_| {
        HandlerError::InvalidArguments(format!("'{raw}' is not a connection id"))
    })?;
    let payload = payload(&args, 1)?;
    ctx.send_to_connection(target, RECEIVE_METHOD, receive_args(&ctx, payload))
        .await?;
    Ok(None)
}

/// Relay a payload to every connection. Returns the number of recipients.
pub async fn broadcast(ctx: HubContext, args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    let payload = payload(&args, 0)?;
    let sent = ctx
        .send_to_all(RECEIVE_METHOD, receive_args(&ctx, payload))
        .await?;
    Ok(Some(json!(sent)))
}

fn payload(args: &[Value], index: usize) -> Result<Value, HandlerError> {
    HubContext::arg(args, index)
}

fn receive_args(ctx: &HubContext, payload: Value) -> Vec<Value> {
    vec![json!(ctx.connection_id().to_string()), payload]
}
