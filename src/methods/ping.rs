//! Health check and introspection methods.
//!
//! These never touch groups, which makes them handy for measuring the
//! bare round trip through the hub.
//!
//! ```text
//! -> {"type":1,"target":"Ping","arguments":["hi"],"invocationId":"1"}
//! <- {"type":1,"target":"Pong","arguments":["hi"]}
//! <- {"type":3,"invocationId":"1","result":"hi"}
//! ```

use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::runtime::{HubBuilder, HubContext};

pub fn register(builder: HubBuilder) -> HubBuilder {
    builder
        .handler("Ping", ping)
        .handler("Echo", echo)
        .handler("Whoami", whoami)
}

/// Push `Pong(data)` to the caller and return `data`.
pub async fn ping(ctx: HubContext, args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    let data = args.into_iter().next().unwrap_or(Value::Null);
    ctx.send_to_caller("Pong", vec![data.clone()]).await?;
    Ok(Some(data))
}

pub async fn echo(_ctx: HubContext, args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    Ok(Some(Value::Array(args)))
}

pub async fn whoami(ctx: HubContext, _args: Vec<Value>) -> Result<Option<Value>, HandlerError> {
    Ok(Some(json!(ctx.connection_id().to_string())))
}
