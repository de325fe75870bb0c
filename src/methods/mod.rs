//! Built-in hub methods served by the binary.
//!
//! ## Diagnostics
//! - `Ping(data)`: pushes `Pong(data)` back and returns `data`
//! - `Echo(args...)`: returns its arguments
//! - `Whoami()`: returns the caller's connection id
//!
//! ## Messaging
//! - `JoinGroup(name)` / `LeaveGroup(name)`
//! - `SendToGroup(name, payload)`, `SendToConnection(id, payload)`,
//!   `Broadcast(payload)`: push `Receive(sender, payload)` to the targets

pub mod groups;
pub mod ping;

use crate::runtime::HubBuilder;

/// Method pushed to clients when another connection sends them something.
pub const RECEIVE_METHOD: &str = "Receive";

/// Register every built-in method.
pub fn register(builder: HubBuilder) -> HubBuilder {
    groups::register(ping::register(builder))
}
