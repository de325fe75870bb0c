//! grow-a-hub: a real-time bidirectional RPC hub.
//!
//! - `protocol`: JSON hub protocol codec and stream framing
//! - `transport`: TCP and in-memory transports
//! - `runtime`: connections, groups, dispatch and the send API
//! - `methods`: built-in hub methods
//! - `server`: TCP accept loop
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod error;
pub mod methods;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod transport;

pub use error::{HandlerError, HubError, Result};
pub use protocol::{Codec, HubMessage, Invocation};
pub use runtime::{Clients, ConnectionId, Hub, HubBuilder, HubConfig, HubContext, Target};
