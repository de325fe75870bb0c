//! Method table and invocation dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::context::{Clients, HubContext};
use super::ConnectionId;
use crate::error::{HandlerError, HubError, Result};
use crate::protocol::{HubMessage, Invocation};

/// Boxed future returned by a [`Handler`].
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static>>;

/// A hub method.
///
/// Implemented for any `Fn(HubContext, Vec<Value>) -> impl Future` closure,
/// so most handlers are plain async functions.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: HubContext, args: Vec<Value>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: HubContext, args: Vec<Value>) -> HandlerFuture {
        Box::pin(self(ctx, args))
    }
}

struct Method {
    name: String,
    handler: Arc<dyn Handler>,
}

/// Routes invocations to registered handlers.
///
/// Method names are matched case-insensitively.
pub struct Dispatcher {
    methods: HashMap<String, Method>,
    clients: Clients,
    detailed_errors: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        handlers: Vec<(String, Arc<dyn Handler>)>,
        clients: Clients,
        detailed_errors: bool,
    ) -> Result<Self> {
        let mut methods = HashMap::with_capacity(handlers.len());
        for (name, handler) in handlers {
            let key = name.to_ascii_lowercase();
            if methods.contains_key(&key) {
                return Err(HubError::DuplicateMethod(name));
            }
            methods.insert(key, Method { name, handler });
        }
        Ok(Self {
            methods,
            clients,
            detailed_errors,
        })
    }

    /// Whether a method with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.values().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Run one invocation to completion.
    ///
    /// The handler runs in its own task so a panic cannot take the caller
    /// down. When the invocation carries an id, the outcome is reported to
    /// `origin` as a completion. Errors returned here have already been
    /// reported and only need logging.
    pub async fn dispatch(&self, invocation: Invocation, origin: ConnectionId) -> Result<()> {
        let Invocation {
            target,
            arguments,
            invocation_id,
        } = invocation;

        let Some(method) = self.methods.get(&target.to_ascii_lowercase()) else {
            let err = HubError::MethodNotFound(target);
            if let Some(invocation_id) = invocation_id {
                self.complete(
                    origin,
                    HubMessage::Error {
                        invocation_id,
                        error: err.to_string(),
                    },
                )
                .await;
            }
            return Err(err);
        };

        trace!(conn_id = %origin, method = %method.name, "Dispatching");
        let ctx = HubContext::new(origin, self.clients.clone());
        let outcome = tokio::spawn(method.handler.call(ctx, arguments)).await;

        let reason = match outcome {
            Ok(Ok(result)) => {
                if let Some(invocation_id) = invocation_id {
                    self.complete(
                        origin,
                        HubMessage::Result {
                            invocation_id,
                            result: result.unwrap_or(Value::Null),
                        },
                    )
                    .await;
                }
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => panic_message(e.into_panic()),
            Err(e) => e.to_string(),
        };

        warn!(conn_id = %origin, method = %method.name, error = %reason, "Handler failed");
        if let Some(invocation_id) = invocation_id {
            let error = if self.detailed_errors {
                format!(
                    "An error occurred invoking '{}' on the server: {reason}",
                    method.name
                )
            } else {
                format!(
                    "An unexpected error occurred invoking '{}' on the server.",
                    method.name
                )
            };
            self.complete(
                origin,
                HubMessage::Error {
                    invocation_id,
                    error,
                },
            )
            .await;
        }
        Err(HubError::HandlerFailure {
            method: method.name.clone(),
            reason,
        })
    }

    /// Report a rejected frame to its sender.
    pub(crate) async fn reject(&self, origin: ConnectionId, invocation_id: String, err: &HubError) {
        self.complete(
            origin,
            HubMessage::Error {
                invocation_id,
                error: err.to_string(),
            },
        )
        .await;
    }

    async fn complete(&self, origin: ConnectionId, completion: HubMessage) {
        if let Err(e) = self.clients.send_message(origin, &completion).await {
            debug!(conn_id = %origin, error = %e, "Completion not delivered");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
