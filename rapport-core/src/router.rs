//! # Message Router
//!
//! Typed in-process publish/subscribe. Components register handlers for
//! concrete message kinds at construction time; the built router is frozen
//! and dispatches without locks.
//!
//! Handlers run synchronously inside `route` and must not block the caller
//! for unbounded time. Long work re-enqueues through `route_async` or an
//! owned channel.

use crate::messages::{Message, MessageKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// A registered route target. Shared so one component can subscribe the same
/// handler under several kinds.
pub type RouteHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Collects routes while the node is being wired together.
///
/// Registration is only possible here; `build` freezes the table.
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<MessageKind, Vec<RouteHandler>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one message kind. Handlers for the same kind
    /// are dispatched in registration order.
    pub fn add_route(&mut self, kind: MessageKind, handler: RouteHandler) -> &mut Self {
        self.routes.entry(kind).or_default().push(handler);
        self
    }

    /// Registers the same handler under several kinds.
    pub fn add_routes(&mut self, kinds: &[MessageKind], handler: RouteHandler) -> &mut Self {
        for kind in kinds {
            self.add_route(*kind, handler.clone());
        }
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new(Router {
            routes: self.routes,
        })
    }
}

/// The frozen dispatch table.
pub struct Router {
    routes: HashMap<MessageKind, Vec<RouteHandler>>,
}

impl Router {
    /// Synchronously delivers the message to every handler registered for
    /// its kind, in registration order. A message with no registered route
    /// is logged and dropped.
    ///
    /// A panicking handler is caught and logged; later handlers still run.
    pub fn route(&self, message: Message) {
        let kind = message.kind();
        match self.routes.get(&kind) {
            Some(handlers) if !handlers.is_empty() => {
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                        error!(?kind, "route handler panicked, continuing with remaining handlers");
                    }
                }
            }
            _ => {
                warn!(?kind, "no route registered, dropping message");
            }
        }
    }

    /// Schedules the supplier's message to be routed on a worker task.
    /// Used to escape reentrancy when publishing from inside a critical
    /// section or another handler.
    pub fn route_async<F>(self: &Arc<Self>, supplier: F)
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.route(supplier());
        });
    }
}
