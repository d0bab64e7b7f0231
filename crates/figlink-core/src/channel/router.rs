//! Dispatch table for inbound frames.
//!
//! Each `FrameKind` maps to one route. Adding a control frame means
//! registering another route, not editing the socket loop.

use super::protocol::{FrameKind, InboundFrame};
use super::transport::{ConnectionHandle, ListenerCore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a route gets to work with.
pub struct RouteContext<'a> {
    pub listener: &'a ListenerCore,
    pub connection: &'a ConnectionHandle,
}

/// Handler for one frame kind.
pub type Route = Arc<dyn Fn(&RouteContext<'_>, InboundFrame) + Send + Sync>;

/// Frame kind -> route.
#[derive(Clone)]
pub struct FrameRouter {
    routes: HashMap<FrameKind, Route>,
}

impl FrameRouter {
    /// A router with no routes; every frame is dropped.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// The routes the transport listener runs with.
    pub fn with_default_routes() -> Self {
        let mut router = Self::empty();
        router.register(FrameKind::Hello, Arc::new(route_hello));
        router.register(FrameKind::Heartbeat, Arc::new(route_heartbeat));
        router.register(FrameKind::Reply, Arc::new(route_reply));
        router
    }

    /// Install or replace the route for `kind`.
    pub fn register(&mut self, kind: FrameKind, route: Route) -> &mut Self {
        self.routes.insert(kind, route);
        self
    }

    pub fn has_route(&self, kind: FrameKind) -> bool {
        self.routes.contains_key(&kind)
    }

    /// Run the route for the frame's kind. Returns false if none exists.
    pub fn dispatch(&self, ctx: &RouteContext<'_>, frame: InboundFrame) -> bool {
        let kind = frame.kind();
        match self.routes.get(&kind) {
            Some(route) => {
                route(ctx, frame);
                true
            }
            None => {
                debug!(connection = %ctx.connection.id(), %kind, "No route for frame");
                false
            }
        }
    }
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::with_default_routes()
    }
}

impl std::fmt::Debug for FrameRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn route_hello(ctx: &RouteContext<'_>, frame: InboundFrame) {
    if let InboundFrame::Hello(identity) = frame {
        ctx.listener.identify_peer(ctx.connection, identity);
    }
}

fn route_heartbeat(ctx: &RouteContext<'_>, frame: InboundFrame) {
    if let InboundFrame::Heartbeat { timestamp } = frame {
        ctx.listener.record_heartbeat(ctx.connection, timestamp);
    }
}

fn route_reply(ctx: &RouteContext<'_>, frame: InboundFrame) {
    if let InboundFrame::Reply(reply) = frame {
        ctx.listener.deliver_reply(ctx.connection, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_routes_cover_every_kind() {
        let router = FrameRouter::with_default_routes();
        for kind in [FrameKind::Hello, FrameKind::Heartbeat, FrameKind::Reply] {
            assert!(router.has_route(kind), "missing route for {}", kind);
        }
    }

    #[test]
    fn test_empty_router_has_no_routes() {
        let router = FrameRouter::empty();
        assert!(!router.has_route(FrameKind::Heartbeat));
    }
}
