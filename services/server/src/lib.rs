// WebSocket front-end for the broker.
pub mod ws;

use axum::Router;
use axum::routing::get;
use keybus_broker::HubHandle;

/// Router that upgrades every request path to a WebSocket session.
pub fn build_router(handle: HubHandle) -> Router {
    Router::new()
        .fallback(get(ws::upgrade))
        .with_state(handle)
}

/// Accept `host:port` or the bare `:port` shorthand, which binds every
/// interface.
pub fn normalize_bind_addr(input: &str) -> String {
    match input.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => input.to_string(),
    }
}
