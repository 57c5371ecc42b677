// Key-value broker core: one dispatcher task multiplexing many clients
// over a pluggable storage backend, with change notifications pushed to
// exact-key and prefix subscribers.
mod auth;
mod commands;
mod hub;
mod registry;
mod subscriptions;

pub use auth::{CHALLENGE_BYTES, Challenge};
pub use hub::{Hub, HubError, HubHandle, HubOptions, IncomingMessage, Result};
pub use registry::{ClientOptions, ClientRegistry};
pub use subscriptions::SubscriptionIndex;
