// In-process client for the broker: registers a loopback send queue with
// the hub and speaks the same serialized frames a remote client would.
mod local;

pub use local::LocalClient;

use keybus_wire::ErrorReply;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("broker error: [{}] {}", .0.error, .0.details)]
    Broker(ErrorReply),
    #[error("connection to hub closed")]
    Closed,
    #[error("encode: {0}")]
    Encode(#[from] keybus_wire::Error),
}
