//! Signaling: the relay server, the per-endpoint client, and the wire format
//! they share.

pub mod client;
pub mod message;
pub mod relay;

pub use client::{ConnectionState, SignalingClient, MAX_RECONNECT_ATTEMPTS};
pub use message::{FileTransferRequest, MessageType, SignalingMessage};
pub use relay::SignalingRelay;
