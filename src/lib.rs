//! windrop: peer-to-peer chunked file transfer.
//!
//! Three layers, bottom up:
//! - [`signaling`]: a WebSocket relay that routes opaque negotiation frames
//!   between registered peers, and the client that talks to it.
//! - [`rtc`]: WebRTC peer connection plumbing that turns the signaling
//!   exchange into an open data channel.
//! - [`transfer`]: the chunked transfer session that streams a file over
//!   that channel with whole-file SHA-256 integrity.

pub mod error;
pub mod peer_id;
pub mod rtc;
pub mod signaling;
pub mod transfer;
