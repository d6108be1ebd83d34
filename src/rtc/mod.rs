//! WebRTC transport: peer connection plumbing and offer/answer negotiation.

pub mod negotiate;
pub mod peer;

pub use negotiate::{accept, dial};
pub use peer::{bridge_data_channel, PeerConnection, DATA_CHANNEL_LABEL};
