//! Chunked file transfer over a negotiated direct channel.

pub mod channel;
pub mod protocol;
pub mod session;

pub use channel::DirectChannel;
pub use protocol::{
    format_bytes, sha256_hex, total_chunks, ChannelFrame, FileChunk, FileMetadata,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE,
};
pub use session::{
    OutboundFile, ReceivedFile, Role, SessionState, TransferConfig, TransferEvent, TransferSession,
};
