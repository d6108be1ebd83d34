use thiserror::Error;

/// Errors raised by a transfer session or the negotiation leading up to it.
///
/// Routing failures are recoverable (re-initiate the transfer); everything
/// else is terminal for the current session and requires a full restart.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The target peer is not registered at the relay (or its connection
    /// dropped). The relay reported this back to us; retrying is allowed.
    #[error("peer '{0}' is not available at the signaling relay")]
    PeerUnavailable(String),

    /// The data channel did not report open within the bounded wait.
    #[error("timed out waiting for the data channel to open")]
    NegotiationTimeout,

    /// Rejected before any bytes were sent.
    #[error("file is {size} bytes, exceeding the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    /// Whole-file SHA-256 of the reconstructed bytes does not match the
    /// hash the sender announced in the metadata frame.
    #[error("reconstructed file hash {actual} does not match announced hash {expected}")]
    IntegrityMismatch { expected: String, actual: String },

    /// A chunk index was absent at reconstruction time. Should not happen:
    /// reconstruction only starts once every index has been seen.
    #[error("chunk {0} missing at reconstruction")]
    MissingChunk(u32),

    /// The underlying transport closed mid-transfer. No automatic resume.
    #[error("data channel closed before the transfer finished")]
    TransportClosed,

    /// Initializing a session object twice is a programming error.
    #[error("transfer session already initialized")]
    AlreadyInitialized,

    /// Using a session before initializing it with a role and a channel.
    #[error("transfer session not initialized")]
    NotInitialized,

    /// The peer sent a negotiation payload or transfer frame that does not
    /// parse. Raised for malformed offer/answer data; malformed frames on an
    /// established data channel are skipped instead.
    #[error("malformed frame: {0}")]
    InvalidFrame(String),
}
