//! Chunked transfer session state machine.
//!
//! Drives one file transfer between two peers whose direct channel has been
//! negotiated over the signaling relay. The sender streams metadata followed
//! by strictly ordered chunks and an advisory completion sentinel; the
//! receiver tolerates out-of-order arrival and reconstructs as soon as every
//! chunk index has been seen, then verifies the whole-file SHA-256.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

use crate::error::TransferError;
use crate::transfer::channel::DirectChannel;
use crate::transfer::protocol::{
    sha256_hex, total_chunks, ChannelFrame, FileChunk, FileMetadata, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_FILE_SIZE,
};

/// How long the sender waits for the data channel to report open.
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Cooperative pause inserted after every `YIELD_EVERY_CHUNKS` sends so the
/// transport-side pump can drain. Bounded channels provide the hard
/// backpressure; this just smooths bursts.
const YIELD_EVERY_CHUNKS: u32 = 10;
const YIELD_PAUSE: Duration = Duration::from_millis(10);

/// Tuning knobs for a session. Defaults mirror the browser peer: 64 KiB
/// chunks, 50 MiB ceiling.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub max_file_size: u64,
    pub channel_open_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            channel_open_timeout: CHANNEL_OPEN_TIMEOUT,
        }
    }
}

/// Which end of the transfer this session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Session lifecycle. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Negotiating,
    Connected,
    Transferring,
    Complete,
    Failed,
}

/// Progress and status notifications, the only channel for conveying
/// transfer state to the host application.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Status(String),
    /// Percentage in `[0, 100]`, updated after every chunk.
    Progress(f64),
}

/// A file queued for sending, fully buffered. The whole buffer is hashed
/// before the first chunk goes out, which is what bounds practical file size.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl OutboundFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read a file from disk. The MIME type is not sniffed; callers that know
    /// better can overwrite it.
    pub async fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, "application/octet-stream", data))
    }
}

/// A fully reconstructed and verified inbound file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Hex SHA-256, verified against the sender's metadata before delivery.
    pub hash: String,
}

/// One transfer between an already-signaled pair of peers.
pub struct TransferSession {
    config: TransferConfig,
    role: Option<Role>,
    channel: Option<DirectChannel>,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::Sender<TransferEvent>,
}

impl TransferSession {
    /// Create a session plus the stream of progress/status events it emits.
    pub fn new(config: TransferConfig) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        (
            Self {
                config,
                role: None,
                channel: None,
                state_tx,
                events,
            },
            events_rx,
        )
    }

    /// Bind the session to a role and a negotiated channel. Doing this twice
    /// on one session object is a programming error and fails fast.
    pub fn initialize(&mut self, role: Role, channel: DirectChannel) -> Result<(), TransferError> {
        if self.role.is_some() {
            return Err(TransferError::AlreadyInitialized);
        }
        self.role = Some(role);
        self.channel = Some(channel);
        self.set_state(SessionState::Initialized);
        Ok(())
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    async fn emit(&self, event: TransferEvent) {
        // A host that stopped listening must not stall the transfer.
        let _ = self.events.try_send(event);
    }

    fn take_channel(&mut self, want: Role) -> Result<DirectChannel, TransferError> {
        match self.role {
            Some(role) if role == want => {}
            Some(_) | None => return Err(TransferError::NotInitialized),
        }
        self.channel.take().ok_or(TransferError::NotInitialized)
    }

    /// Stream `file` to the peer.
    ///
    /// Order of operations is load-bearing: the size gate runs before any
    /// state is created or byte is sent, the whole-file hash is computed
    /// before the metadata frame, and chunks go out in strictly increasing
    /// index order.
    pub async fn send_file(&mut self, file: &OutboundFile) -> Result<(), TransferError> {
        let size = file.data.len() as u64;
        if size > self.config.max_file_size {
            return Err(TransferError::FileTooLarge {
                size,
                max: self.config.max_file_size,
            });
        }

        let mut channel = self.take_channel(Role::Sender)?;

        self.set_state(SessionState::Negotiating);
        if let Err(e) = channel.wait_open(self.config.channel_open_timeout).await {
            self.set_state(SessionState::Failed);
            return Err(e);
        }
        self.set_state(SessionState::Connected);

        let metadata = FileMetadata {
            name: file.name.clone(),
            size,
            mime_type: file.mime_type.clone(),
            total_chunks: total_chunks(size, self.config.chunk_size),
            hash: sha256_hex(&file.data),
        };
        let chunks_total = metadata.total_chunks;

        self.emit(TransferEvent::Status(format!(
            "Sending {} ({} chunks)",
            metadata.name, chunks_total
        )))
        .await;

        let result = self
            .send_frames(&mut channel, &metadata, &file.data, chunks_total)
            .await;

        match &result {
            Ok(()) => self.set_state(SessionState::Complete),
            Err(_) => self.set_state(SessionState::Failed),
        }
        result
    }

    async fn send_frames(
        &self,
        channel: &mut DirectChannel,
        metadata: &FileMetadata,
        data: &[u8],
        chunks_total: u32,
    ) -> Result<(), TransferError> {
        send_frame(
            channel,
            &ChannelFrame::FileMetadata {
                metadata: metadata.clone(),
            },
        )
        .await?;
        self.set_state(SessionState::Transferring);

        for index in 0..chunks_total {
            let start = index as usize * self.config.chunk_size;
            let end = (start + self.config.chunk_size).min(data.len());
            let chunk = FileChunk {
                chunk_index: index,
                data: data[start..end].to_vec(),
                is_last: index == chunks_total - 1,
            };
            send_frame(channel, &ChannelFrame::FileChunk { chunk }).await?;

            let progress = (index + 1) as f64 / chunks_total as f64 * 100.0;
            self.emit(TransferEvent::Progress(progress)).await;

            if index % YIELD_EVERY_CHUNKS == 0 {
                tokio::time::sleep(YIELD_PAUSE).await;
            }
        }

        send_frame(channel, &ChannelFrame::FileComplete).await?;
        self.emit(TransferEvent::Status("Transfer complete".to_string()))
            .await;
        Ok(())
    }

    /// Receive one file from the peer: reassemble out-of-order chunks, verify
    /// the whole-file hash, and return the reconstructed file.
    pub async fn receive_file(&mut self) -> Result<ReceivedFile, TransferError> {
        let mut channel = self.take_channel(Role::Receiver)?;

        self.set_state(SessionState::Negotiating);
        if let Err(e) = channel.wait_open(self.config.channel_open_timeout).await {
            self.set_state(SessionState::Failed);
            return Err(e);
        }
        self.set_state(SessionState::Connected);

        let result = self.receive_frames(&mut channel).await;
        match &result {
            Ok(_) => self.set_state(SessionState::Complete),
            Err(_) => self.set_state(SessionState::Failed),
        }
        result
    }

    async fn receive_frames(
        &self,
        channel: &mut DirectChannel,
    ) -> Result<ReceivedFile, TransferError> {
        let mut metadata: Option<FileMetadata> = None;
        let mut received: HashMap<u32, Vec<u8>> = HashMap::new();

        loop {
            let raw = match channel.recv().await {
                Some(raw) => raw,
                None => return Err(TransferError::TransportClosed),
            };

            let frame: ChannelFrame = match serde_json::from_slice(&raw) {
                Ok(frame) => frame,
                Err(e) => {
                    // Tolerate junk frames the way the relay tolerates junk
                    // messages: log and keep the channel up.
                    log::warn!("Dropping malformed data channel frame: {}", e);
                    continue;
                }
            };

            match frame {
                ChannelFrame::FileMetadata { metadata: meta } => {
                    // A fresh metadata frame resets any prior partial state.
                    received.clear();
                    self.set_state(SessionState::Transferring);
                    self.emit(TransferEvent::Status(format!(
                        "Receiving {} ({} chunks)",
                        meta.name, meta.total_chunks
                    )))
                    .await;
                    metadata = Some(meta);
                }
                ChannelFrame::FileChunk { chunk } => {
                    let Some(meta) = metadata.as_ref() else {
                        log::warn!(
                            "Chunk {} arrived before metadata, ignoring",
                            chunk.chunk_index
                        );
                        continue;
                    };
                    received.insert(chunk.chunk_index, chunk.data);

                    let progress = received.len() as f64 / meta.total_chunks as f64 * 100.0;
                    self.emit(TransferEvent::Progress(progress)).await;
                }
                ChannelFrame::FileComplete => {
                    // Advisory only. Completion is chunk-count-driven below,
                    // so a lost sentinel cannot hang the transfer.
                    log::debug!("Received file_complete sentinel");
                    continue;
                }
            }

            if let Some(meta) = metadata.as_ref() {
                if received.len() as u32 >= meta.total_chunks {
                    let file = reconstruct(meta, &received)?;
                    self.emit(TransferEvent::Status("Transfer complete".to_string()))
                        .await;
                    return Ok(file);
                }
            }
        }
    }
}

async fn send_frame(channel: &DirectChannel, frame: &ChannelFrame) -> Result<(), TransferError> {
    let encoded =
        serde_json::to_vec(frame).map_err(|e| TransferError::InvalidFrame(e.to_string()))?;
    channel.send(encoded).await
}

/// Reassemble chunks in index order and verify the announced hash.
///
/// Offsets accumulate from actual chunk lengths, so reassembly stays correct
/// even if the sender used a different chunk size than this endpoint's
/// configuration. A missing index or a hash mismatch is fatal here; corrupt
/// data is never delivered.
fn reconstruct(
    metadata: &FileMetadata,
    received: &HashMap<u32, Vec<u8>>,
) -> Result<ReceivedFile, TransferError> {
    let mut buffer = Vec::with_capacity(metadata.size as usize);
    for index in 0..metadata.total_chunks {
        let chunk = received
            .get(&index)
            .ok_or(TransferError::MissingChunk(index))?;
        buffer.extend_from_slice(chunk);
    }

    let actual = sha256_hex(&buffer);
    if actual != metadata.hash {
        return Err(TransferError::IntegrityMismatch {
            expected: metadata.hash.clone(),
            actual,
        });
    }

    Ok(ReceivedFile {
        name: metadata.name.clone(),
        mime_type: metadata.mime_type.clone(),
        data: buffer,
        hash: actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_for(data: &[u8], chunk_size: usize) -> FileMetadata {
        FileMetadata {
            name: "t.bin".into(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".into(),
            total_chunks: total_chunks(data.len() as u64, chunk_size),
            hash: sha256_hex(data),
        }
    }

    #[test]
    fn reconstruct_assembles_in_index_order() {
        let data: Vec<u8> = (0..200u16).map(|i| (i % 256) as u8).collect();
        let meta = metadata_for(&data, 64);
        let mut received = HashMap::new();
        for (i, chunk) in data.chunks(64).enumerate() {
            received.insert(i as u32, chunk.to_vec());
        }
        let file = reconstruct(&meta, &received).unwrap();
        assert_eq!(file.data, data);
        assert_eq!(file.hash, meta.hash);
    }

    #[test]
    fn reconstruct_rejects_missing_chunk() {
        let data = vec![7u8; 130];
        let meta = metadata_for(&data, 64);
        let mut received = HashMap::new();
        received.insert(0u32, data[..64].to_vec());
        received.insert(2u32, data[128..].to_vec());
        let err = reconstruct(&meta, &received).unwrap_err();
        assert!(matches!(err, TransferError::MissingChunk(1)));
    }

    #[test]
    fn reconstruct_rejects_corrupt_data() {
        let data = vec![1u8; 64];
        let meta = metadata_for(&data, 64);
        let mut received = HashMap::new();
        received.insert(0u32, vec![2u8; 64]);
        let err = reconstruct(&meta, &received).unwrap_err();
        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
    }

    #[test]
    fn double_initialize_fails_fast() {
        let (mut session, _events) = TransferSession::new(TransferConfig::default());
        let (a, _b) = DirectChannel::pair();
        session.initialize(Role::Sender, a).unwrap();
        let (c, _d) = DirectChannel::pair();
        let err = session.initialize(Role::Sender, c).unwrap_err();
        assert!(matches!(err, TransferError::AlreadyInitialized));
    }

    #[test]
    fn send_before_initialize_fails() {
        let (mut session, _events) = TransferSession::new(TransferConfig::default());
        let file = OutboundFile::new("x", "text/plain", vec![0u8; 4]);
        let err = futures::executor::block_on(session.send_file(&file)).unwrap_err();
        assert!(matches!(err, TransferError::NotInitialized));
    }
}
