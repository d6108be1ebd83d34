use tokio::time::Duration;
use windrop::transfer::{
    sha256_hex, total_chunks, ChannelFrame, DirectChannel, FileChunk, FileMetadata, OutboundFile,
    Role, SessionState, TransferConfig, TransferEvent, TransferSession,
};

// =============================================================================
// End-to-end transfer over an in-memory direct channel
// =============================================================================

fn small_chunks() -> TransferConfig {
    TransferConfig {
        chunk_size: 64,
        ..TransferConfig::default()
    }
}

async fn run_transfer(data: Vec<u8>) -> (Vec<u8>, String) {
    let (sender_ch, receiver_ch) = DirectChannel::pair();

    let (mut sender, _sender_events) = TransferSession::new(small_chunks());
    sender.initialize(Role::Sender, sender_ch).unwrap();

    let (mut receiver, _receiver_events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let file = OutboundFile::new("payload.bin", "application/octet-stream", data);
    let send_handle = tokio::spawn(async move {
        sender.send_file(&file).await.unwrap();
        sender.state()
    });

    let received = receiver.receive_file().await.unwrap();
    assert_eq!(send_handle.await.unwrap(), SessionState::Complete);
    assert_eq!(receiver.state(), SessionState::Complete);
    (received.data, received.hash)
}

#[tokio::test]
async fn test_round_trip_preserves_content() {
    let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let expected_hash = sha256_hex(&data);

    let (received, hash) = run_transfer(data.clone()).await;
    assert_eq!(received, data);
    assert_eq!(hash, expected_hash);
}

#[tokio::test]
async fn test_round_trip_partial_final_chunk() {
    // 130 bytes over 64-byte chunks: two full chunks plus a 2-byte tail.
    let data = vec![42u8; 130];
    assert_eq!(total_chunks(130, 64), 3);

    let (received, _) = run_transfer(data.clone()).await;
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_round_trip_empty_file() {
    let (received, hash) = run_transfer(Vec::new()).await;
    assert!(received.is_empty());
    assert_eq!(hash, sha256_hex(&[]));
}

#[tokio::test]
async fn test_sender_reports_monotonic_progress() {
    let (sender_ch, mut receiver_ch) = DirectChannel::pair();
    let (mut sender, mut events) = TransferSession::new(small_chunks());
    sender.initialize(Role::Sender, sender_ch).unwrap();

    let file = OutboundFile::new("p.bin", "application/octet-stream", vec![0u8; 640]);
    sender.send_file(&file).await.unwrap();

    // Drain the peer so nothing backs up.
    while receiver_ch.try_recv().is_some() {}

    let mut last = 0.0;
    let mut final_progress = 0.0;
    while let Ok(event) = events.try_recv() {
        if let TransferEvent::Progress(pct) = event {
            assert!(pct >= last, "progress went backwards: {} < {}", pct, last);
            last = pct;
            final_progress = pct;
        }
    }
    assert_eq!(final_progress, 100.0);
}

// =============================================================================
// Receiver behavior against hand-built frame sequences
// =============================================================================

fn encode(frame: &ChannelFrame) -> Vec<u8> {
    serde_json::to_vec(frame).unwrap()
}

fn metadata_for(data: &[u8], chunk_size: usize) -> FileMetadata {
    FileMetadata {
        name: "raw.bin".to_string(),
        size: data.len() as u64,
        mime_type: "application/octet-stream".to_string(),
        total_chunks: total_chunks(data.len() as u64, chunk_size),
        hash: sha256_hex(data),
    }
}

#[tokio::test]
async fn test_receiver_completes_without_sentinel() {
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let data = vec![9u8; 100];
    let meta = metadata_for(&data, 64);
    feeder
        .send(encode(&ChannelFrame::FileMetadata {
            metadata: meta.clone(),
        }))
        .await
        .unwrap();
    for (i, chunk) in data.chunks(64).enumerate() {
        feeder
            .send(encode(&ChannelFrame::FileChunk {
                chunk: FileChunk {
                    chunk_index: i as u32,
                    data: chunk.to_vec(),
                    is_last: i == 1,
                },
            }))
            .await
            .unwrap();
    }
    // No file_complete sentinel: completion is chunk-count-driven.

    let received = receiver.receive_file().await.unwrap();
    assert_eq!(received.data, data);
}

#[tokio::test]
async fn test_receiver_reassembles_reverse_order_chunks() {
    // 2048 bytes over 64-byte chunks is exactly 32 chunks; deliver 31..0.
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let meta = metadata_for(&data, 64);
    assert_eq!(meta.total_chunks, 32);
    feeder
        .send(encode(&ChannelFrame::FileMetadata {
            metadata: meta.clone(),
        }))
        .await
        .unwrap();

    let chunks: Vec<Vec<u8>> = data.chunks(64).map(|c| c.to_vec()).collect();
    for index in (0..32u32).rev() {
        feeder
            .send(encode(&ChannelFrame::FileChunk {
                chunk: FileChunk {
                    chunk_index: index,
                    data: chunks[index as usize].clone(),
                    is_last: index == 31,
                },
            }))
            .await
            .unwrap();
    }

    let received = receiver.receive_file().await.unwrap();
    assert_eq!(received.data, data);
    assert_eq!(received.hash, sha256_hex(&data));
}

#[tokio::test]
async fn test_receiver_ignores_junk_frames() {
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let data = vec![5u8; 64];
    let meta = metadata_for(&data, 64);
    feeder.send(b"not json at all".to_vec()).await.unwrap();
    feeder
        .send(encode(&ChannelFrame::FileMetadata {
            metadata: meta.clone(),
        }))
        .await
        .unwrap();
    feeder.send(b"{\"type\":\"bogus\"}".to_vec()).await.unwrap();
    feeder
        .send(encode(&ChannelFrame::FileChunk {
            chunk: FileChunk {
                chunk_index: 0,
                data: data.clone(),
                is_last: true,
            },
        }))
        .await
        .unwrap();

    let received = receiver.receive_file().await.unwrap();
    assert_eq!(received.data, data);
}

#[tokio::test]
async fn test_zero_byte_file_completes_at_metadata() {
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let meta = metadata_for(&[], 64);
    assert_eq!(meta.total_chunks, 0);
    feeder
        .send(encode(&ChannelFrame::FileMetadata { metadata: meta }))
        .await
        .unwrap();

    let received = receiver.receive_file().await.unwrap();
    assert!(received.data.is_empty());
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_oversize_file_rejected_before_any_frame() {
    let (sender_ch, mut peer) = DirectChannel::pair();
    let config = TransferConfig {
        chunk_size: 64,
        max_file_size: 128,
        ..TransferConfig::default()
    };
    let (mut sender, _events) = TransferSession::new(config);
    sender.initialize(Role::Sender, sender_ch).unwrap();

    let file = OutboundFile::new("big.bin", "application/octet-stream", vec![0u8; 129]);
    let err = sender.send_file(&file).await.unwrap_err();
    assert!(matches!(
        err,
        windrop::error::TransferError::FileTooLarge { size: 129, max: 128 }
    ));
    assert!(peer.try_recv().is_none(), "no frame may precede the size gate");
}

#[tokio::test]
async fn test_send_times_out_on_unopened_channel() {
    let config = TransferConfig {
        channel_open_timeout: Duration::from_millis(50),
        ..TransferConfig::default()
    };
    let (mut sender, _events) = TransferSession::new(config);
    sender.initialize(Role::Sender, DirectChannel::pending()).unwrap();

    let file = OutboundFile::new("f.bin", "application/octet-stream", vec![1u8; 8]);
    let err = sender.send_file(&file).await.unwrap_err();
    assert!(matches!(
        err,
        windrop::error::TransferError::NegotiationTimeout
    ));
    assert_eq!(sender.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_receiver_fails_on_corrupt_transfer() {
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let data = vec![7u8; 64];
    let meta = metadata_for(&data, 64);
    feeder
        .send(encode(&ChannelFrame::FileMetadata { metadata: meta }))
        .await
        .unwrap();
    feeder
        .send(encode(&ChannelFrame::FileChunk {
            chunk: FileChunk {
                chunk_index: 0,
                data: vec![8u8; 64],
                is_last: true,
            },
        }))
        .await
        .unwrap();

    let err = receiver.receive_file().await.unwrap_err();
    assert!(matches!(
        err,
        windrop::error::TransferError::IntegrityMismatch { .. }
    ));
    assert_eq!(receiver.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_receiver_fails_when_transport_closes_mid_transfer() {
    let (feeder, receiver_ch) = DirectChannel::pair();
    let (mut receiver, _events) = TransferSession::new(small_chunks());
    receiver.initialize(Role::Receiver, receiver_ch).unwrap();

    let data = vec![3u8; 200];
    let meta = metadata_for(&data, 64);
    feeder
        .send(encode(&ChannelFrame::FileMetadata { metadata: meta }))
        .await
        .unwrap();
    feeder
        .send(encode(&ChannelFrame::FileChunk {
            chunk: FileChunk {
                chunk_index: 0,
                data: data[..64].to_vec(),
                is_last: false,
            },
        }))
        .await
        .unwrap();
    drop(feeder);

    let err = receiver.receive_file().await.unwrap_err();
    assert!(matches!(
        err,
        windrop::error::TransferError::TransportClosed
    ));
}
