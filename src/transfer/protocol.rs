//! Data channel transfer protocol: metadata, chunk framing, hashing.
//!
//! Frames are JSON text messages on the direct channel, kept byte-compatible
//! with the browser implementation this interoperates with: chunk payloads
//! travel as JSON byte arrays and field names stay camelCase.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default per-file size limit: 50 MiB. The whole file is buffered and hashed
/// in memory before the first chunk goes out, so the limit is load-bearing.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Announced once per transfer, before the first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    /// Hex-encoded SHA-256 over the raw file bytes.
    pub hash: String,
}

/// One slice of the file. Every chunk except the last is exactly the
/// configured chunk size; `is_last` holds iff `chunk_index == total_chunks - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    #[serde(rename = "chunkIndex")]
    pub chunk_index: u32,
    pub data: Vec<u8>,
    #[serde(rename = "isLast")]
    pub is_last: bool,
}

/// Everything that travels over the direct channel during a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    FileMetadata { metadata: FileMetadata },
    FileChunk { chunk: FileChunk },
    /// Advisory end-of-transfer sentinel. Completion on the receiving side is
    /// driven by the chunk count, never by this frame.
    FileComplete,
}

/// `ceil(size / chunk_size)`.
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Format bytes for human-readable display.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_is_ceiling() {
        assert_eq!(total_chunks(0, 64), 0);
        assert_eq!(total_chunks(1, 64), 1);
        assert_eq!(total_chunks(64, 64), 1);
        assert_eq!(total_chunks(65, 64), 2);
        assert_eq!(total_chunks(2048, 64), 32);
        assert_eq!(total_chunks(50 * 1024 * 1024, DEFAULT_CHUNK_SIZE), 800);
    }

    #[test]
    fn frame_wire_shape_matches_browser_peer() {
        let frame = ChannelFrame::FileChunk {
            chunk: FileChunk {
                chunk_index: 3,
                data: vec![1, 2, 255],
                is_last: false,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(json["type"], "file_chunk");
        assert_eq!(json["chunk"]["chunkIndex"], 3);
        assert_eq!(json["chunk"]["data"], serde_json::json!([1, 2, 255]));
        assert_eq!(json["chunk"]["isLast"], false);

        let meta = ChannelFrame::FileMetadata {
            metadata: FileMetadata {
                name: "report.pdf".into(),
                size: 100,
                mime_type: "application/pdf".into(),
                total_chunks: 2,
                hash: sha256_hex(b"x"),
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();
        assert_eq!(json["type"], "file_metadata");
        assert_eq!(json["metadata"]["totalChunks"], 2);
        assert_eq!(json["metadata"]["type"], "application/pdf");

        let done: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ChannelFrame::FileComplete).unwrap())
                .unwrap();
        assert_eq!(done["type"], "file_complete");
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn format_bytes_ranges() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(50 * 1024 * 1024), "50.00 MB");
    }
}
