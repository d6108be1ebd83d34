use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use windrop::peer_id::{generate_peer_id, is_valid_peer_id};
use windrop::rtc;
use windrop::signaling::{FileTransferRequest, MessageType, SignalingClient, SignalingRelay};
use windrop::transfer::{
    format_bytes, sha256_hex, total_chunks, FileMetadata, OutboundFile, Role, TransferConfig,
    TransferEvent, TransferSession, DEFAULT_CHUNK_SIZE,
};

const DEFAULT_SERVER: &str = "ws://127.0.0.1:8080";
const DEFAULT_RELAY_PORT: u16 = 8080;

#[derive(Parser)]
#[command(name = "windrop")]
#[command(about = "Peer-to-peer file transfer over WebRTC")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay server
    Relay {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },

    /// Send a file to a peer
    Send {
        /// Path to the file
        path: PathBuf,

        /// Recipient peer identifier
        #[arg(long)]
        to: String,

        /// Signaling relay URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,

        /// Local peer identifier (generated if omitted)
        #[arg(long)]
        from: Option<String>,
    },

    /// Wait for an incoming file
    Receive {
        /// Signaling relay URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,

        /// Local peer identifier (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Output directory (default: current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Relay { port } => {
            let relay = SignalingRelay::new();
            relay.run(&format!("0.0.0.0:{}", port)).await?;
        }

        Commands::Send {
            path,
            to,
            server,
            from,
        } => {
            if !path.is_file() {
                anyhow::bail!("Path is not a file: {}", path.display());
            }
            if !is_valid_peer_id(&to) {
                anyhow::bail!("Invalid recipient identifier: {}", to);
            }
            let from = local_id(from)?;
            send_file(&path, &to, &server, &from).await?;
        }

        Commands::Receive { server, id, output } => {
            if let Some(ref dir) = output {
                if !dir.is_dir() {
                    anyhow::bail!("Output directory does not exist: {}", dir.display());
                }
            }
            let id = local_id(id)?;
            receive_file(&server, &id, output).await?;
        }
    }

    Ok(())
}

fn local_id(explicit: Option<String>) -> Result<String> {
    match explicit {
        Some(id) => {
            if !is_valid_peer_id(&id) {
                anyhow::bail!("Invalid peer identifier: {}", id);
            }
            Ok(id)
        }
        None => Ok(generate_peer_id()),
    }
}

async fn send_file(path: &Path, to: &str, server: &str, from: &str) -> Result<()> {
    let file = OutboundFile::from_path(path).await?;
    let config = TransferConfig::default();
    if file.data.len() as u64 > config.max_file_size {
        anyhow::bail!(
            "File too large: {} (limit {})",
            format_bytes(file.data.len() as u64),
            format_bytes(config.max_file_size)
        );
    }

    eprintln!("Your peer id: {}", from);
    eprintln!("Connecting to {}...", server);
    let signaling = SignalingClient::connect(server, from).await?;
    let mut response_rx = signaling.subscribe(MessageType::FileResponse);

    let metadata = FileMetadata {
        name: file.name.clone(),
        size: file.data.len() as u64,
        mime_type: file.mime_type.clone(),
        total_chunks: total_chunks(file.data.len() as u64, DEFAULT_CHUNK_SIZE),
        hash: sha256_hex(&file.data),
    };
    let request = FileTransferRequest {
        file_id: Uuid::new_v4().to_string(),
        sender: from.to_string(),
        recipient: to.to_string(),
        file_metadata: metadata,
    };

    eprintln!(
        "Offering {} ({}) to {}...",
        file.name,
        format_bytes(file.data.len() as u64),
        to
    );
    signaling.send_file_request(&request).await?;

    let response = response_rx
        .recv()
        .await
        .context("Signaling connection closed while waiting for a response")?;
    let accepted = response
        .data
        .get("accepted")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if !accepted {
        signaling.disconnect().await;
        anyhow::bail!("{} declined the transfer", to);
    }
    eprintln!("{} accepted, negotiating direct connection...", to);

    let (peer, channel) = rtc::dial(&signaling, to).await?;

    let (mut session, events) = TransferSession::new(TransferConfig::default());
    session.initialize(Role::Sender, channel)?;
    let printer = tokio::spawn(print_events(events));

    let result = session.send_file(&file).await;
    let _ = printer.await;
    peer.close().await?;
    signaling.disconnect().await;
    result?;

    eprintln!("Sent {} to {}", file.name, to);
    Ok(())
}

async fn receive_file(server: &str, id: &str, output: Option<PathBuf>) -> Result<()> {
    eprintln!("Your peer id: {}", id);
    eprintln!("Connecting to {}...", server);
    let signaling = SignalingClient::connect(server, id).await?;
    let mut request_rx = signaling.subscribe(MessageType::FileRequest);

    eprintln!("Waiting for an incoming file...");
    let request_msg = request_rx
        .recv()
        .await
        .context("Signaling connection closed while waiting for a request")?;
    let request: FileTransferRequest =
        serde_json::from_value(request_msg.data).context("Malformed file transfer request")?;

    eprintln!(
        "{} wants to send {} ({})",
        request.sender,
        request.file_metadata.name,
        format_bytes(request.file_metadata.size)
    );
    signaling
        .send_file_response(&request.sender, &request.file_id, true)
        .await?;

    let (peer, channel, remote) = rtc::accept(&signaling).await?;
    log::info!("Negotiated direct channel with {}", remote);

    let (mut session, events) = TransferSession::new(TransferConfig::default());
    session.initialize(Role::Receiver, channel)?;
    let printer = tokio::spawn(print_events(events));

    let result = session.receive_file().await;
    let _ = printer.await;
    peer.close().await?;
    signaling.disconnect().await;
    let file = result?;

    let dir = output.unwrap_or_else(|| PathBuf::from("."));
    let dest = available_path(&dir, &file.name);
    tokio::fs::write(&dest, &file.data)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;
    eprintln!(
        "Received {} ({}) -> {}",
        file.name,
        format_bytes(file.data.len() as u64),
        dest.display()
    );
    Ok(())
}

/// Print status lines and a carriage-return progress meter to stderr.
async fn print_events(mut events: mpsc::Receiver<TransferEvent>) {
    let mut progressing = false;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Status(text) => {
                if progressing {
                    eprintln!();
                    progressing = false;
                }
                eprintln!("{}", text);
            }
            TransferEvent::Progress(pct) => {
                eprint!("\r   Progress: {:.1}%", pct);
                let _ = std::io::stderr().flush();
                progressing = true;
            }
        }
    }
    if progressing {
        eprintln!();
    }
}

/// First non-existing variant of `name` in `dir`: `file.txt`, `file (1).txt`,
/// `file (2).txt`, ...
fn available_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1u32.. {
        let variant = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(variant);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_path_increments_until_free() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            available_path(dir.path(), "a.txt"),
            dir.path().join("a.txt")
        );
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "a.txt"),
            dir.path().join("a (1).txt")
        );
        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "a.txt"),
            dir.path().join("a (2).txt")
        );
    }

    #[test]
    fn available_path_handles_extensionless_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LICENSE"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "LICENSE"),
            dir.path().join("LICENSE (1)")
        );
    }
}
