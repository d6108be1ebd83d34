//! WebRTC peer connection wrapper.
//!
//! Wraps `RTCPeerConnection` so the rest of the crate never touches raw
//! callbacks: ICE candidates and incoming data channels arrive on channels,
//! and an open data channel is bridged into a [`DirectChannel`].

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signaling::SignalingMessage;
use crate::transfer::DirectChannel;

/// Google STUN server for NAT traversal.
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label used for the transfer data channel on both sides.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// One WebRTC peer connection with channel-plumbed callbacks.
pub struct PeerConnection {
    pc: Arc<RTCPeerConnection>,
    ice_candidate_rx: Option<mpsc::Receiver<RTCIceCandidate>>,
    incoming_channel_rx: Option<mpsc::Receiver<Arc<RTCDataChannel>>>,
}

impl PeerConnection {
    /// Create a peer connection configured with a public STUN server.
    pub async fn new() -> Result<Self> {
        let ice_servers = vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }];
        Self::with_ice_servers(ice_servers).await
    }

    pub async fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let (ice_tx, ice_candidate_rx) = mpsc::channel(50);
        let (dc_tx, incoming_channel_rx) = mpsc::channel(1);

        pc.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if ice_tx.send(candidate).await.is_err() {
                        log::warn!("ICE candidate receiver dropped");
                    }
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        log::info!("Peer connection established");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        log::warn!("Peer connection disconnected");
                    }
                    RTCPeerConnectionState::Failed => {
                        log::error!("Peer connection failed");
                    }
                    RTCPeerConnectionState::Closed => {
                        log::info!("Peer connection closed");
                    }
                    _ => {}
                }
            })
        }));

        pc.on_data_channel(Box::new(move |dc| {
            let dc_tx = dc_tx.clone();
            let label = dc.label().to_string();
            Box::pin(async move {
                if dc_tx.send(dc).await.is_err() {
                    log::warn!("Incoming data channel '{}' dropped", label);
                }
            })
        }));

        Ok(Self {
            pc,
            ice_candidate_rx: Some(ice_candidate_rx),
            incoming_channel_rx: Some(incoming_channel_rx),
        })
    }

    /// Take ownership of locally gathered ICE candidates (trickle ICE).
    pub fn take_ice_candidate_rx(&mut self) -> Option<mpsc::Receiver<RTCIceCandidate>> {
        self.ice_candidate_rx.take()
    }

    /// Take ownership of data channels opened by the remote side.
    pub fn take_incoming_channel_rx(&mut self) -> Option<mpsc::Receiver<Arc<RTCDataChannel>>> {
        self.incoming_channel_rx.take()
    }

    pub async fn create_data_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>> {
        self.pc
            .create_data_channel(label, None)
            .await
            .context("Failed to create data channel")
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.pc
            .create_offer(None)
            .await
            .context("Failed to create offer")
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.pc
            .create_answer(None)
            .await
            .context("Failed to create answer")
    }

    pub async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_local_description(sdp)
            .await
            .context("Failed to set local description")
    }

    pub async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(sdp)
            .await
            .context("Failed to set remote description")
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .context("Failed to add ICE candidate")
    }

    /// Drain remote ICE candidates from a signaling subscription into the
    /// connection. Call after the remote description is set; frames that
    /// queued up earlier are replayed in order.
    pub fn spawn_remote_candidate_adder(&self, mut rx: mpsc::Receiver<SignalingMessage>) {
        let pc = self.pc.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let init: RTCIceCandidateInit = match serde_json::from_value(msg.data) {
                    Ok(init) => init,
                    Err(e) => {
                        log::warn!("Malformed ICE candidate from {}: {}", msg.from, e);
                        continue;
                    }
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    log::warn!("Failed to add ICE candidate: {}", e);
                }
            }
        });
    }

    pub async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

/// Bridge a data channel into the transport seam the transfer session
/// expects: inbound messages and the open state become channels, and a pump
/// task drains queued outbound frames into the channel.
pub fn bridge_data_channel(dc: Arc<RTCDataChannel>) -> DirectChannel {
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(256);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let (open_tx, open_rx) = watch::channel(dc.ready_state() == RTCDataChannelState::Open);
    let open_tx = Arc::new(open_tx);

    let label = dc.label().to_string();
    {
        let open_tx = open_tx.clone();
        let label = label.clone();
        dc.on_open(Box::new(move || {
            log::info!("Data channel '{}' opened", label);
            let _ = open_tx.send(true);
            Box::pin(async {})
        }));
    }

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let in_tx = in_tx.clone();
        Box::pin(async move {
            if in_tx.send(msg.data.to_vec()).await.is_err() {
                log::warn!("Data channel message receiver dropped");
            }
        })
    }));

    {
        let label = label.clone();
        dc.on_error(Box::new(move |err| {
            log::error!("Data channel '{}' error: {}", label, err);
            Box::pin(async {})
        }));
    }

    {
        let open_tx = open_tx.clone();
        dc.on_close(Box::new(move || {
            log::info!("Data channel '{}' closed", label);
            let _ = open_tx.send(false);
            Box::pin(async {})
        }));
    }

    let pump_dc = dc.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = pump_dc.send(&Bytes::from(frame)).await {
                log::warn!("Data channel send failed: {}", e);
                break;
            }
        }
    });

    DirectChannel::new(out_tx, in_rx, open_rx)
}
