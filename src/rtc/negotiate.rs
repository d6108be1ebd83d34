//! Offer/answer negotiation over the signaling relay.
//!
//! [`dial`] runs the initiator side: open a data channel, send an offer to
//! the remote peer, absorb the answer and trickled ICE candidates. [`accept`]
//! runs the responder side: wait for an offer, answer it, and hand back the
//! data channel the initiator opened. Both return a [`DirectChannel`] ready
//! for a transfer session.

use anyhow::{Context, Result};
use tokio::time::{timeout, Duration};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::TransferError;
use crate::rtc::peer::{bridge_data_channel, PeerConnection, DATA_CHANNEL_LABEL};
use crate::signaling::{MessageType, SignalingClient, SignalingMessage};
use crate::transfer::DirectChannel;

/// How long to wait for the remote side during negotiation.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Initiate a connection to `remote`. Resolves once the answer is in; the
/// returned channel still has to finish ICE and report open before frames
/// flow, which the transfer session waits for.
pub async fn dial(signaling: &SignalingClient, remote: &str) -> Result<(PeerConnection, DirectChannel)> {
    let mut answer_rx = signaling.subscribe(MessageType::Answer);
    let mut error_rx = signaling.subscribe(MessageType::Error);
    let remote_candidates = signaling.subscribe(MessageType::IceCandidate);

    let mut peer = PeerConnection::new().await?;
    spawn_local_candidate_forwarder(&mut peer, signaling.clone(), remote.to_string());

    let dc = peer.create_data_channel(DATA_CHANNEL_LABEL).await?;
    let channel = bridge_data_channel(dc);

    let offer = peer.create_offer().await?;
    peer.set_local_description(offer.clone()).await?;
    signaling
        .send_offer(remote, serde_json::to_value(&offer)?)
        .await?;
    log::info!("Sent offer to {}", remote);

    let answer = timeout(NEGOTIATION_TIMEOUT, async {
        loop {
            tokio::select! {
                msg = answer_rx.recv() => {
                    match msg {
                        Some(msg) => return Ok(msg),
                        None => return Err(TransferError::TransportClosed),
                    }
                }
                err = error_rx.recv() => {
                    if let Some(err) = err {
                        let detail = err
                            .message
                            .unwrap_or_else(|| "peer not available".to_string());
                        return Err(TransferError::PeerUnavailable(detail));
                    }
                }
            }
        }
    })
    .await
    .map_err(|_| TransferError::NegotiationTimeout)??;

    let sdp = serde_json::from_value(answer.data)
        .map_err(|e| TransferError::InvalidFrame(format!("answer from {}: {}", answer.from, e)))?;
    peer.set_remote_description(sdp).await?;
    peer.spawn_remote_candidate_adder(remote_candidates);
    log::info!("Received answer from {}", answer.from);

    Ok((peer, channel))
}

/// Wait for an incoming offer, answer it, and return the remote-opened data
/// channel along with the offering peer's address.
pub async fn accept(signaling: &SignalingClient) -> Result<(PeerConnection, DirectChannel, String)> {
    let mut offer_rx = signaling.subscribe(MessageType::Offer);
    let remote_candidates = signaling.subscribe(MessageType::IceCandidate);

    let offer = offer_rx
        .recv()
        .await
        .context("Signaling connection closed while waiting for an offer")?;
    let remote = offer.from.clone();
    log::info!("Received offer from {}", remote);

    // Reject a bad payload before standing up any transport state.
    let sdp: RTCSessionDescription = serde_json::from_value(offer.data)
        .map_err(|e| TransferError::InvalidFrame(format!("offer from {}: {}", remote, e)))?;

    let mut peer = PeerConnection::new().await?;
    spawn_local_candidate_forwarder(&mut peer, signaling.clone(), remote.clone());

    let mut incoming = peer
        .take_incoming_channel_rx()
        .ok_or(TransferError::AlreadyInitialized)?;

    peer.set_remote_description(sdp).await?;
    peer.spawn_remote_candidate_adder(remote_candidates);

    let answer = peer.create_answer().await?;
    peer.set_local_description(answer.clone()).await?;
    signaling
        .send_answer(&remote, serde_json::to_value(&answer)?)
        .await?;
    log::info!("Sent answer to {}", remote);

    let dc = timeout(NEGOTIATION_TIMEOUT, incoming.recv())
        .await
        .map_err(|_| TransferError::NegotiationTimeout)?
        .ok_or(TransferError::TransportClosed)?;
    let channel = bridge_data_channel(dc);

    Ok((peer, channel, remote))
}

/// Push locally gathered ICE candidates to the remote peer as they appear.
fn spawn_local_candidate_forwarder(
    peer: &mut PeerConnection,
    signaling: SignalingClient,
    remote: String,
) {
    let Some(mut ice_rx) = peer.take_ice_candidate_rx() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(candidate) = ice_rx.recv().await {
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    log::warn!("Failed to serialize ICE candidate: {}", e);
                    continue;
                }
            };
            let data = match serde_json::to_value(&init) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("Failed to encode ICE candidate: {}", e);
                    continue;
                }
            };
            if let Err(e) = signaling.send_ice_candidate(&remote, data).await {
                log::warn!("Failed to send ICE candidate to {}: {}", remote, e);
                break;
            }
        }
    });
}
