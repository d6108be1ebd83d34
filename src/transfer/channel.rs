//! The direct transport seam.
//!
//! A [`DirectChannel`] is what a transfer session speaks over once signaling
//! has done its job: an outbound sink and inbound stream of opaque frames plus
//! an "open" signal. The WebRTC layer bridges a real data channel into one of
//! these; tests wire two of them back to back in memory.

use crate::error::TransferError;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Frames queued toward the transport before backpressure kicks in.
const OUTBOUND_BUFFER: usize = 64;

/// Point-to-point framed byte channel with an open/closed state.
pub struct DirectChannel {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    open: watch::Receiver<bool>,
    /// Sticky: once the transport reports closed it never reopens, even if
    /// the callback holding the inbound sender is still alive.
    closed: bool,
    // Keeps the far ends of a detached test channel alive.
    _guard: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl DirectChannel {
    pub fn new(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        open: watch::Receiver<bool>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            open,
            closed: false,
            _guard: None,
        }
    }

    /// Two channels wired back to back, both already open. Frames sent on one
    /// side arrive on the other in order.
    pub fn pair() -> (DirectChannel, DirectChannel) {
        let (a_tx, a_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(OUTBOUND_BUFFER);
        // A dropped watch sender keeps reporting its last value, so a
        // constant-true watch needs no live sender.
        let (open_tx, open_rx) = watch::channel(true);
        drop(open_tx);
        (
            DirectChannel::new(a_tx, b_rx, open_rx.clone()),
            DirectChannel::new(b_tx, a_rx, open_rx),
        )
    }

    /// A channel that never opens and never delivers, for timeout paths.
    pub fn pending() -> DirectChannel {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (open_tx, open_rx) = watch::channel(false);
        let mut ch = DirectChannel::new(out_tx, in_rx, open_rx);
        ch._guard = Some(Box::new((open_tx, out_rx, in_tx)));
        ch
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the transport reports open, bounded by `timeout`.
    pub async fn wait_open(&mut self, timeout: Duration) -> Result<(), TransferError> {
        if *self.open.borrow() {
            return Ok(());
        }
        let opened = async {
            while self.open.changed().await.is_ok() {
                if *self.open.borrow() {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(timeout, opened).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransferError::TransportClosed),
            Err(_) => Err(TransferError::NegotiationTimeout),
        }
    }

    /// Queue one frame toward the peer. Applies backpressure when the
    /// transport-side pump falls behind.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransferError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransferError::TransportClosed)
    }

    /// Next inbound frame, or `None` once the transport has closed. Frames
    /// already queued when the transport closes are still delivered before
    /// the first `None`; after that every call returns `None`.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.closed {
                return self.inbound.try_recv().ok();
            }
            tokio::select! {
                biased;
                frame = self.inbound.recv() => return frame,
                changed = self.open.changed() => {
                    if changed.is_err() {
                        // Open-state publisher is gone; the inbound queue
                        // alone decides when we are done.
                        return self.inbound.recv().await;
                    }
                    if !*self.open.borrow() {
                        self.closed = true;
                    }
                }
            }
        }
    }

    /// Non-blocking inbound poll, used by tests to assert nothing was sent.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (a, mut b) = DirectChannel::pair();
        a.send(b"one".to_vec()).await.unwrap();
        a.send(b"two".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn pair_is_open_immediately() {
        let (mut a, _b) = DirectChannel::pair();
        assert!(a.is_open());
        a.wait_open(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn pending_channel_times_out() {
        let mut ch = DirectChannel::pending();
        let err = ch.wait_open(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransferError::NegotiationTimeout));
    }

    #[tokio::test]
    async fn recv_none_after_peer_drop() {
        let (a, mut b) = DirectChannel::pair();
        drop(a);
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_drains_queued_frame_then_reports_closed() {
        // Mirrors a real transport: the inbound sender lives inside the
        // on-message callback and survives the close notification.
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (open_tx, open_rx) = watch::channel(true);
        let mut ch = DirectChannel::new(out_tx, in_rx, open_rx);

        in_tx.send(b"tail".to_vec()).await.unwrap();
        open_tx.send(false).unwrap();

        assert_eq!(ch.recv().await.unwrap(), b"tail");
        let next = tokio::time::timeout(Duration::from_millis(100), ch.recv())
            .await
            .expect("recv hung on a closed channel");
        assert!(next.is_none());
        drop(in_tx);
    }
}
