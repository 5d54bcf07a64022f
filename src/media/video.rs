//! Video and screen-share fan-out
//!
//! One UDP socket carries both stream kinds. Chunks are reassembled per
//! `(sender, kind)`; a completed frame is re-chunked and sent to every
//! other participant whose endpoint was learned for the same kind. No
//! retransmission: a lost chunk costs the whole frame and nothing else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::media::assembler::FrameAssembler;
use crate::protocol::datagram::{chunk_frame, StreamKind, VideoChunk};
use crate::protocol::messages::Uid;

/// Drop a peer after this long without datagrams
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// How often stale peers are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct VideoPeer {
    addr: SocketAddr,
    last_seen: Instant,
    assembler: FrameAssembler,
}

type PeerMap = Arc<Mutex<HashMap<(Uid, StreamKind), VideoPeer>>>;

/// UDP fan-out for webcam and screen-share frames
pub struct VideoRelay {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
}

impl VideoRelay {
    /// Bind the video socket; a bind failure is fatal for the server
    pub async fn bind(config: &HubConfig) -> Result<Self> {
        let addr = config.video_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| HubError::config(format!("cannot bind video socket {}: {}", addr, e)))?;
        info!(addr = %socket.local_addr()?, "video socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Actual bound address (for ephemeral test ports)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run ingress and the stale-peer sweep until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let ingress = tokio::spawn(ingress_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.peers),
            cancel.child_token(),
        ));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&self.peers), cancel.child_token()));

        let _ = tokio::join!(ingress, sweeper);
        info!("video relay stopped");
        Ok(())
    }
}

async fn ingress_loop(socket: Arc<UdpSocket>, peers: PeerMap, cancel: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (n, src) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "video receive failed");
                    continue;
                }
            }
        };
        let chunk = match VideoChunk::decode(&buf[..n]) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!(%src, error = %e, "dropping bad video datagram");
                continue;
            }
        };

        let sender_uid = chunk.sender_uid;
        let kind = chunk.kind;
        let frame_id = chunk.frame_id;

        // Learn the endpoint, feed the assembler, and snapshot the fan-out
        // targets. The lock is released before any send.
        let (completed, targets) = {
            let mut peers = peers.lock().expect("video peer lock poisoned");
            let peer = peers.entry((sender_uid, kind)).or_insert_with(|| {
                debug!(uid = sender_uid, ?kind, %src, "video peer learned");
                VideoPeer {
                    addr: src,
                    last_seen: Instant::now(),
                    assembler: FrameAssembler::new(),
                }
            });
            peer.addr = src;
            peer.last_seen = Instant::now();
            let completed = peer.assembler.insert(chunk);

            let targets: Vec<SocketAddr> = if completed.is_some() {
                peers
                    .iter()
                    .filter(|((uid, peer_kind), _)| *peer_kind == kind && *uid != sender_uid)
                    .map(|(_, peer)| peer.addr)
                    .collect()
            } else {
                Vec::new()
            };
            (completed, targets)
        };

        if let Some(frame) = completed {
            relay_frame(&socket, sender_uid, kind, frame_id, &frame, &targets).await;
        }
    }
}

async fn relay_frame(
    socket: &UdpSocket,
    sender_uid: Uid,
    kind: StreamKind,
    frame_id: u32,
    frame: &Bytes,
    targets: &[SocketAddr],
) {
    if targets.is_empty() {
        return;
    }
    let chunks = chunk_frame(sender_uid, kind, frame_id, frame);
    trace!(
        uid = sender_uid,
        ?kind,
        frame_id,
        bytes = frame.len(),
        chunks = chunks.len(),
        viewers = targets.len(),
        "relaying frame"
    );
    for target in targets {
        for chunk in &chunks {
            if let Err(e) = socket.send_to(&chunk.encode(), target).await {
                trace!(%target, error = %e, "video send failed");
                break;
            }
        }
    }
}

async fn sweep_loop(peers: PeerMap, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let now = Instant::now();
        let mut peers = peers.lock().expect("video peer lock poisoned");
        peers.retain(|(uid, kind), peer| {
            let alive = now.duration_since(peer.last_seen) <= PEER_TIMEOUT;
            if !alive {
                debug!(uid = *uid, ?kind, "video peer timed out");
            }
            alive
        });
    }
}
