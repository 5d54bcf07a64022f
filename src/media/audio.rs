//! Audio mix engine
//!
//! Ingress decodes each participant's Opus datagrams into its jitter slot;
//! a single 40 ms tick task pops one frame per participant, sums a global
//! mix, and sends every listener a personalized mix with its own signal
//! and its muted peers subtracted. Mixing is serialized in the tick task;
//! ingress runs concurrently under per-slot locks, and the tick takes slot
//! locks in ascending uid order.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::media::codec::{AudioDecoder, AudioEncoder, FRAME_DURATION_MS, SAMPLES_PER_FRAME};
use crate::media::jitter::JitterSlot;
use crate::protocol::datagram::{AudioPacket, FLAG_SERVER_ORIGIN};
use crate::protocol::messages::Uid;

/// Drop a peer after this long without datagrams
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// How often stale peers are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct AudioPeer {
    addr: Mutex<SocketAddr>,
    last_seen: Mutex<Instant>,
    slot: Mutex<JitterSlot>,
    decoder: Mutex<AudioDecoder>,
    encoder: Mutex<AudioEncoder>,
    received: AtomicU64,
    dropped: AtomicU64,
}

type PeerMap = Arc<RwLock<HashMap<Uid, Arc<AudioPeer>>>>;
type MuteMap = Arc<RwLock<HashMap<Uid, HashSet<Uid>>>>;

/// UDP audio mixer
pub struct AudioMixEngine {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    mutes: MuteMap,
}

impl AudioMixEngine {
    /// Bind the audio socket; a bind failure is fatal for the server
    pub async fn bind(config: &HubConfig) -> Result<Self> {
        let addr = config.audio_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| HubError::config(format!("cannot bind audio socket {}: {}", addr, e)))?;
        info!(addr = %socket.local_addr()?, "audio socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            peers: Arc::new(RwLock::new(HashMap::new())),
            mutes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Actual bound address (for ephemeral test ports)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Silence or unsilence a peer in one listener's personal mix
    pub fn set_muted(&self, listener: Uid, peer: Uid, muted: bool) {
        let mut mutes = self.mutes.write().expect("mute lock poisoned");
        let set = mutes.entry(listener).or_default();
        if muted {
            set.insert(peer);
        } else {
            set.remove(&peer);
            if set.is_empty() {
                mutes.remove(&listener);
            }
        }
    }

    /// True when `peer` is silenced in `listener`'s mix
    pub fn is_muted(&self, listener: Uid, peer: Uid) -> bool {
        let mutes = self.mutes.read().expect("mute lock poisoned");
        mutes.get(&listener).is_some_and(|set| set.contains(&peer))
    }

    /// Number of known audio peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer lock poisoned").len()
    }

    /// Run ingress, the mix tick, and the stale-peer sweep until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let ingress = tokio::spawn(ingress_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.peers),
            cancel.child_token(),
        ));
        let mixer = tokio::spawn(mix_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.peers),
            Arc::clone(&self.mutes),
            cancel.child_token(),
        ));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&self.peers), cancel.child_token()));

        let _ = tokio::join!(ingress, mixer, sweeper);
        info!("audio engine stopped");
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
                    warn!(error = %e, "audio receive failed");
                    continue;
                }
            }
        };
        let packet = match AudioPacket::decode(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(%src, error = %e, "dropping bad audio datagram");
                continue;
            }
        };
        // Our own mixed output must never feed back into the mix
        if packet.is_server_origin() {
            continue;
        }

        let Some(peer) = lookup_or_create(&peers, packet.uid, src) else {
            continue;
        };
        *peer.addr.lock().expect("addr lock poisoned") = src;
        *peer.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();

        let decoded = {
            let mut decoder = peer.decoder.lock().expect("decoder lock poisoned");
            decoder.decode(&packet.payload)
        };
        match decoded {
            Ok(pcm) => {
                let inserted = peer
                    .slot
                    .lock()
                    .expect("slot lock poisoned")
                    .insert(packet.seq, pcm);
                if inserted {
                    peer.received.fetch_add(1, Ordering::Relaxed);
                } else {
                    peer.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                trace!(uid = packet.uid, error = %e, "audio decode failed");
                peer.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn lookup_or_create(peers: &PeerMap, uid: Uid, src: SocketAddr) -> Option<Arc<AudioPeer>> {
    {
        let peers = peers.read().expect("peer lock poisoned");
        if let Some(peer) = peers.get(&uid) {
            return Some(Arc::clone(peer));
        }
    }
    let decoder = match AudioDecoder::new() {
        Ok(d) => d,
        Err(e) => {
            warn!(uid, error = %e, "cannot create audio decoder");
            return None;
        }
    };
    let encoder = match AudioEncoder::new() {
        Ok(e) => e,
        Err(e) => {
            warn!(uid, error = %e, "cannot create audio encoder");
            return None;
        }
    };
    let peer = Arc::new(AudioPeer {
        addr: Mutex::new(src),
        last_seen: Mutex::new(Instant::now()),
        slot: Mutex::new(JitterSlot::new()),
        decoder: Mutex::new(decoder),
        encoder: Mutex::new(encoder),
        received: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    let mut peers = peers.write().expect("peer lock poisoned");
    let entry = peers.entry(uid).or_insert_with(|| Arc::clone(&peer));
    debug!(uid, %src, "audio peer learned");
    Some(Arc::clone(entry))
}

async fn mix_loop(
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    mutes: MuteMap,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    // A late tick coalesces into at most one catch-up tick
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        // Ascending uid order fixes the slot lock order
        let snapshot: Vec<(Uid, Arc<AudioPeer>)> = {
            let peers = peers.read().expect("peer lock poisoned");
            let mut entries: Vec<_> = peers.iter().map(|(u, p)| (*u, Arc::clone(p))).collect();
            entries.sort_by_key(|(uid, _)| *uid);
            entries
        };
        if snapshot.is_empty() {
            tick = tick.wrapping_add(1);
            continue;
        }

        let frames: Vec<Option<Vec<i16>>> = snapshot
            .iter()
            .map(|(_, peer)| peer.slot.lock().expect("slot lock poisoned").pop())
            .collect();
        let global = accumulate(&frames);
        let mute_snapshot: HashMap<Uid, HashSet<Uid>> =
            mutes.read().expect("mute lock poisoned").clone();

        for (idx, (uid, peer)) in snapshot.iter().enumerate() {
            let muted_set = mute_snapshot.get(uid);
            let muted_frames: Vec<&[i16]> = snapshot
                .iter()
                .enumerate()
                .filter(|(j, (peer_uid, _))| {
                    *j != idx && muted_set.is_some_and(|set| set.contains(peer_uid))
                })
                .filter_map(|(j, _)| frames[j].as_deref())
                .collect();

            let pcm = personalize(&global, frames[idx].as_deref(), &muted_frames);
            let payload = {
                let mut encoder = peer.encoder.lock().expect("encoder lock poisoned");
                match encoder.encode(&pcm) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(uid, error = %e, "mix encode failed");
                        continue;
                    }
                }
            };
            let packet = AudioPacket {
                uid: 0,
                seq: tick,
                flags: FLAG_SERVER_ORIGIN,
                payload: payload.into(),
            };
            let addr = *peer.addr.lock().expect("addr lock poisoned");
            if let Err(e) = socket.send_to(&packet.encode(), addr).await {
                trace!(uid, %addr, error = %e, "mix send failed");
            }
        }

        tick = tick.wrapping_add(1);
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
        let mut peers = peers.write().expect("peer lock poisoned");
        peers.retain(|uid, peer| {
            let last_seen = *peer.last_seen.lock().expect("last_seen lock poisoned");
            let alive = now.duration_since(last_seen) <= PEER_TIMEOUT;
            if !alive {
                debug!(
                    uid,
                    received = peer.received.load(Ordering::Relaxed),
                    dropped = peer.dropped.load(Ordering::Relaxed),
                    "audio peer timed out"
                );
            }
            alive
        });
    }
}

/// Sum the present frames into an i32 mix that cannot clip
pub(crate) fn accumulate(frames: &[Option<Vec<i16>>]) -> Vec<i32> {
    let mut mix = vec![0i32; SAMPLES_PER_FRAME];
    for frame in frames.iter().flatten() {
        for (acc, &sample) in mix.iter_mut().zip(frame.iter()) {
            *acc += sample as i32;
        }
    }
    mix
}

/// Subtract the listener's own frame and its muted peers, then hard-clip
pub(crate) fn personalize(global: &[i32], own: Option<&[i16]>, muted: &[&[i16]]) -> Vec<i16> {
    let mut out = Vec::with_capacity(global.len());
    for (i, &acc) in global.iter().enumerate() {
        let mut sample = acc;
        if let Some(own) = own {
            sample -= own[i] as i32;
        }
        for frame in muted {
            sample -= frame[i] as i32;
        }
        out.push(sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    }
    out
}
