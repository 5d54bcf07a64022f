//! Chunked frame reassembly
//!
//! One assembler per `(sender, stream kind)` pair. Chunks are placed into
//! preallocated slots; a frame completes when every slot is filled.
//! Partial frames are discarded after [`PARTIAL_FRAME_TTL`], and frames
//! more than [`FRAME_ID_WINDOW`] behind the newest seen id are dropped to
//! bound memory.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// How long a partial frame may wait for its missing chunks
pub const PARTIAL_FRAME_TTL: Duration = Duration::from_millis(500);

/// Frames older than `latest - FRAME_ID_WINDOW` are discarded
pub const FRAME_ID_WINDOW: u32 = 8;

use crate::protocol::datagram::VideoChunk;

#[derive(Debug)]
struct PartialFrame {
    total: u16,
    chunks: Vec<Option<Bytes>>,
    received: u16,
    first_seen: Instant,
}

/// Reassembles one sender's chunked frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    partials: HashMap<u32, PartialFrame>,
    latest: u32,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk; returns the full frame bytes once complete
    pub fn insert(&mut self, chunk: VideoChunk) -> Option<Bytes> {
        self.prune(Instant::now());

        if chunk.frame_id > self.latest {
            self.latest = chunk.frame_id;
            let floor = self.latest.saturating_sub(FRAME_ID_WINDOW);
            self.partials.retain(|&id, _| id >= floor);
        } else if chunk.frame_id < self.latest.saturating_sub(FRAME_ID_WINDOW) {
            return None;
        }

        let partial = self
            .partials
            .entry(chunk.frame_id)
            .or_insert_with(|| PartialFrame {
                total: chunk.chunk_total,
                chunks: vec![None; chunk.chunk_total as usize],
                received: 0,
                first_seen: Instant::now(),
            });

        // A sender that changes its chunk count mid-frame is hopeless
        if partial.total != chunk.chunk_total {
            self.partials.remove(&chunk.frame_id);
            return None;
        }

        let index = chunk.chunk_index as usize;
        if partial.chunks[index].is_none() {
            partial.chunks[index] = Some(chunk.payload);
            partial.received += 1;
        }

        if partial.received == partial.total {
            let partial = self.partials.remove(&chunk.frame_id)?;
            let mut frame = Vec::new();
            for piece in partial.chunks.into_iter().flatten() {
                frame.extend_from_slice(&piece);
            }
            return Some(Bytes::from(frame));
        }
        None
    }

    /// Drop partial frames that outlived the TTL
    pub fn prune(&mut self, now: Instant) {
        self.partials
            .retain(|_, partial| now.duration_since(partial.first_seen) <= PARTIAL_FRAME_TTL);
    }

    /// Number of incomplete frames currently buffered
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::datagram::StreamKind;

    fn chunk(frame_id: u32, index: u16, total: u16, payload: &[u8]) -> VideoChunk {
        VideoChunk {
            sender_uid: 1,
            kind: StreamKind::Webcam,
            frame_id,
            chunk_index: index,
            chunk_total: total,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_complete_in_order() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(1, 0, 3, b"aa")).is_none());
        assert!(assembler.insert(chunk(1, 1, 3, b"bb")).is_none());
        let frame = assembler.insert(chunk(1, 2, 3, b"cc")).unwrap();
        assert_eq!(&frame[..], b"aabbcc");
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_complete_out_of_order() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(4, 2, 3, b"cc")).is_none());
        assert!(assembler.insert(chunk(4, 0, 3, b"aa")).is_none());
        let frame = assembler.insert(chunk(4, 1, 3, b"bb")).unwrap();
        assert_eq!(&frame[..], b"aabbcc");
    }

    #[test]
    fn test_duplicate_chunks_ignored() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(1, 0, 2, b"xx")).is_none());
        assert!(assembler.insert(chunk(1, 0, 2, b"yy")).is_none());
        let frame = assembler.insert(chunk(1, 1, 2, b"zz")).unwrap();
        assert_eq!(&frame[..], b"xxzz", "first copy of a chunk wins");
    }

    #[test]
    fn test_single_chunk_frame() {
        let mut assembler = FrameAssembler::new();
        let frame = assembler.insert(chunk(9, 0, 1, b"whole")).unwrap();
        assert_eq!(&frame[..], b"whole");
    }

    #[test]
    fn test_old_frame_ids_dropped() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(100, 0, 2, b"aa")).is_none());
        // A frame far behind the newest id is ignored outright
        assert!(assembler.insert(chunk(100 - FRAME_ID_WINDOW - 1, 0, 1, b"zz")).is_none());
        assert_eq!(assembler.pending(), 1);
        // And an advancing id evicts out-of-window partials
        assert!(assembler.insert(chunk(200, 0, 2, b"bb")).is_none());
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_mismatched_total_discards_frame() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(5, 0, 3, b"aa")).is_none());
        assert!(assembler.insert(chunk(5, 1, 4, b"bb")).is_none());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_stale_partials_pruned() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.insert(chunk(1, 0, 2, b"aa")).is_none());
        assert_eq!(assembler.pending(), 1);

        let later = Instant::now() + PARTIAL_FRAME_TTL + Duration::from_millis(50);
        assembler.prune(later);
        assert_eq!(assembler.pending(), 0);

        // The late half of the pruned frame starts a fresh partial
        assert!(assembler.insert(chunk(1, 1, 2, b"bb")).is_none());
        assert_eq!(assembler.pending(), 1);
    }
}
