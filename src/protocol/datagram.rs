//! Media datagram formats
//!
//! Audio datagram:
//! ```text
//! +-----------+-----------+-----------+-----------+------------------+
//! | uid (u32) | seq (u32) | flags u32 | len (u32) | Opus payload     |
//! +-----------+-----------+-----------+-----------+------------------+
//! ```
//!
//! Video datagram: 24-byte header
//! `{sender_uid: u32, stream_kind: u8, frame_id: u32, chunk_index: u16,
//! chunk_total: u16, payload_len: u16, reserved: u8}` in that order,
//! zero-padded to 24 bytes, followed by a JPEG slice of at most
//! [`MAX_CHUNK_PAYLOAD`] bytes. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};

/// Audio header size: uid + seq + flags + length
pub const AUDIO_HEADER_SIZE: usize = 16;

/// Flag bit 0: datagram originates from the server (mixed output)
pub const FLAG_SERVER_ORIGIN: u32 = 1;

/// Video header size, including trailing padding
pub const VIDEO_HEADER_SIZE: usize = 24;

/// Maximum payload bytes per video chunk (MTU-safe)
pub const MAX_CHUNK_PAYLOAD: usize = 1400;

/// Upper bound on chunks per frame, bounding assembler memory
pub const MAX_CHUNKS_PER_FRAME: u16 = 512;

/// One audio datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub uid: u32,
    pub seq: u32,
    pub flags: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    /// True if this packet carries mixed output from the server
    pub fn is_server_origin(&self) -> bool {
        self.flags & FLAG_SERVER_ORIGIN != 0
    }

    /// Encode into a datagram buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.uid);
        buf.put_u32(self.seq);
        buf.put_u32(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from a received datagram
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < AUDIO_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "audio datagram shorter than header",
            ));
        }
        let mut cursor = Cursor::new(data);
        let uid = cursor.get_u32();
        let seq = cursor.get_u32();
        let flags = cursor.get_u32();
        let length = cursor.get_u32() as usize;
        let payload = &data[AUDIO_HEADER_SIZE..];
        if payload.len() != length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "audio payload length mismatch: header {}, actual {}",
                    length,
                    payload.len()
                ),
            ));
        }
        Ok(Self {
            uid,
            seq,
            flags,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Which media stream a video chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    Webcam = 0,
    Screen = 1,
}

impl StreamKind {
    /// Convert from the wire byte, `None` for unknown kinds
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamKind::Webcam),
            1 => Some(StreamKind::Screen),
            _ => None,
        }
    }
}

/// One chunk of a JPEG-encoded video or screen frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoChunk {
    pub sender_uid: u32,
    pub kind: StreamKind,
    pub frame_id: u32,
    pub chunk_index: u16,
    pub chunk_total: u16,
    pub payload: Bytes,
}

impl VideoChunk {
    /// Encode into a datagram buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VIDEO_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.sender_uid);
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.frame_id);
        buf.put_u16(self.chunk_index);
        buf.put_u16(self.chunk_total);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u8(0); // reserved
        buf.put_slice(&[0u8; VIDEO_HEADER_SIZE - 16]); // pad header to 24 bytes
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from a received datagram
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < VIDEO_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "video datagram shorter than header",
            ));
        }
        let mut cursor = Cursor::new(data);
        let sender_uid = cursor.get_u32();
        let kind_byte = cursor.get_u8();
        let frame_id = cursor.get_u32();
        let chunk_index = cursor.get_u16();
        let chunk_total = cursor.get_u16();
        let payload_len = cursor.get_u16() as usize;

        let kind = StreamKind::from_u8(kind_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown stream kind: {}", kind_byte),
            )
        })?;
        if chunk_total == 0 || chunk_total > MAX_CHUNKS_PER_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk total out of range: {}", chunk_total),
            ));
        }
        if chunk_index >= chunk_total {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk index {} >= total {}", chunk_index, chunk_total),
            ));
        }
        if payload_len > MAX_CHUNK_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk payload too large: {}", payload_len),
            ));
        }
        let payload = &data[VIDEO_HEADER_SIZE..];
        if payload.len() != payload_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "video payload length mismatch: header {}, actual {}",
                    payload_len,
                    payload.len()
                ),
            ));
        }
        Ok(Self {
            sender_uid,
            kind,
            frame_id,
            chunk_index,
            chunk_total,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Split a complete frame into MTU-safe chunks for rebroadcast
pub fn chunk_frame(sender_uid: u32, kind: StreamKind, frame_id: u32, frame: &[u8]) -> Vec<VideoChunk> {
    let total = frame.len().div_ceil(MAX_CHUNK_PAYLOAD).max(1) as u16;
    frame
        .chunks(MAX_CHUNK_PAYLOAD)
        .enumerate()
        .map(|(i, slice)| VideoChunk {
            sender_uid,
            kind,
            frame_id,
            chunk_index: i as u16,
            chunk_total: total,
            payload: Bytes::copy_from_slice(slice),
        })
        .collect()
}
