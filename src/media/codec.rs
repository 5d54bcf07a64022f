//! Audio codec seam
//!
//! The mix engine treats the codec as an opaque collaborator behind these
//! wrappers. The hub speaks 48 kHz mono Opus in 40 ms frames; a decoded
//! frame is always [`SAMPLES_PER_FRAME`] samples of `i16` PCM.

use opus::{Application, Bitrate, Channels};

use crate::error::Result;

/// Sample rate shared by every participant
pub const SAMPLE_RATE: u32 = 48_000;

/// Frame duration driving the mix tick
pub const FRAME_DURATION_MS: u64 = 40;

/// Decoded samples per mono frame (48 kHz * 40 ms)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Mixed-output bitrate
pub const OPUS_BITRATE: i32 = 64_000;

/// Upper bound for one encoded frame
const MAX_PACKET_SIZE: usize = 4000;

/// Stateful per-sender Opus decoder
pub struct AudioDecoder {
    inner: opus::Decoder,
}

impl AudioDecoder {
    /// Create a mono decoder at the hub sample rate
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: opus::Decoder::new(SAMPLE_RATE, Channels::Mono)?,
        })
    }

    /// Decode one frame; output is zero-padded to a full frame
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        let decoded = self.inner.decode(payload, &mut pcm, false)?;
        pcm.truncate(decoded);
        pcm.resize(SAMPLES_PER_FRAME, 0);
        Ok(pcm)
    }
}

/// Stateful per-listener Opus encoder for mixed output
pub struct AudioEncoder {
    inner: opus::Encoder,
}

impl AudioEncoder {
    /// Create a VoIP-tuned mono encoder at the hub sample rate
    pub fn new() -> Result<Self> {
        let mut inner = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
        inner.set_bitrate(Bitrate::Bits(OPUS_BITRATE))?;
        Ok(Self { inner })
    }

    /// Encode one full PCM frame
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        Ok(self.inner.encode_vec(pcm, MAX_PACKET_SIZE)?)
    }
}
