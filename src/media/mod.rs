//! Real-time media subsystems
//!
//! Audio arrives as Opus datagrams, gets decoded, jitter-buffered, mixed
//! on a 40 ms tick, and fanned back out with a personalized mix per
//! listener. Video and screen frames arrive as JPEG chunks, get
//! reassembled, and are rebroadcast to every other participant. Both
//! planes are best-effort: damaged or late traffic is dropped, never
//! retransmitted.

pub mod assembler;
pub mod audio;
pub mod codec;
pub mod jitter;
pub mod video;

pub use audio::AudioMixEngine;
pub use video::VideoRelay;
