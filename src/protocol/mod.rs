//! Wire formats for the conferencing hub
//!
//! The control plane speaks line-delimited JSON over TCP; the media planes
//! speak fixed-header binary datagrams over UDP.
//!
//! - [`framing`]: incremental LF-delimited line scanner with a size cap
//! - [`messages`]: typed control messages, tagged by the `type` field
//! - [`datagram`]: audio and video datagram headers and the frame chunker

pub mod datagram;
pub mod framing;
pub mod messages;

pub use datagram::{AudioPacket, StreamKind, VideoChunk};
pub use framing::LineCodec;
pub use messages::{ClientMessage, ParseError, ServerMessage, Uid};
