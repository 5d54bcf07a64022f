//! Huddle - LAN Conferencing Hub
//!
//! A single server coordinating chat, file exchange, mixed audio, and
//! video/screen sharing for clients on a local network.
//!
//! ## Planes
//!
//! - **Control** (TCP, line-delimited JSON): login, chat, presence, file
//!   offer/request signaling, presentation signaling
//! - **Audio** (UDP): per-participant Opus frames in, one personalized
//!   mix per listener out, on a 40 ms tick
//! - **Video/screen** (UDP): chunked JPEG frames reassembled and fanned
//!   out to every other participant
//! - **File transfer** (ephemeral TCP): raw bytes on short-lived
//!   single-transaction listeners
//!
//! ## Example
//!
//! ```rust,ignore
//! use huddle::{supervisor, HubConfig};
//!
//! #[tokio::main]
//! async fn main() -> huddle::Result<()> {
//!     supervisor::run(HubConfig::default()).await
//! }
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sinks;
pub mod supervisor;
pub mod transfer;

pub use chat::{ChatEntry, ChatLog, Delivery};
pub use config::HubConfig;
pub use error::{HubError, Result};
pub use media::{AudioMixEngine, VideoRelay};
pub use protocol::{
    datagram::{AudioPacket, StreamKind, VideoChunk},
    framing::LineCodec,
    messages::{ClientMessage, ParticipantEntry, ServerMessage, Uid},
};
pub use registry::{Participant, SessionRegistry};
pub use server::{ControlServer, HubState};
pub use sinks::EventSinks;
pub use transfer::{BrokerUpdate, FileBroker, FileOffer, OfferState};

use chrono::{SecondsFormat, Utc};

/// Current wall-clock time as an ISO-8601 string
pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
