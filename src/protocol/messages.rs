//! Control-plane message types
//!
//! Every control message is a JSON object with a `type` field. Inbound
//! traffic decodes into the closed [`ClientMessage`] set; dispatch is a
//! single match over it. Outbound traffic serializes from
//! [`ServerMessage`].

use serde::{Deserialize, Serialize};

use crate::chat::ChatEntry;

/// Unique participant identifier, assigned at login, never reused
pub type Uid = u32;

/// Maximum chat/broadcast/unicast text length in bytes
pub const MAX_TEXT_LEN: usize = 4 * 1024;

/// Maximum display name length in bytes
pub const MAX_NAME_LEN: usize = 64;

/// Messages accepted from clients
///
/// Older clients send `message` instead of `text`; both are accepted, the
/// server only ever emits `text`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
    },
    Heartbeat,
    Chat {
        #[serde(alias = "message")]
        text: String,
    },
    Broadcast {
        #[serde(alias = "message")]
        text: String,
    },
    Unicast {
        target_uid: Uid,
        #[serde(alias = "message")]
        text: String,
    },
    GetHistory,
    FileOffer {
        fid: String,
        filename: String,
        size: u64,
    },
    FileRequest {
        fid: String,
    },
    PresentStart {
        #[serde(default)]
        topic: Option<String>,
    },
    PresentStop,
    Logout,
}

/// Why an inbound line failed to decode
#[derive(Debug)]
pub enum ParseError {
    /// The line is not valid JSON
    Malformed,
    /// Valid JSON, but not a recognized message shape
    Unrecognized(String),
}

impl ClientMessage {
    /// Decode one line of the control stream
    ///
    /// Distinguishes garbage (`Malformed`, replied to without closing) from
    /// well-formed JSON carrying an unknown or ill-typed message
    /// (`Unrecognized`).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|_| ParseError::Malformed)?;
        serde_json::from_value(value).map_err(|e| ParseError::Unrecognized(e.to_string()))
    }
}

/// One entry of a `participant_list` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantEntry {
    pub uid: Uid,
    pub username: String,
}

/// Messages pushed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginSuccess {
        uid: Uid,
    },
    ParticipantList {
        participants: Vec<ParticipantEntry>,
    },
    History {
        messages: Vec<ChatEntry>,
    },
    UserJoined {
        uid: Uid,
        username: String,
    },
    UserLeft {
        uid: Uid,
        username: String,
    },
    HeartbeatAck,
    Chat {
        uid: Uid,
        username: String,
        text: String,
        ts: String,
    },
    Broadcast {
        uid: Uid,
        username: String,
        text: String,
        ts: String,
    },
    Unicast {
        from_uid: Uid,
        from_username: String,
        to_uid: Uid,
        to_username: String,
        text: String,
        ts: String,
    },
    UnicastSent {
        target_uid: Uid,
    },
    FileUploadPort {
        port: u16,
        fid: String,
    },
    FileDownloadPort {
        port: u16,
        fid: String,
        filename: String,
        size: u64,
    },
    FileAvailable {
        fid: String,
        filename: String,
        size: u64,
        offerer_uid: Uid,
        offerer_username: String,
    },
    PresentStartBroadcast {
        uid: Uid,
        username: String,
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        viewer_port: Option<u16>,
    },
    PresentStopBroadcast {
        uid: Uid,
    },
    Error {
        reason: String,
    },
}

impl ServerMessage {
    /// Encode as one LF-terminated wire line
    pub fn to_line(&self) -> String {
        // ServerMessage contains no map keys or non-string-keyed types, so
        // serialization cannot fail.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Build an `error` reply
    pub fn error<T: Into<String>>(reason: T) -> Self {
        ServerMessage::Error {
            reason: reason.into(),
        }
    }
}
