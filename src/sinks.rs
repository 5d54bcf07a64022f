//! Append-only event sinks
//!
//! Significant chat, transfer, and presentation events are mirrored to
//! three flat log files. Writes are best-effort: a sink failure is traced
//! and never affects the event that triggered it.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::current_timestamp;
use crate::error::Result;
use crate::protocol::messages::Uid;

/// The three event sinks
#[derive(Debug, Clone)]
pub struct EventSinks {
    chat_path: PathBuf,
    transfer_path: PathBuf,
    presentation_path: PathBuf,
}

impl EventSinks {
    /// Create the sink directory and resolve the file paths
    pub async fn open(log_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        Ok(Self {
            chat_path: log_dir.join("chat_history.log"),
            transfer_path: log_dir.join("file_transfers.log"),
            presentation_path: log_dir.join("screen_sharing.log"),
        })
    }

    /// Mirror a chat or broadcast message
    pub async fn chat(&self, label: &str, uid: Uid, text: &str) {
        let line = format!("{} | {} (uid={}) | {}", current_timestamp(), label, uid, text);
        self.append(&self.chat_path, line).await;
    }

    /// Mirror a transfer event (`to` is set for downloads)
    pub async fn transfer(
        &self,
        action: &str,
        filename: &str,
        from: &str,
        to: Option<&str>,
        fid: &str,
        size: u64,
    ) {
        let line = match to {
            Some(to) => format!(
                "{} | {} | {} | FROM: {} | TO: {} | SIZE: {} bytes | FID: {}",
                current_timestamp(),
                action,
                filename,
                from,
                to,
                size,
                fid
            ),
            None => format!(
                "{} | {} | {} | USER: {} | SIZE: {} bytes | FID: {}",
                current_timestamp(),
                action,
                filename,
                from,
                size,
                fid
            ),
        };
        self.append(&self.transfer_path, line).await;
    }

    /// Mirror a presentation event
    pub async fn presentation(&self, action: &str, username: &str, uid: Uid, details: &str) {
        let line = if details.is_empty() {
            format!("{} | {} | {} (uid={})", current_timestamp(), action, username, uid)
        } else {
            format!(
                "{} | {} | {} (uid={}) | {}",
                current_timestamp(),
                action,
                username,
                uid,
                details
            )
        };
        self.append(&self.presentation_path, line).await;
    }

    async fn append(&self, path: &Path, mut line: String) {
        line.push('\n');
        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to append to event sink");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sinks_append() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = EventSinks::open(dir.path()).await.unwrap();

        sinks.chat("alice", 1, "hello").await;
        sinks.chat("[BROADCAST] alice", 1, "all hands").await;
        sinks
            .transfer("UPLOAD", "report.pdf", "alice", None, "fid123", 2048)
            .await;
        sinks
            .transfer("DOWNLOAD", "report.pdf", "alice", Some("bob"), "fid123", 2048)
            .await;
        sinks.presentation("START", "alice", 1, "Topic: demo").await;

        let chat = tokio::fs::read_to_string(dir.path().join("chat_history.log"))
            .await
            .unwrap();
        assert_eq!(chat.lines().count(), 2);
        assert!(chat.contains("alice (uid=1) | hello"));

        let transfers = tokio::fs::read_to_string(dir.path().join("file_transfers.log"))
            .await
            .unwrap();
        assert!(transfers.contains("UPLOAD | report.pdf | USER: alice"));
        assert!(transfers.contains("TO: bob"));

        let presentations = tokio::fs::read_to_string(dir.path().join("screen_sharing.log"))
            .await
            .unwrap();
        assert!(presentations.contains("START | alice (uid=1) | Topic: demo"));
    }
}
