//! Per-connection control session
//!
//! Each session moves through `awaiting-login -> active -> closing`. The
//! reader task owns the session's mutable state and drives dispatch; the
//! writer task drains the outbound mailbox. Cross-session effects go
//! through [`HubState`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::{ChatEntry, Delivery};
use crate::current_timestamp;
use crate::error::{HubError, Result};
use crate::protocol::framing::LineCodec;
use crate::protocol::messages::{ClientMessage, ParseError, ServerMessage, Uid, MAX_TEXT_LEN};
use crate::server::control::HubState;
use crate::server::mailbox::Mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingLogin,
    Active,
    Closing,
}

/// Run one control session to completion
pub(crate) async fn run(
    state: Arc<HubState>,
    stream: TcpStream,
    addr: SocketAddr,
    cancel: CancellationToken,
) {
    debug!(%addr, "control connection opened");
    let (mut reader, writer) = stream.into_split();
    let mailbox = Mailbox::new();
    let writer_task = tokio::spawn(write_loop(writer, mailbox.clone()));

    let mut session = Session {
        state,
        addr,
        mailbox: mailbox.clone(),
        uid: None,
        phase: Phase::AwaitingLogin,
    };

    if let Err(e) = session.read_loop(&mut reader, &cancel).await {
        debug!(%addr, error = %e, "control session ended");
    }
    session.cleanup().await;

    mailbox.close();
    let _ = writer_task.await;
    debug!(%addr, "control connection closed");
}

async fn write_loop(mut writer: OwnedWriteHalf, mailbox: Mailbox) {
    while let Some(line) = mailbox.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Session {
    state: Arc<HubState>,
    addr: SocketAddr,
    mailbox: Mailbox,
    uid: Option<Uid>,
    phase: Phase,
}

impl Session {
    async fn read_loop(
        &mut self,
        reader: &mut OwnedReadHalf,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut codec = LineCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => {
                    read.map_err(|e| HubError::transport(format!("control read failed: {}", e)))?
                }
            };
            if n == 0 {
                // EOF is treated as logout
                return Ok(());
            }
            codec.feed(&buf[..n]);

            loop {
                match codec.decode_next() {
                    Ok(Some(line)) => {
                        self.handle_line(&line).await?;
                        if self.phase == Phase::Closing {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Oversize or undecodable framing closes the session
                        self.reply(ServerMessage::error(e.to_string()));
                        return Err(HubError::protocol(e.to_string()));
                    }
                }
            }
        }
    }

    fn reply(&self, msg: ServerMessage) {
        self.mailbox.push(msg.to_line());
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let msg = match ClientMessage::parse(line) {
            Ok(msg) => msg,
            Err(ParseError::Malformed) => {
                self.reply(ServerMessage::error("malformed"));
                if self.phase == Phase::AwaitingLogin {
                    return Err(HubError::protocol("malformed frame before login"));
                }
                return Ok(());
            }
            Err(ParseError::Unrecognized(detail)) => {
                if self.phase == Phase::AwaitingLogin {
                    self.reply(ServerMessage::error("login required"));
                    return Err(HubError::protocol("unexpected message before login"));
                }
                debug!(addr = %self.addr, detail, "unrecognized message");
                self.reply(ServerMessage::error("unrecognized message"));
                return Ok(());
            }
        };

        match self.phase {
            Phase::AwaitingLogin => self.handle_login(msg).await,
            Phase::Active => self.handle_active(msg).await,
            Phase::Closing => Ok(()),
        }
    }

    async fn handle_login(&mut self, msg: ClientMessage) -> Result<()> {
        let ClientMessage::Login { username } = msg else {
            self.reply(ServerMessage::error("login required"));
            return Err(HubError::protocol("unexpected message before login"));
        };

        let uid = match self.state.registry.register(&username) {
            Ok(uid) => uid,
            Err(e) => {
                self.reply(ServerMessage::error(e.reason()));
                return Err(e);
            }
        };
        let username = username.trim().to_string();

        self.uid = Some(uid);
        self.phase = Phase::Active;
        self.state
            .attach_session(uid, username.clone(), self.mailbox.clone());

        self.reply(ServerMessage::LoginSuccess { uid });
        self.reply(ServerMessage::ParticipantList {
            participants: self.state.registry.snapshot(),
        });
        self.reply(ServerMessage::History {
            messages: self.state.chat.recent(),
        });
        self.state.broadcast(
            &ServerMessage::UserJoined {
                uid,
                username: username.clone(),
            },
            Some(uid),
        );

        info!(uid, username, addr = %self.addr, "participant logged in");
        Ok(())
    }

    async fn handle_active(&mut self, msg: ClientMessage) -> Result<()> {
        let Some(uid) = self.uid else {
            return Err(HubError::internal("active session without uid"));
        };

        match msg {
            ClientMessage::Login { .. } => {
                self.reply(ServerMessage::error("already logged in"));
            }
            ClientMessage::Heartbeat => {
                self.reply(ServerMessage::HeartbeatAck);
            }
            ClientMessage::Chat { text } => {
                self.handle_chat(uid, text, false).await;
            }
            ClientMessage::Broadcast { text } => {
                self.handle_chat(uid, text, true).await;
            }
            ClientMessage::Unicast { target_uid, text } => {
                self.handle_unicast(uid, target_uid, text).await;
            }
            ClientMessage::GetHistory => {
                self.reply(ServerMessage::History {
                    messages: self.state.chat.recent(),
                });
            }
            ClientMessage::FileOffer {
                fid,
                filename,
                size,
            } => {
                self.handle_file_offer(uid, fid, filename, size).await;
            }
            ClientMessage::FileRequest { fid } => {
                self.handle_file_request(fid).await;
            }
            ClientMessage::PresentStart { topic } => {
                self.handle_present_start(uid, topic).await;
            }
            ClientMessage::PresentStop => {
                self.handle_present_stop(uid).await;
            }
            ClientMessage::Logout => {
                info!(uid, "logout requested");
                self.phase = Phase::Closing;
            }
        }
        Ok(())
    }

    async fn handle_chat(&mut self, uid: Uid, text: String, broadcast: bool) {
        if text.len() > MAX_TEXT_LEN {
            self.reply(ServerMessage::error("text exceeds 4 KiB"));
            return;
        }
        let Some(username) = self.state.registry.username(uid) else {
            return;
        };
        let ts = current_timestamp();
        let kind = if broadcast {
            Delivery::Broadcast
        } else {
            Delivery::Chat
        };
        self.state.chat.append(ChatEntry {
            ts: ts.clone(),
            uid,
            username: username.clone(),
            text: text.clone(),
            kind,
            target_uid: None,
        });

        if broadcast {
            let label = format!("[BROADCAST] {}", username);
            self.state.sinks.chat(&label, uid, &text).await;
            self.state.broadcast(
                &ServerMessage::Broadcast {
                    uid,
                    username,
                    text,
                    ts,
                },
                None,
            );
        } else {
            self.state.sinks.chat(&username, uid, &text).await;
            self.state.broadcast(
                &ServerMessage::Chat {
                    uid,
                    username,
                    text,
                    ts,
                },
                None,
            );
        }
    }

    async fn handle_unicast(&mut self, uid: Uid, target_uid: Uid, text: String) {
        if text.len() > MAX_TEXT_LEN {
            self.reply(ServerMessage::error("text exceeds 4 KiB"));
            return;
        }
        let Some(from_username) = self.state.registry.username(uid) else {
            return;
        };
        let Some(to_username) = self.state.registry.username(target_uid) else {
            self.reply(ServerMessage::error(format!(
                "user with uid={} not found",
                target_uid
            )));
            return;
        };

        let ts = current_timestamp();
        self.state.chat.append(ChatEntry {
            ts: ts.clone(),
            uid,
            username: from_username.clone(),
            text: text.clone(),
            kind: Delivery::Unicast,
            target_uid: Some(target_uid),
        });
        let label = format!("[UNICAST {}->{}]", from_username, to_username);
        self.state.sinks.chat(&label, uid, &text).await;

        self.state.send_to(
            target_uid,
            &ServerMessage::Unicast {
                from_uid: uid,
                from_username,
                to_uid: target_uid,
                to_username,
                text,
                ts,
            },
        );
        self.reply(ServerMessage::UnicastSent { target_uid });
    }

    async fn handle_file_offer(&mut self, uid: Uid, fid: String, filename: String, size: u64) {
        let Some(username) = self.state.registry.username(uid) else {
            return;
        };
        match self
            .state
            .broker
            .offer_upload(&fid, &filename, size, uid, &username)
            .await
        {
            Ok(port) => {
                self.reply(ServerMessage::FileUploadPort { port, fid });
            }
            Err(e) => {
                warn!(uid, fid, error = %e, "file offer rejected");
                self.reply(ServerMessage::error(e.reason()));
            }
        }
    }

    async fn handle_file_request(&mut self, fid: String) {
        let requester = self
            .uid
            .and_then(|uid| self.state.registry.username(uid))
            .unwrap_or_default();
        match self.state.broker.open_download(&fid, &requester).await {
            Ok((port, filename, size)) => {
                self.reply(ServerMessage::FileDownloadPort {
                    port,
                    fid,
                    filename,
                    size,
                });
            }
            Err(e) => {
                debug!(fid, error = %e, "file request rejected");
                self.reply(ServerMessage::error(e.reason()));
            }
        }
    }

    async fn handle_present_start(&mut self, uid: Uid, topic: Option<String>) {
        let Some(username) = self.state.registry.username(uid) else {
            return;
        };
        let topic = topic
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Screen Share".to_string());
        // Multiple simultaneous presenters are allowed
        self.state.registry.set_presenting(uid, true);
        self.state
            .sinks
            .presentation("START", &username, uid, &format!("Topic: {}", topic))
            .await;
        self.state.broadcast(
            &ServerMessage::PresentStartBroadcast {
                uid,
                username,
                topic,
                viewer_port: None,
            },
            None,
        );
    }

    async fn handle_present_stop(&mut self, uid: Uid) {
        let Some(username) = self.state.registry.username(uid) else {
            return;
        };
        self.state.registry.set_presenting(uid, false);
        self.state.sinks.presentation("STOP", &username, uid, "").await;
        self.state
            .broadcast(&ServerMessage::PresentStopBroadcast { uid }, None);
    }

    /// Tear down on logout, EOF, error, or cancellation
    async fn cleanup(&mut self) {
        let Some(uid) = self.uid.take() else {
            return;
        };

        if let Some(handle) = self.state.detach_session(uid) {
            let dropped = handle.mailbox.dropped();
            if dropped > 0 {
                warn!(uid, dropped, "session had a slow consumer");
            }
        }

        self.state.broker.cancel_uploads_for(uid);

        if let Some(participant) = self.state.registry.unregister(uid) {
            if participant.presenting {
                self.state
                    .broadcast(&ServerMessage::PresentStopBroadcast { uid }, None);
                self.state
                    .sinks
                    .presentation("STOP", &participant.username, uid, "session closed")
                    .await;
            }
            self.state.broadcast(
                &ServerMessage::UserLeft {
                    uid,
                    username: participant.username.clone(),
                },
                None,
            );
            info!(uid, username = %participant.username, "participant left");
        }
    }
}
