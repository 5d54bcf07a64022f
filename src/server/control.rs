//! Control listener and shared control-plane state

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::chat::ChatLog;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::protocol::messages::{ServerMessage, Uid};
use crate::registry::SessionRegistry;
use crate::server::mailbox::Mailbox;
use crate::server::session;
use crate::sinks::EventSinks;
use crate::transfer::{BrokerUpdate, FileBroker};

/// A live control session as seen by the broadcast paths
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub username: String,
    pub mailbox: Mailbox,
}

/// State shared by all control sessions
pub struct HubState {
    pub config: HubConfig,
    pub registry: SessionRegistry,
    pub chat: ChatLog,
    pub broker: Arc<FileBroker>,
    pub sinks: EventSinks,
    sessions: Mutex<HashMap<Uid, SessionHandle>>,
}

impl HubState {
    /// Assemble the shared state
    pub fn new(config: HubConfig, broker: Arc<FileBroker>, sinks: EventSinks) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            chat: ChatLog::new(),
            broker,
            sinks,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Make a logged-in session reachable for broadcasts
    pub fn attach_session(&self, uid: Uid, username: String, mailbox: Mailbox) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions.insert(uid, SessionHandle { username, mailbox });
    }

    /// Remove a session from the broadcast paths
    pub fn detach_session(&self, uid: Uid) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions.remove(&uid)
    }

    /// Enqueue a message to every live session, optionally excluding one
    ///
    /// Delivery is best-effort per session; a full mailbox drops its oldest
    /// entry and never blocks the broadcast.
    pub fn broadcast(&self, msg: &ServerMessage, exclude: Option<Uid>) {
        let line = msg.to_line();
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        for (uid, handle) in sessions.iter() {
            if Some(*uid) == exclude {
                continue;
            }
            handle.mailbox.push(line.clone());
        }
    }

    /// Enqueue a message to one session; false if it is gone
    pub fn send_to(&self, uid: Uid, msg: &ServerMessage) -> bool {
        let sessions = self.sessions.lock().expect("session map lock poisoned");
        match sessions.get(&uid) {
            Some(handle) => {
                handle.mailbox.push(msg.to_line());
                true
            }
            None => false,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session map lock poisoned").len()
    }
}

/// TCP accept loop for the control plane
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<HubState>,
}

impl ControlServer {
    /// Bind the control listener; a bind failure is fatal for the server
    pub async fn bind(state: Arc<HubState>) -> Result<Self> {
        let addr = state.config.control_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HubError::config(format!("cannot bind control listener {}: {}", addr, e)))?;
        info!(addr = %listener.local_addr()?, "control listener bound");
        Ok(Self { listener, state })
    }

    /// Actual bound address (for ephemeral test ports)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept sessions and relay broker updates until cancelled
    pub async fn run(
        self,
        cancel: CancellationToken,
        mut updates: mpsc::UnboundedReceiver<BrokerUpdate>,
    ) -> Result<()> {
        let mut updates_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("control listener shutting down");
                    break;
                }
                update = updates.recv(), if updates_open => {
                    match update {
                        Some(update) => self.relay_update(update),
                        None => updates_open = false,
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let token = cancel.child_token();
                            tokio::spawn(async move {
                                session::run(state, stream, addr, token).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures (EMFILE, resets) are not fatal
                            error!(error = %e, "control accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn relay_update(&self, update: BrokerUpdate) {
        match update {
            BrokerUpdate::FileAvailable {
                fid,
                filename,
                size,
                offerer_uid,
                offerer_username,
            } => {
                let msg = ServerMessage::FileAvailable {
                    fid,
                    filename,
                    size,
                    offerer_uid,
                    offerer_username,
                };
                self.state.broadcast(&msg, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;

    async fn start_server() -> (Arc<HubState>, SocketAddr, CancellationToken, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 0,
            upload_dir: dir.path().join("uploads"),
            log_dir: dir.path().join("logs"),
            ..HubConfig::default()
        };
        let sinks = EventSinks::open(&config.log_dir).await.unwrap();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let broker = FileBroker::new(
            config.host,
            config.upload_dir.clone(),
            update_tx,
            sinks.clone(),
        )
        .await
        .unwrap();
        let state = HubState::new(config, broker, sinks);
        let server = ControlServer::bind(Arc::clone(&state)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = server.run(token, update_rx).await;
        });
        (state, addr, cancel, dir)
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for server message")
                .unwrap();
            assert!(n > 0, "connection closed while expecting a message");
            serde_json::from_str(line.trim_end()).expect("unparseable server message")
        }

        async fn login(addr: SocketAddr, name: &str) -> Self {
            let mut client = Self::connect(addr).await;
            client
                .send(&format!(r#"{{"type":"login","username":"{}"}}"#, name))
                .await;
            client
        }
    }

    #[tokio::test]
    async fn test_join_leave_order() {
        let (state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::login(addr, "alice").await;
        match a.recv().await {
            ServerMessage::LoginSuccess { uid } => assert_eq!(uid, 1),
            other => panic!("expected login_success, got {:?}", other),
        }
        match a.recv().await {
            ServerMessage::ParticipantList { participants } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].username, "alice");
            }
            other => panic!("expected participant_list, got {:?}", other),
        }
        match a.recv().await {
            ServerMessage::History { messages } => assert!(messages.is_empty()),
            other => panic!("expected history, got {:?}", other),
        }

        let mut b = TestClient::login(addr, "bob").await;
        match b.recv().await {
            ServerMessage::LoginSuccess { uid } => assert_eq!(uid, 2),
            other => panic!("expected login_success, got {:?}", other),
        }
        match b.recv().await {
            ServerMessage::ParticipantList { participants } => {
                assert_eq!(participants.len(), 2);
            }
            other => panic!("expected participant_list, got {:?}", other),
        }
        let _history = b.recv().await;

        match a.recv().await {
            ServerMessage::UserJoined { uid, username } => {
                assert_eq!(uid, 2);
                assert_eq!(username, "bob");
            }
            other => panic!("expected user_joined, got {:?}", other),
        }

        b.send(r#"{"type":"logout"}"#).await;
        match a.recv().await {
            ServerMessage::UserLeft { uid, username } => {
                assert_eq!(uid, 2);
                assert_eq!(username, "bob");
            }
            other => panic!("expected user_left, got {:?}", other),
        }

        // Exactly one user_left: the registry no longer knows bob
        for _ in 0..50 {
            if state.registry.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.registry.len(), 1);
        assert!(state.registry.lookup(2).is_none());
    }

    #[tokio::test]
    async fn test_unicast_routing() {
        let (_state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::login(addr, "alice").await;
        for _ in 0..3 {
            a.recv().await;
        }
        let mut b = TestClient::login(addr, "bob").await;
        for _ in 0..3 {
            b.recv().await;
        }
        let mut c = TestClient::login(addr, "carol").await;
        for _ in 0..3 {
            c.recv().await;
        }
        // drain join notifications
        a.recv().await; // bob joined
        a.recv().await; // carol joined
        b.recv().await; // carol joined

        a.send(r#"{"type":"unicast","target_uid":2,"text":"hi"}"#).await;

        match a.recv().await {
            ServerMessage::UnicastSent { target_uid } => assert_eq!(target_uid, 2),
            other => panic!("expected unicast_sent, got {:?}", other),
        }
        match b.recv().await {
            ServerMessage::Unicast {
                from_uid,
                to_uid,
                text,
                ..
            } => {
                assert_eq!(from_uid, 1);
                assert_eq!(to_uid, 2);
                assert_eq!(text, "hi");
            }
            other => panic!("expected unicast, got {:?}", other),
        }

        // Carol sees nothing; a heartbeat ack must be the next thing she reads
        c.send(r#"{"type":"heartbeat"}"#).await;
        assert!(matches!(c.recv().await, ServerMessage::HeartbeatAck));
    }

    #[tokio::test]
    async fn test_history_replay() {
        let (_state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::login(addr, "alice").await;
        for _ in 0..3 {
            a.recv().await;
        }
        for text in ["one", "two", "three"] {
            a.send(&format!(r#"{{"type":"chat","text":"{}"}}"#, text)).await;
            match a.recv().await {
                ServerMessage::Chat { text: got, uid, .. } => {
                    assert_eq!(got, text);
                    assert_eq!(uid, 1);
                }
                other => panic!("expected chat echo, got {:?}", other),
            }
        }

        let mut c = TestClient::login(addr, "carol").await;
        c.recv().await; // login_success
        c.recv().await; // participant_list
        match c.recv().await {
            ServerMessage::History { messages } => {
                assert_eq!(messages.len(), 3);
                let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, vec!["one", "two", "three"]);
            }
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_keep_session_open() {
        let (_state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::login(addr, "alice").await;
        for _ in 0..3 {
            a.recv().await;
        }

        a.send("{this is not json").await;
        match a.recv().await {
            ServerMessage::Error { reason } => assert_eq!(reason, "malformed"),
            other => panic!("expected error, got {:?}", other),
        }

        a.send(r#"{"type":"warp_core_breach"}"#).await;
        match a.recv().await {
            ServerMessage::Error { .. } => {}
            other => panic!("expected error, got {:?}", other),
        }

        // Session survived both
        a.send(r#"{"type":"heartbeat"}"#).await;
        assert!(matches!(a.recv().await, ServerMessage::HeartbeatAck));
    }

    #[tokio::test]
    async fn test_non_login_first_message_closes_connection() {
        let (_state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::connect(addr).await;
        a.send(r#"{"type":"chat","text":"premature"}"#).await;
        match a.recv().await {
            ServerMessage::Error { .. } => {}
            other => panic!("expected error, got {:?}", other),
        }
        // Connection closes after the error
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(5), a.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_empty_username_rejected() {
        let (state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::connect(addr).await;
        a.send(r#"{"type":"login","username":"  "}"#).await;
        match a.recv().await {
            ServerMessage::Error { .. } => {}
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(state.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_present_start_stop_broadcast() {
        let (state, addr, _cancel, _dir) = start_server().await;

        let mut a = TestClient::login(addr, "alice").await;
        for _ in 0..3 {
            a.recv().await;
        }
        let mut b = TestClient::login(addr, "bob").await;
        for _ in 0..3 {
            b.recv().await;
        }
        a.recv().await; // bob joined

        a.send(r#"{"type":"present_start","topic":"roadmap"}"#).await;
        match b.recv().await {
            ServerMessage::PresentStartBroadcast {
                uid,
                topic,
                viewer_port,
                ..
            } => {
                assert_eq!(uid, 1);
                assert_eq!(topic, "roadmap");
                assert!(viewer_port.is_none());
            }
            other => panic!("expected present_start_broadcast, got {:?}", other),
        }
        // Multi-presenter: bob may present concurrently
        b.send(r#"{"type":"present_start"}"#).await;
        match b.recv().await {
            ServerMessage::PresentStartBroadcast { uid, .. } => assert_eq!(uid, 2),
            other => panic!("expected present_start_broadcast, got {:?}", other),
        }
        for _ in 0..50 {
            if state.registry.lookup(1).map(|p| p.presenting) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.registry.lookup(1).map(|p| p.presenting), Some(true));
        assert_eq!(state.registry.lookup(2).map(|p| p.presenting), Some(true));

        a.send(r#"{"type":"present_stop"}"#).await;
        match b.recv().await {
            ServerMessage::PresentStopBroadcast { uid } => assert_eq!(uid, 1),
            other => panic!("expected present_stop_broadcast, got {:?}", other),
        }
    }
}
