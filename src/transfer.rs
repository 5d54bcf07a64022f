//! File transfer broker
//!
//! File payloads never touch the control channel. Each offer or request
//! gets its own short-lived TCP listener on a port at or above 10000; the
//! listener accepts exactly one connection, moves the raw bytes, and
//! closes. Every listener carries a 5-minute deadline.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::current_timestamp;
use crate::error::{HubError, Result};
use crate::protocol::messages::Uid;
use crate::sinks::EventSinks;

/// Maximum declared file size (100 MiB)
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Deadline for a transfer listener
pub const TRANSFER_DEADLINE: Duration = Duration::from_secs(300);

/// First candidate port for ephemeral listeners
pub const EPHEMERAL_PORT_FLOOR: u16 = 10000;

const PORT_PROBE_BUDGET: usize = 512;
const IO_CHUNK: usize = 8192;
const PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// Lifecycle of a file offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    PendingUpload,
    Available,
    Failed,
    Expired,
}

/// A file offered for sharing
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub fid: String,
    pub filename: String,
    pub size: u64,
    pub offerer_uid: Uid,
    pub offerer_username: String,
    pub created_at: String,
    pub path: PathBuf,
    pub state: OfferState,
}

/// Direction of a live transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// A live ephemeral listener
#[derive(Debug)]
#[allow(dead_code)]
struct TransferSession {
    fid: String,
    direction: Direction,
    deadline: Instant,
}

/// Broker notifications consumed by the control plane
#[derive(Debug, Clone)]
pub enum BrokerUpdate {
    FileAvailable {
        fid: String,
        filename: String,
        size: u64,
        offerer_uid: Uid,
        offerer_username: String,
    },
}

/// Strip path components from a client-supplied filename
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    let trimmed = last.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Filesystem-safe fragment of a client-supplied fid
fn fid_slug(fid: &str) -> String {
    let slug: String = fid
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(32)
        .collect();
    if slug.is_empty() {
        "offer".to_string()
    } else {
        slug
    }
}

/// Ephemeral-listener broker for uploads and downloads
pub struct FileBroker {
    host: IpAddr,
    upload_dir: PathBuf,
    deadline: Duration,
    offers: Mutex<HashMap<String, FileOffer>>,
    transfers: Mutex<HashMap<u16, TransferSession>>,
    pending_uploads: Mutex<HashMap<Uid, Vec<(String, u16, AbortHandle)>>>,
    next_port: Mutex<u16>,
    updates: mpsc::UnboundedSender<BrokerUpdate>,
    sinks: EventSinks,
}

impl FileBroker {
    /// Create a broker, making sure the upload directory exists
    pub async fn new(
        host: IpAddr,
        upload_dir: PathBuf,
        updates: mpsc::UnboundedSender<BrokerUpdate>,
        sinks: EventSinks,
    ) -> Result<Arc<Self>> {
        Self::with_deadline(host, upload_dir, TRANSFER_DEADLINE, updates, sinks).await
    }

    async fn with_deadline(
        host: IpAddr,
        upload_dir: PathBuf,
        deadline: Duration,
        updates: mpsc::UnboundedSender<BrokerUpdate>,
        sinks: EventSinks,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&upload_dir)
            .await
            .map_err(|e| HubError::config(format!("cannot create upload dir: {}", e)))?;
        Ok(Arc::new(Self {
            host,
            upload_dir,
            deadline,
            offers: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            pending_uploads: Mutex::new(HashMap::new()),
            next_port: Mutex::new(EPHEMERAL_PORT_FLOOR),
            updates,
            sinks,
        }))
    }

    /// Current state of an offer
    pub fn offer_state(&self, fid: &str) -> Option<OfferState> {
        let offers = self.offers.lock().expect("offer lock poisoned");
        offers.get(fid).map(|o| o.state)
    }

    /// Number of live transfer sessions
    pub fn live_transfers(&self) -> usize {
        self.transfers.lock().expect("transfer lock poisoned").len()
    }

    /// Validate an offer, open the upload listener, return its port
    pub async fn offer_upload(
        self: &Arc<Self>,
        fid: &str,
        filename: &str,
        size: u64,
        offerer_uid: Uid,
        offerer_username: &str,
    ) -> Result<u16> {
        if fid.is_empty() {
            return Err(HubError::protocol("file offer is missing fid"));
        }
        if size == 0 {
            return Err(HubError::protocol("file size must be positive"));
        }
        if size > MAX_FILE_SIZE {
            return Err(HubError::resource(format!(
                "file size {} exceeds limit of {} bytes",
                size, MAX_FILE_SIZE
            )));
        }
        let sanitized = sanitize_filename(filename)
            .ok_or_else(|| HubError::protocol("filename is empty after sanitizing"))?;
        {
            let offers = self.offers.lock().expect("offer lock poisoned");
            if offers.contains_key(fid) {
                return Err(HubError::resource(format!("fid {} already offered", fid)));
            }
        }

        let (listener, port) = self.bind_ephemeral(Direction::Upload, fid).await?;
        let final_path = self.resolve_target_path(&sanitized, fid);
        let tmp_path = self
            .upload_dir
            .join(format!(".{}-{}.part", fid_slug(fid), port));

        {
            let mut offers = self.offers.lock().expect("offer lock poisoned");
            offers.insert(
                fid.to_string(),
                FileOffer {
                    fid: fid.to_string(),
                    filename: sanitized.clone(),
                    size,
                    offerer_uid,
                    offerer_username: offerer_username.to_string(),
                    created_at: current_timestamp(),
                    path: final_path.clone(),
                    state: OfferState::PendingUpload,
                },
            );
        }

        let broker = Arc::clone(self);
        let fid_owned = fid.to_string();
        let offerer = offerer_username.to_string();
        let handle = tokio::spawn(async move {
            broker
                .run_upload(listener, port, fid_owned, sanitized, size, tmp_path, final_path, offerer_uid, offerer)
                .await;
        });
        self.pending_uploads
            .lock()
            .expect("pending lock poisoned")
            .entry(offerer_uid)
            .or_default()
            .push((fid.to_string(), port, handle.abort_handle()));

        info!(fid, port, size, "upload listener opened");
        Ok(port)
    }

    /// Open a download listener for an available offer
    ///
    /// Concurrent downloads of the same file each get their own listener.
    pub async fn open_download(
        self: &Arc<Self>,
        fid: &str,
        requester: &str,
    ) -> Result<(u16, String, u64)> {
        let (path, filename, size, offerer_username) = {
            let offers = self.offers.lock().expect("offer lock poisoned");
            let offer = offers
                .get(fid)
                .ok_or_else(|| HubError::not_found(format!("file not found: fid={}", fid)))?;
            if offer.state != OfferState::Available {
                return Err(HubError::not_found(format!(
                    "file not available: fid={}",
                    fid
                )));
            }
            (
                offer.path.clone(),
                offer.filename.clone(),
                offer.size,
                offer.offerer_username.clone(),
            )
        };

        let (listener, port) = self.bind_ephemeral(Direction::Download, fid).await?;

        let broker = Arc::clone(self);
        let fid_owned = fid.to_string();
        let requester = requester.to_string();
        let filename_task = filename.clone();
        tokio::spawn(async move {
            broker
                .run_download(listener, port, fid_owned, path, filename_task, size, offerer_username, requester)
                .await;
        });

        info!(fid, port, "download listener opened");
        Ok((port, filename, size))
    }

    /// Abort still-pending upload listeners opened by a departing session
    pub fn cancel_uploads_for(&self, uid: Uid) {
        let pending = self
            .pending_uploads
            .lock()
            .expect("pending lock poisoned")
            .remove(&uid)
            .unwrap_or_default();
        for (fid, port, handle) in pending {
            handle.abort();
            self.transfers
                .lock()
                .expect("transfer lock poisoned")
                .remove(&port);
            let mut offers = self.offers.lock().expect("offer lock poisoned");
            if let Some(offer) = offers.get_mut(&fid) {
                if offer.state == OfferState::PendingUpload {
                    offer.state = OfferState::Failed;
                    debug!(fid, port, "pending upload cancelled with its session");
                }
            }
            let tmp = self
                .upload_dir
                .join(format!(".{}-{}.part", fid_slug(&fid), port));
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(tmp).await;
            });
        }
    }

    async fn bind_ephemeral(&self, direction: Direction, fid: &str) -> Result<(TcpListener, u16)> {
        for _ in 0..PORT_PROBE_BUDGET {
            let port = {
                let mut next = self.next_port.lock().expect("port lock poisoned");
                let port = *next;
                *next = if port == u16::MAX {
                    EPHEMERAL_PORT_FLOOR
                } else {
                    port + 1
                };
                port
            };
            {
                let transfers = self.transfers.lock().expect("transfer lock poisoned");
                if transfers.contains_key(&port) {
                    continue;
                }
            }
            match TcpListener::bind((self.host, port)).await {
                Ok(listener) => {
                    self.transfers.lock().expect("transfer lock poisoned").insert(
                        port,
                        TransferSession {
                            fid: fid.to_string(),
                            direction,
                            deadline: Instant::now() + self.deadline,
                        },
                    );
                    return Ok((listener, port));
                }
                Err(_) => continue,
            }
        }
        Err(HubError::resource("no ephemeral port available"))
    }

    fn resolve_target_path(&self, filename: &str, fid: &str) -> PathBuf {
        let candidate = self.upload_dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }
        let slug = fid_slug(fid);
        let prefix: String = slug.chars().take(8).collect();
        let path = Path::new(filename);
        let renamed = match (path.file_stem(), path.extension()) {
            (Some(stem), Some(ext)) => format!(
                "{}-{}.{}",
                stem.to_string_lossy(),
                prefix,
                ext.to_string_lossy()
            ),
            _ => format!("{}-{}", filename, prefix),
        };
        self.upload_dir.join(renamed)
    }

    fn release_port(&self, port: u16) {
        self.transfers
            .lock()
            .expect("transfer lock poisoned")
            .remove(&port);
    }

    fn forget_pending(&self, uid: Uid, fid: &str) {
        let mut pending = self.pending_uploads.lock().expect("pending lock poisoned");
        if let Some(list) = pending.get_mut(&uid) {
            list.retain(|(f, _, _)| f != fid);
            if list.is_empty() {
                pending.remove(&uid);
            }
        }
    }

    fn set_offer_state(&self, fid: &str, state: OfferState) {
        let mut offers = self.offers.lock().expect("offer lock poisoned");
        if let Some(offer) = offers.get_mut(fid) {
            offer.state = state;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_upload(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        fid: String,
        filename: String,
        size: u64,
        tmp_path: PathBuf,
        final_path: PathBuf,
        offerer_uid: Uid,
        offerer_username: String,
    ) {
        let deadline = Instant::now() + self.deadline;
        let outcome = tokio::time::timeout_at(deadline, async {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| HubError::transport(format!("upload accept failed: {}", e)))?;
            debug!(fid, %peer, "upload connection accepted");
            receive_exact(stream, &tmp_path, size).await
        })
        .await;
        // The listener always closes after one transaction
        drop(listener);
        self.release_port(port);
        self.forget_pending(offerer_uid, &fid);

        match outcome {
            Ok(Ok(())) => match tokio::fs::rename(&tmp_path, &final_path).await {
                Ok(()) => {
                    self.set_offer_state(&fid, OfferState::Available);
                    info!(fid, filename, size, "upload complete");
                    self.sinks
                        .transfer("UPLOAD", &filename, &offerer_username, None, &fid, size)
                        .await;
                    let _ = self.updates.send(BrokerUpdate::FileAvailable {
                        fid,
                        filename,
                        size,
                        offerer_uid,
                        offerer_username,
                    });
                }
                Err(e) => {
                    warn!(fid, error = %e, "failed to publish uploaded file");
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    self.set_offer_state(&fid, OfferState::Failed);
                }
            },
            Ok(Err(e)) => {
                warn!(fid, error = %e, "upload failed");
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.set_offer_state(&fid, OfferState::Failed);
            }
            Err(_) => {
                info!(fid, port, "upload listener timed out");
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.set_offer_state(&fid, OfferState::Expired);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_download(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        fid: String,
        path: PathBuf,
        filename: String,
        size: u64,
        offerer_username: String,
        requester: String,
    ) {
        let deadline = Instant::now() + self.deadline;
        let outcome = tokio::time::timeout_at(deadline, async {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| HubError::transport(format!("download accept failed: {}", e)))?;
            debug!(fid, %peer, "download connection accepted");
            send_file(stream, &path, size).await
        })
        .await;
        drop(listener);
        self.release_port(port);

        match outcome {
            Ok(Ok(())) => {
                info!(fid, filename, size, "download complete");
                self.sinks
                    .transfer(
                        "DOWNLOAD",
                        &filename,
                        &offerer_username,
                        Some(&requester),
                        &fid,
                        size,
                    )
                    .await;
            }
            Ok(Err(e)) => warn!(fid, error = %e, "download failed"),
            Err(_) => info!(fid, port, "download listener timed out"),
        }
    }
}

async fn receive_exact(mut stream: TcpStream, path: &Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| HubError::transfer(format!("cannot create upload file: {}", e)))?;
    let mut buf = [0u8; IO_CHUNK];
    let mut received: u64 = 0;
    let mut next_progress = PROGRESS_INTERVAL;
    while received < size {
        let want = ((size - received).min(buf.len() as u64)) as usize;
        let n = stream
            .read(&mut buf[..want])
            .await
            .map_err(|e| HubError::transfer(format!("upload read failed: {}", e)))?;
        if n == 0 {
            return Err(HubError::transfer(format!(
                "connection closed after {} of {} bytes",
                received, size
            )));
        }
        file.write_all(&buf[..n])
            .await
            .map_err(|e| HubError::transfer(format!("upload write failed: {}", e)))?;
        received += n as u64;
        if received >= next_progress {
            trace!(received, size, "upload progress");
            next_progress += PROGRESS_INTERVAL;
        }
    }
    file.flush()
        .await
        .map_err(|e| HubError::transfer(format!("upload flush failed: {}", e)))?;
    Ok(())
}

async fn send_file(mut stream: TcpStream, path: &Path, size: u64) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| HubError::transfer(format!("cannot open file for download: {}", e)))?;
    let mut buf = [0u8; IO_CHUNK];
    let mut sent: u64 = 0;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| HubError::transfer(format!("download read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&buf[..n])
            .await
            .map_err(|e| HubError::transfer(format!("download write failed: {}", e)))?;
        sent += n as u64;
    }
    stream
        .flush()
        .await
        .map_err(|e| HubError::transfer(format!("download flush failed: {}", e)))?;
    if sent != size {
        return Err(HubError::transfer(format!(
            "file shrank on disk: sent {} of {} bytes",
            sent, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc::UnboundedReceiver;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn test_broker(
        deadline: Duration,
    ) -> (Arc<FileBroker>, UnboundedReceiver<BrokerUpdate>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sinks = EventSinks::open(&dir.path().join("logs")).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = FileBroker::with_deadline(
            LOCALHOST,
            dir.path().join("uploads"),
            deadline,
            tx,
            sinks,
        )
        .await
        .unwrap();
        (broker, rx, dir)
    }

    async fn wait_for_state(broker: &FileBroker, fid: &str, state: OfferState) {
        for _ in 0..200 {
            if broker.offer_state(fid) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "offer {} never reached {:?}, currently {:?}",
            fid,
            state,
            broker.offer_state(fid)
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename("C:\\Users\\x\\notes.txt").as_deref(),
            Some("notes.txt")
        );
        assert_eq!(sanitize_filename("dir/"), None);
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (broker, mut rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();

        let port = broker
            .offer_upload("fid-1", "data.bin", payload.len() as u64, 1, "alice")
            .await
            .unwrap();
        let mut conn = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        conn.write_all(&payload).await.unwrap();
        drop(conn);

        wait_for_state(&broker, "fid-1", OfferState::Available).await;
        match rx.recv().await.unwrap() {
            BrokerUpdate::FileAvailable { fid, size, offerer_uid, .. } => {
                assert_eq!(fid, "fid-1");
                assert_eq!(size, payload.len() as u64);
                assert_eq!(offerer_uid, 1);
            }
        }

        let (port, filename, size) = broker.open_download("fid-1", "bob").await.unwrap();
        assert_eq!(filename, "data.bin");
        assert_eq!(size, payload.len() as u64);

        let mut conn = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let mut fetched = Vec::new();
        conn.read_to_end(&mut fetched).await.unwrap();
        assert_eq!(fetched, payload);
    }

    #[tokio::test]
    async fn test_short_upload_marks_failed() {
        let (broker, _rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        let port = broker
            .offer_upload("fid-short", "data.bin", 4096, 1, "alice")
            .await
            .unwrap();
        let mut conn = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        conn.write_all(b"too little").await.unwrap();
        drop(conn);

        wait_for_state(&broker, "fid-short", OfferState::Failed).await;
        assert!(broker.open_download("fid-short", "bob").await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_expiry_without_connection() {
        let (broker, _rx, _dir) = test_broker(Duration::from_millis(100)).await;
        broker
            .offer_upload("fid-idle", "data.bin", 1024, 1, "alice")
            .await
            .unwrap();
        wait_for_state(&broker, "fid-idle", OfferState::Expired).await;
        assert!(broker.open_download("fid-idle", "bob").await.is_err());
        assert_eq!(broker.live_transfers(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_use_distinct_ports() {
        let (broker, _rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        let p1 = broker
            .offer_upload("fid-a", "a.bin", 10, 1, "alice")
            .await
            .unwrap();
        let p2 = broker
            .offer_upload("fid-b", "b.bin", 10, 2, "bob")
            .await
            .unwrap();
        assert_ne!(p1, p2);
        assert_eq!(broker.live_transfers(), 2);
    }

    #[tokio::test]
    async fn test_size_cap_rejected_without_listener() {
        let (broker, _rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        let err = broker
            .offer_upload("fid-big", "big.bin", MAX_FILE_SIZE + 1, 1, "alice")
            .await
            .unwrap_err();
        assert!(err.reason().contains("size"));
        assert_eq!(broker.live_transfers(), 0);
        assert!(broker.offer_state("fid-big").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_fid_rejected() {
        let (broker, _rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        broker
            .offer_upload("fid-dup", "a.bin", 10, 1, "alice")
            .await
            .unwrap();
        assert!(broker
            .offer_upload("fid-dup", "b.bin", 10, 2, "bob")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancel_uploads_for_session() {
        let (broker, _rx, _dir) = test_broker(TRANSFER_DEADLINE).await;
        broker
            .offer_upload("fid-gone", "a.bin", 10, 7, "alice")
            .await
            .unwrap();
        broker.cancel_uploads_for(7);
        assert_eq!(broker.offer_state("fid-gone"), Some(OfferState::Failed));
        assert_eq!(broker.live_transfers(), 0);
    }

    #[tokio::test]
    async fn test_collision_suffix() {
        let (broker, mut rx, dir) = test_broker(TRANSFER_DEADLINE).await;
        for (fid, byte) in [("fidone11", b'x'), ("fidtwo22", b'y')] {
            let port = broker
                .offer_upload(fid, "same.txt", 3, 1, "alice")
                .await
                .unwrap();
            let mut conn = TcpStream::connect((LOCALHOST, port)).await.unwrap();
            conn.write_all(&[byte; 3]).await.unwrap();
            drop(conn);
            wait_for_state(&broker, fid, OfferState::Available).await;
            let _ = rx.recv().await;
        }
        let uploads = dir.path().join("uploads");
        assert!(uploads.join("same.txt").exists());
        assert!(uploads.join("same-fidtwo22.txt").exists());
    }
}
