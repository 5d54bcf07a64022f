//! Subsystem supervisor
//!
//! Brings the hub up in dependency order (registry and chat state, then
//! the broker, then every listener socket, then the subsystem tasks) and
//! tears it down in reverse. SIGINT, SIGTERM, or a fatal subsystem error
//! cancel one parent token observed by every accept and read loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::error::Result;
use crate::media::{AudioMixEngine, VideoRelay};
use crate::server::{ControlServer, HubState};
use crate::sinks::EventSinks;
use crate::transfer::FileBroker;

/// Per-subsystem drain budget during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the hub until a signal or fatal subsystem error
pub async fn run(config: HubConfig) -> Result<()> {
    // Everything binds before anything starts, so a port conflict fails
    // the whole startup instead of leaving a partial server running.
    let sinks = EventSinks::open(&config.log_dir).await?;
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let broker = FileBroker::new(
        config.host,
        config.upload_dir.clone(),
        update_tx,
        sinks.clone(),
    )
    .await?;
    let state = HubState::new(config.clone(), broker, sinks);
    let control = ControlServer::bind(Arc::clone(&state)).await?;
    let audio = AudioMixEngine::bind(&config).await?;
    let video = VideoRelay::bind(&config).await?;

    let cancel = CancellationToken::new();
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<&'static str>(4);

    // Startup order: control plane, then audio, then video
    let subsystems: Vec<(&'static str, JoinHandle<()>)> = vec![
        (
            "control",
            supervise(
                "control",
                control.run(cancel.child_token(), update_rx),
                fatal_tx.clone(),
            ),
        ),
        (
            "audio",
            supervise("audio", audio.run(cancel.child_token()), fatal_tx.clone()),
        ),
        (
            "video",
            supervise("video", video.run(cancel.child_token()), fatal_tx.clone()),
        ),
    ];
    drop(fatal_tx);

    info!("hub running");
    wait_for_shutdown(&mut fatal_rx).await;
    cancel.cancel();

    // Reverse startup order, bounded drain, then hard-close
    for (name, mut handle) in subsystems.into_iter().rev() {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(_) => info!(subsystem = name, "subsystem drained"),
            Err(_) => {
                warn!(subsystem = name, "subsystem did not drain in time, aborting");
                handle.abort();
            }
        }
    }

    info!("hub stopped");
    Ok(())
}

fn supervise<F>(
    name: &'static str,
    fut: F,
    fatal: mpsc::Sender<&'static str>,
) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(subsystem = name, error = %e, "subsystem failed");
            let _ = fatal.try_send(name);
        }
    })
}

async fn wait_for_shutdown(fatal_rx: &mut mpsc::Receiver<&'static str>) {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    #[cfg(unix)]
    let terminate_recv = async {
        match terminate.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate_recv = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = terminate_recv => {
            info!("terminate signal received, shutting down");
        }
        Some(name) = fatal_rx.recv() => {
            error!(subsystem = name, "subsystem failed, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_bind_conflict_fails_startup() {
        let taken = tokio::net::TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let port = taken.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: port,
            audio_port: 0,
            video_port: 0,
            upload_dir: dir.path().join("uploads"),
            log_dir: dir.path().join("logs"),
        };

        let err = run(config).await.unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
