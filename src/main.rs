//! voice-turn-daemon: turn-taking daemon for a voice conversation agent
//!
//! This daemon runs next to a host app and provides:
//! - Voice activity detection over frames pushed by the host
//! - Explicit state machine for the conversation phase
//! - IPC server for status queries, state events and collaborator requests
//!
//! Speech recognition, completion and playback stay in the host; the
//! daemon asks for them over IPC and decides what to do with the answers.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voice_turn::config::Config;
use voice_turn::events::StateEvent;
use voice_turn::ipc::{HostBridge, Notification, Server};
use voice_turn::lifecycle::ShutdownSignal;
use voice_turn::session::{AudioDevices, Collaborators, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-turn-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        ?config.socket_path,
        sample_rate = config.vad.sample_rate,
        samples_per_frame = config.samples_per_frame(),
        "configuration loaded"
    );

    let shutdown = ShutdownSignal::new();

    // Session -> IPC subscribers
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(256);
    // Collaborator requests -> host. Only subscribed hosts hold receivers,
    // so requests fail with Disconnected while none is attached.
    let (notify_tx, _) = broadcast::channel::<Notification>(64);

    let bridge = Arc::new(HostBridge::new(notify_tx));
    let collaborators = Collaborators {
        recognizer: bridge.clone(),
        completion: bridge.clone(),
        output: bridge.clone(),
    };

    let (orchestrator, queue) = Orchestrator::new(
        config.session.clone(),
        config.vad.clone(),
        collaborators,
        AudioDevices::default(),
        event_tx.clone(),
    );
    let session = orchestrator.handle();

    let server = Server::new(&config.socket_path, session.clone(), bridge, event_tx)?;
    let mut session_task = tokio::spawn(orchestrator.run(queue));

    info!("daemon initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        result = &mut session_task => {
            if let Err(e) = result {
                error!(?e, "session task failed");
            }
        }

        result = shutdown.wait() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(?e, "signal handling failed"),
            }
        }
    }

    // Cleanup
    info!("shutting down...");

    if session.shutdown().is_ok() {
        let _ = session_task.await;
    }
    server.shutdown().await;

    info!("voice-turn-daemon stopped");

    Ok(())
}
