//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! state events and collaborator requests to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::audio::AudioFrame;
use crate::error::{ServiceError, TurnResult};
use crate::events::StateEvent;
use crate::services::{CompletionResponse, PlaybackOutcome, TranscriptSegment};
use crate::session::SessionHandle;

use super::bridge::HostBridge;
use super::protocol::{DaemonStatus, Notification, Outbound, Request, Response};

/// Largest accepted message body
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Outgoing messages buffered per client
const CLIENT_QUEUE: usize = 256;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Shared server state
struct ServerContext {
    session: SessionHandle,
    bridge: Arc<HostBridge>,
    events: broadcast::Sender<StateEvent>,
    start_time: Instant,
}

impl Server {
    /// Create a new IPC server bound to `socket_path`
    pub fn new(
        socket_path: &Path,
        session: SessionHandle,
        bridge: Arc<HostBridge>,
        events: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path)
            .context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            context: Arc::new(ServerContext {
                session,
                bridge,
                events,
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = Arc::clone(&self.context);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, context) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, context: Arc<ServerContext>) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(CLIENT_QUEUE);
        let writer_task = tokio::spawn(Self::write_loop(writer, out_rx));
        let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

        let result = loop {
            let request = match Self::read_request(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            if !matches!(request, Request::AudioFrame { .. }) {
                debug!(?request, "received request");
            }

            let subscribe = matches!(request, Request::Subscribe);
            let response = Self::process_request(request, &context).await;

            if subscribe && forwarder.is_none() {
                debug!("client subscribed to notifications");
                forwarder = Some(tokio::spawn(Self::forward_notifications(
                    context.events.subscribe(),
                    context.bridge.subscribe(),
                    out_tx.clone(),
                )));
            }

            if out_tx.send(Outbound::Response(response)).await.is_err() {
                break Ok(());
            }
        };

        if let Some(forwarder) = forwarder {
            forwarder.abort();
            // Wait for the aborted task to drop its receivers
            let _ = forwarder.await;
            context.bridge.host_detached();
        }
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    /// Read one length-prefixed request; `None` on clean disconnect
    async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
        let mut len_buf = [0u8; 4];

        // Read message length (4-byte little-endian)
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("client disconnected");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_LEN {
            warn!(len, "message too large, disconnecting");
            return Ok(None);
        }

        // Read message body
        let mut msg_buf = vec![0u8; len];
        reader.read_exact(&mut msg_buf).await?;

        let request = serde_json::from_slice(&msg_buf)
            .context("failed to parse request")?;
        Ok(Some(request))
    }

    /// Drain the outgoing queue onto the socket
    async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut out_rx: mpsc::Receiver<Outbound>) {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = Self::send_message(&mut writer, &message).await {
                debug!(?e, "client write failed");
                break;
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Push state events and collaborator requests to one subscriber
    async fn forward_notifications(
        mut events: broadcast::Receiver<StateEvent>,
        mut notes: broadcast::Receiver<Notification>,
        out_tx: mpsc::Sender<Outbound>,
    ) {
        loop {
            let notification = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => Notification::StateEvent { event },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                note = notes.recv() => match note {
                    Ok(note) => note,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "host notification subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if out_tx.send(Outbound::Notification(notification)).await.is_err() {
                break;
            }
        }
    }

    /// Process a request and return a response
    async fn process_request(request: Request, context: &ServerContext) -> Response {
        let session = &context.session;
        let bridge = &context.bridge;

        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => match session.status().await {
                Ok(status) => Response::Status(DaemonStatus {
                    uptime_secs: context.start_time.elapsed().as_secs(),
                    session: status,
                    ..Default::default()
                }),
                Err(e) => error_response("session_closed", e),
            },

            Request::Subscribe => Response::Subscribed,

            Request::StartSession => accepted(session.start()),
            Request::StopSession => accepted(session.stop()),
            Request::Wake => accepted(session.wake()),

            Request::AudioFrame { samples, timestamp_ms } => accepted(
                session.push_frame(AudioFrame::new(samples, Duration::from_millis(timestamp_ms))),
            ),

            Request::Transcript { text, is_final } => {
                bridge.deliver_transcript(TranscriptSegment { text, is_final });
                Response::Accepted
            }
            Request::RecognizerError { message } => {
                bridge.deliver_error(message);
                Response::Accepted
            }
            Request::RecognizerEnded => {
                bridge.deliver_ended();
                Response::Accepted
            }

            Request::CompletionResult { request_id, text, latency_ms, error } => {
                let result = match error {
                    Some(message) => Err(ServiceError::Completion(message)),
                    None => Ok(CompletionResponse { text, latency_ms }),
                };
                resolved(bridge.resolve_completion(request_id, result), request_id)
            }

            Request::PlaybackFinished { request_id, cancelled, error } => {
                let result = match (error, cancelled) {
                    (Some(message), _) => Err(ServiceError::Tts(message)),
                    (None, true) => Ok(PlaybackOutcome::Cancelled),
                    (None, false) => Ok(PlaybackOutcome::Completed),
                };
                resolved(bridge.resolve_playback(request_id, result), request_id)
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

fn accepted(result: TurnResult<()>) -> Response {
    match result {
        Ok(()) => Response::Accepted,
        Err(e) => error_response("session_closed", e),
    }
}

fn resolved(found: bool, request_id: u64) -> Response {
    if found {
        Response::Accepted
    } else {
        Response::Error {
            code: "unknown_request".into(),
            message: format!("no pending request {}", request_id),
        }
    }
}

fn error_response(code: &str, e: impl std::fmt::Display) -> Response {
    Response::Error {
        code: code.to_string(),
        message: e.to_string(),
    }
}
