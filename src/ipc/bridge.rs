//! Collaborators implemented by the connected host
//!
//! Each outgoing request is published as a notification and parked in a
//! pending table keyed by request id until the host answers over IPC.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::services::{
    CompletionClient, CompletionRequest, CompletionResponse, PlaybackOutcome, SpeechOutput,
    SpeechRecognizer, SpeechRequest, TranscriptSegment,
};
use crate::session::RecognizerSink;

use super::protocol::Notification;

type Pending<T> = Mutex<HashMap<u64, oneshot::Sender<Result<T, ServiceError>>>>;

/// Bridges the collaborator traits onto host notifications
pub struct HostBridge {
    notify_tx: broadcast::Sender<Notification>,
    next_id: AtomicU64,
    completions: Pending<CompletionResponse>,
    playbacks: Pending<PlaybackOutcome>,
    /// Set while the recognizer is started
    sink: Mutex<Option<RecognizerSink>>,
}

impl HostBridge {
    pub fn new(notify_tx: broadcast::Sender<Notification>) -> Self {
        Self {
            notify_tx,
            next_id: AtomicU64::new(1),
            completions: Mutex::new(HashMap::new()),
            playbacks: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    fn publish(&self, notification: Notification) -> Result<(), ServiceError> {
        debug!(?notification, "publishing to host");
        self.notify_tx
            .send(notification)
            .map(|_| ())
            .map_err(|_| ServiceError::Disconnected("no host subscribed".into()))
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand a host answer to the waiting completion call
    pub fn resolve_completion(&self, request_id: u64, result: Result<CompletionResponse, ServiceError>) -> bool {
        resolve(&self.completions, request_id, result)
    }

    /// Hand a host answer to the waiting playback
    pub fn resolve_playback(&self, request_id: u64, result: Result<PlaybackOutcome, ServiceError>) -> bool {
        resolve(&self.playbacks, request_id, result)
    }

    /// Route a host transcript to the session if the recognizer is running
    pub fn deliver_transcript(&self, segment: TranscriptSegment) -> bool {
        self.with_sink(|sink| sink.on_result(segment))
    }

    pub fn deliver_error(&self, message: String) -> bool {
        self.with_sink(|sink| sink.on_error(message))
    }

    pub fn deliver_ended(&self) -> bool {
        self.with_sink(|sink| sink.on_ended())
    }

    /// Called when a subscriber goes away. Once no host is left, every
    /// parked request fails with `Disconnected` and a running recognizer
    /// is told its source is gone.
    pub fn host_detached(&self) -> bool {
        if self.notify_tx.receiver_count() > 0 {
            return false;
        }

        let completions: Vec<_> = lock(&self.completions).drain().collect();
        let playbacks: Vec<_> = lock(&self.playbacks).drain().collect();
        if !completions.is_empty() || !playbacks.is_empty() {
            warn!(
                completions = completions.len(),
                playbacks = playbacks.len(),
                "host gone, failing pending requests"
            );
        }
        for (_, tx) in completions {
            let _ = tx.send(Err(ServiceError::Disconnected("host disconnected".into())));
        }
        for (_, tx) in playbacks {
            let _ = tx.send(Err(ServiceError::Disconnected("host disconnected".into())));
        }

        self.with_sink(|sink| sink.on_error("host disconnected"));
        true
    }

    /// Requests still waiting on the host
    pub fn pending_requests(&self) -> usize {
        lock(&self.completions).len() + lock(&self.playbacks).len()
    }

    fn with_sink(&self, f: impl FnOnce(&RecognizerSink)) -> bool {
        let guard = lock(&self.sink);
        match guard.as_ref() {
            Some(sink) => {
                f(sink);
                true
            }
            None => {
                debug!("recognizer stopped, host input dropped");
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a parked request when its caller stops waiting
struct PendingEntry<'a, T> {
    table: &'a Pending<T>,
    request_id: u64,
}

impl<'a, T> PendingEntry<'a, T> {
    fn park(table: &'a Pending<T>, request_id: u64) -> (Self, oneshot::Receiver<Result<T, ServiceError>>) {
        let (tx, rx) = oneshot::channel();
        lock(table).insert(request_id, tx);
        (Self { table, request_id }, rx)
    }
}

impl<T> Drop for PendingEntry<'_, T> {
    fn drop(&mut self) {
        if lock(self.table).remove(&self.request_id).is_some() {
            debug!(request_id = self.request_id, "request abandoned before host answered");
        }
    }
}

fn resolve<T>(pending: &Pending<T>, request_id: u64, result: Result<T, ServiceError>) -> bool {
    match lock(pending).remove(&request_id) {
        Some(tx) => tx.send(result).is_ok(),
        None => {
            warn!(request_id, "answer for unknown or finished request");
            false
        }
    }
}

impl SpeechRecognizer for HostBridge {
    fn start(&self, sink: RecognizerSink) -> Result<(), ServiceError> {
        *lock(&self.sink) = Some(sink);
        self.publish(Notification::RecognizerControl { active: true })
    }

    fn stop(&self) {
        if lock(&self.sink).take().is_some() {
            let _ = self.publish(Notification::RecognizerControl { active: false });
        }
    }
}

#[async_trait]
impl CompletionClient for HostBridge {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ServiceError> {
        let request_id = self.next_request_id();
        let (_entry, rx) = PendingEntry::park(&self.completions, request_id);

        self.publish(Notification::CompletionRequested {
            request_id,
            epoch: request.epoch,
            text: request.text,
        })?;

        rx.await
            .unwrap_or_else(|_| Err(ServiceError::Disconnected("completion request dropped".into())))
    }
}

#[async_trait]
impl SpeechOutput for HostBridge {
    async fn play(
        &self,
        request: SpeechRequest,
        cancel: CancellationToken,
    ) -> Result<PlaybackOutcome, ServiceError> {
        let request_id = self.next_request_id();
        let (_entry, rx) = PendingEntry::park(&self.playbacks, request_id);

        self.publish(Notification::PlaybackRequested {
            request_id,
            text: request.text,
            voice: request.voice,
        })?;

        tokio::select! {
            _ = cancel.cancelled() => {
                lock(&self.playbacks).remove(&request_id);
                let _ = self.publish(Notification::PlaybackCancelled { request_id });
                Ok(PlaybackOutcome::Cancelled)
            }
            answer = rx => answer
                .unwrap_or_else(|_| Err(ServiceError::Disconnected("playback request dropped".into()))),
        }
    }
}
