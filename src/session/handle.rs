//! Cloneable senders onto the session queue

use tokio::sync::{mpsc, oneshot};

use crate::audio::AudioFrame;
use crate::error::{TurnError, TurnResult};
use crate::services::TranscriptSegment;

use super::event::{SessionEvent, SessionStatus};

/// Host-side handle for driving a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SessionEvent) -> TurnResult<()> {
        self.tx.send(event).map_err(|_| TurnError::ChannelClosed)
    }

    pub fn start(&self) -> TurnResult<()> {
        self.send(SessionEvent::Start)
    }

    pub fn wake(&self) -> TurnResult<()> {
        self.send(SessionEvent::Wake)
    }

    pub fn stop(&self) -> TurnResult<()> {
        self.send(SessionEvent::Stop)
    }

    /// Stop the session and end its control loop
    pub fn shutdown(&self) -> TurnResult<()> {
        self.send(SessionEvent::Shutdown)
    }

    pub fn transcript(&self, segment: TranscriptSegment) -> TurnResult<()> {
        self.send(SessionEvent::Transcript(segment))
    }

    /// Queue one captured frame; frames are processed in call order
    pub fn push_frame(&self, frame: AudioFrame) -> TurnResult<()> {
        self.send(SessionEvent::Frame(frame))
    }

    pub fn recognizer_sink(&self) -> RecognizerSink {
        RecognizerSink {
            tx: self.tx.clone(),
        }
    }

    /// Ask the control loop for a snapshot
    pub async fn status(&self) -> TurnResult<SessionStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionEvent::Status(reply_tx))?;
        reply_rx.await.map_err(|_| TurnError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Callback surface handed to a `SpeechRecognizer` on start.
///
/// Sends after the session has shut down are dropped silently.
#[derive(Debug, Clone)]
pub struct RecognizerSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl RecognizerSink {
    pub(crate) fn from_queue(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    pub fn on_result(&self, segment: TranscriptSegment) {
        let _ = self.tx.send(SessionEvent::Transcript(segment));
    }

    pub fn on_error(&self, message: impl Into<String>) {
        let _ = self.tx.send(SessionEvent::RecognizerError(message.into()));
    }

    pub fn on_ended(&self) {
        let _ = self.tx.send(SessionEvent::RecognizerEnded);
    }
}
