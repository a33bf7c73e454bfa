//! The single active playback of a synthesized response

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::DeviceLease;
use crate::session::SessionEvent;

use super::{SpeechOutput, SpeechRequest};

/// A running playback, bound to the output device lease.
///
/// Cancelling is idempotent and dropping the session cancels it, so the
/// output device is never left playing for an abandoned turn.
pub struct PlaybackSession {
    epoch: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _lease: DeviceLease,
}

impl PlaybackSession {
    /// Spawn playback of `request`; the outcome is posted back to the
    /// session queue as `SessionEvent::PlaybackFinished` tagged with `epoch`.
    pub fn start(
        epoch: u64,
        output: Arc<dyn SpeechOutput>,
        request: SpeechRequest,
        lease: DeviceLease,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let device = lease.device_name();

        let task = tokio::spawn(async move {
            debug!(epoch, device, voice = %request.voice, chars = request.text.len(), "playback task started");
            let result = output.play(request, token).await;
            let _ = events.send(SessionEvent::PlaybackFinished { epoch, result });
        });

        Self {
            epoch,
            cancel,
            task,
            _lease: lease,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Stop playback. Returns false if it was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        info!(epoch = self.epoch, "cancelling playback");
        self.cancel.cancel();
        true
    }

    /// Still producing audio
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
