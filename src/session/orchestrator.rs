//! Turn-taking orchestrator
//!
//! Binds detector output and transcript finalization to state-gated calls
//! on the collaborators:
//!
//! ```text
//! Listening --final transcript--> Thinking --completion--> Speaking
//!     ^                                                       |
//!     +------- settle delay after playback / barge-in --------+
//! ```
//!
//! Any collaborator failure forces Error; after a cooldown the session is
//! reset to Idle with the microphone released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioDevice, AudioFrame, DeviceLease};
use crate::error::ServiceError;
use crate::events::StateEvent;
use crate::services::{
    CompletionClient, CompletionRequest, CompletionResponse, PlaybackOutcome, PlaybackSession,
    SpeechOutput, SpeechRecognizer, SpeechRequest, TranscriptSegment,
};
use crate::state::{AgentState, AgentStateMachine};
use crate::vad::{VadConfig, VadState, VoiceActivityDetector};

use super::event::{SessionEvent, SessionStatus};
use super::handle::{RecognizerSink, SessionHandle};
use super::speech::clean_for_speech;

/// Timing and voice settings for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Pause after playback before capture resumes, so the tail of the
    /// response is not picked up as a new utterance (default: 300ms)
    pub settle_delay: Duration,

    /// Time spent in Error before the automatic reset (default: 3s)
    pub error_cooldown: Duration,

    /// Delay before restarting a recognizer that ended on its own (default: 100ms)
    pub stt_restart_delay: Duration,

    /// Upper bound on the Thinking phase (default: 15s)
    pub completion_timeout: Duration,

    /// Voice passed to speech output
    pub voice: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            error_cooldown: Duration::from_secs(3),
            stt_restart_delay: Duration::from_millis(100),
            completion_timeout: Duration::from_secs(15),
            voice: "alloy".to_string(),
        }
    }
}

/// External services a session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub completion: Arc<dyn CompletionClient>,
    pub output: Arc<dyn SpeechOutput>,
}

/// The process-wide audio devices, injected rather than global
#[derive(Debug, Clone)]
pub struct AudioDevices {
    pub capture: AudioDevice,
    pub output: AudioDevice,
}

impl Default for AudioDevices {
    fn default() -> Self {
        Self {
            capture: AudioDevice::new("microphone"),
            output: AudioDevice::new("speaker"),
        }
    }
}

/// Single-writer control loop for one conversation session
pub struct Orchestrator {
    config: SessionConfig,
    vad: VoiceActivityDetector,
    fsm: AgentStateMachine,

    /// Transcript of the turn being processed
    utterance: String,
    /// Response text currently being spoken
    response: Option<String>,
    /// Bumped for every new request and every abandonment
    epoch: u64,

    collaborators: Collaborators,
    devices: AudioDevices,
    capture: Option<DeviceLease>,
    playback: Option<PlaybackSession>,

    queue: mpsc::UnboundedSender<SessionEvent>,
    event_tx: broadcast::Sender<StateEvent>,
}

impl Orchestrator {
    /// Create an orchestrator and the receiving end of its event queue
    pub fn new(
        config: SessionConfig,
        vad_config: VadConfig,
        collaborators: Collaborators,
        devices: AudioDevices,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (queue, queue_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            config,
            vad: VoiceActivityDetector::new(vad_config),
            fsm: AgentStateMachine::new(event_tx.clone()),
            utterance: String::new(),
            response: None,
            epoch: 0,
            collaborators,
            devices,
            capture: None,
            playback: None,
            queue,
            event_tx,
        };

        (orchestrator, queue_rx)
    }

    /// A handle that feeds this orchestrator's queue
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.queue.clone())
    }

    pub fn state(&self) -> AgentState {
        self.fsm.state()
    }

    pub fn vad_state(&self) -> VadState {
        self.vad.state()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn utterance(&self) -> &str {
        &self.utterance
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Whether the microphone is held by this session
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().map_or(false, |p| p.is_active())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.fsm.state(),
            vad_state: self.vad.state(),
            epoch: self.epoch,
            session_active: self.capture.is_some(),
            playback_active: self.is_playing(),
            energy: self.vad.energy_level(),
            raw_energy: self.vad.raw_energy(),
            threshold: self.vad.threshold(),
            noise_floor: self.vad.noise_floor(),
        }
    }

    /// Consume the queue until a `Shutdown` message arrives
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("session control loop started");

        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }

        self.stop("session closed");
        info!("session control loop stopped");
    }

    /// Apply one queued event. Never blocks; network work is spawned and
    /// reports back through the queue.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Start => self.start_session(),
            SessionEvent::Wake => self.wake(),
            SessionEvent::Stop | SessionEvent::Shutdown => self.stop("stopped by host"),
            SessionEvent::Frame(frame) => self.handle_frame(&frame),
            SessionEvent::Transcript(segment) => self.handle_transcript(segment),
            SessionEvent::RecognizerError(message) => self.handle_recognizer_error(message),
            SessionEvent::RecognizerEnded => self.handle_recognizer_ended(),
            SessionEvent::CompletionFinished { epoch, result, elapsed } => {
                self.handle_completion(epoch, result, elapsed)
            }
            SessionEvent::PlaybackFinished { epoch, result } => self.handle_playback_finished(epoch, result),
            SessionEvent::CompletionTimedOut { epoch } => self.handle_completion_timeout(epoch),
            SessionEvent::SettleElapsed { epoch } => self.handle_settle(epoch),
            SessionEvent::CooldownElapsed { epoch } => self.handle_cooldown(epoch),
            SessionEvent::RecognizerRestart { epoch } => self.handle_recognizer_restart(epoch),
            SessionEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn wake(&mut self) {
        if self.fsm.state() == AgentState::Idle {
            self.fsm.transition(AgentState::Wake, "wake signal");
        }
    }

    fn start_session(&mut self) {
        if !matches!(self.fsm.state(), AgentState::Idle | AgentState::Wake) {
            debug!(state = %self.fsm.state(), "start ignored, session already running");
            return;
        }

        let lease = match self.devices.capture.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                error!(%e, "cannot start session");
                return;
            }
        };

        self.epoch += 1;
        self.vad.reset();
        if !self.fsm.transition(AgentState::Listening, "session started") {
            return;
        }

        self.capture = Some(lease);
        self.emit(StateEvent::AudioCaptureStarted);
        self.begin_listening();
    }

    /// Entry actions shared by every route into Listening
    fn begin_listening(&mut self) {
        self.utterance.clear();
        self.response = None;

        let sink = RecognizerSink::from_queue(self.queue.clone());
        if let Err(e) = self.collaborators.recognizer.start(sink) {
            self.fail(&e);
        }
    }

    fn handle_frame(&mut self, frame: &AudioFrame) {
        if self.capture.is_none() {
            trace!("frame dropped, microphone not held");
            return;
        }

        let previous = self.vad.state();
        let current = self.vad.process(frame);

        match (previous, current) {
            (VadState::Pending, VadState::Speech) => self.emit(StateEvent::SpeechStarted),
            (VadState::Speech, VadState::Silence) => self.emit(StateEvent::SpeechEnded),
            _ => {}
        }

        if current == VadState::Speech && self.fsm.can_barge_in() {
            self.barge_in();
        }
    }

    fn barge_in(&mut self) {
        info!(epoch = self.epoch, "barge-in detected");

        if let Some(playback) = self.playback.take() {
            debug!(playback_epoch = playback.epoch(), "interrupting playback");
            playback.cancel();
        }
        // Abandon the turn: any result still in flight is now stale
        self.epoch += 1;
        self.response = None;

        if self.fsm.transition(AgentState::Listening, "barge-in") {
            self.emit(StateEvent::BargeIn { epoch: self.epoch });
            self.begin_listening();
        }
    }

    fn handle_transcript(&mut self, segment: TranscriptSegment) {
        if !segment.is_final {
            trace!(text = %segment.text, "interim transcript");
            return;
        }

        let text = segment.text.trim();
        if text.is_empty() {
            debug!("empty final transcript discarded");
            return;
        }

        if self.fsm.state() != AgentState::Listening {
            debug!(state = %self.fsm.state(), "final transcript outside Listening dropped");
            return;
        }

        self.epoch += 1;
        if !self.fsm.transition(AgentState::Thinking, "utterance complete") {
            return;
        }
        self.utterance = text.to_string();
        self.collaborators.recognizer.stop();

        let epoch = self.epoch;
        self.emit(StateEvent::UtteranceFinalized {
            epoch,
            text: self.utterance.clone(),
        });

        let client = Arc::clone(&self.collaborators.completion);
        let queue = self.queue.clone();
        let request = CompletionRequest {
            text: self.utterance.clone(),
            epoch,
        };
        tokio::spawn(async move {
            let started = Instant::now();
            let result = client.complete(request).await;
            let _ = queue.send(SessionEvent::CompletionFinished {
                epoch,
                result,
                elapsed: started.elapsed(),
            });
        });

        self.schedule(self.config.completion_timeout, SessionEvent::CompletionTimedOut { epoch });
    }

    fn handle_completion(
        &mut self,
        epoch: u64,
        result: Result<CompletionResponse, ServiceError>,
        elapsed: Duration,
    ) {
        if epoch != self.epoch || self.fsm.state() != AgentState::Thinking {
            self.discard_stale(epoch);
            return;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail(&e);
                return;
            }
        };

        let latency_ms = elapsed.as_millis() as u64;
        info!(epoch, latency_ms, endpoint_latency_ms = response.latency_ms, "response ready");
        self.emit(StateEvent::ResponseReady {
            epoch,
            latency_ms,
            endpoint_latency_ms: response.latency_ms,
        });

        let text = clean_for_speech(&response.text);
        if text.is_empty() {
            self.fail(&ServiceError::Completion("response has no speakable text".into()));
            return;
        }

        let lease = match self.devices.output.acquire() {
            Ok(lease) => lease,
            Err(e) => {
                self.fail(&ServiceError::Playback(e.to_string()));
                return;
            }
        };

        if !self.fsm.transition(AgentState::Speaking, "response ready") {
            return;
        }

        let request = SpeechRequest {
            text: text.clone(),
            voice: self.config.voice.clone(),
        };
        self.response = Some(text);
        self.playback = Some(PlaybackSession::start(
            epoch,
            Arc::clone(&self.collaborators.output),
            request,
            lease,
            self.queue.clone(),
        ));
        self.emit(StateEvent::PlaybackStarted { epoch });
    }

    fn handle_completion_timeout(&mut self, epoch: u64) {
        if epoch == self.epoch && self.fsm.state() == AgentState::Thinking {
            self.fail(&ServiceError::Timeout("completion".into()));
        }
    }

    fn handle_playback_finished(&mut self, epoch: u64, result: Result<PlaybackOutcome, ServiceError>) {
        if epoch != self.epoch {
            self.discard_stale(epoch);
            return;
        }

        // Releases the output device
        self.playback = None;

        match result {
            Ok(outcome) => {
                debug!(epoch, ?outcome, "playback ended");
                self.emit(StateEvent::PlaybackFinished { epoch });
                self.schedule(self.config.settle_delay, SessionEvent::SettleElapsed { epoch });
            }
            Err(e) => self.fail(&e),
        }
    }

    fn handle_settle(&mut self, epoch: u64) {
        if epoch != self.epoch || self.fsm.state() != AgentState::Speaking {
            return;
        }

        self.vad.reset();
        if self.fsm.transition(AgentState::Listening, "playback complete") {
            self.begin_listening();
        }
    }

    fn handle_recognizer_error(&mut self, message: String) {
        if self.capture.is_none() {
            debug!(%message, "recognizer error after session end ignored");
            return;
        }
        self.fail(&ServiceError::Stt(message));
    }

    fn handle_recognizer_ended(&mut self) {
        if self.fsm.state() == AgentState::Listening {
            debug!(delay_ms = self.config.stt_restart_delay.as_millis() as u64, "recognizer ended, scheduling restart");
            self.schedule(
                self.config.stt_restart_delay,
                SessionEvent::RecognizerRestart { epoch: self.epoch },
            );
        }
    }

    fn handle_recognizer_restart(&mut self, epoch: u64) {
        if epoch != self.epoch || self.fsm.state() != AgentState::Listening {
            return;
        }
        let sink = RecognizerSink::from_queue(self.queue.clone());
        if let Err(e) = self.collaborators.recognizer.start(sink) {
            self.fail(&e);
        }
    }

    /// Force Error, release the microphone and arm the recovery timer
    fn fail(&mut self, cause: &ServiceError) {
        error!(%cause, state = %self.fsm.state(), "turn failed");

        self.epoch += 1;
        self.abandon_turn();
        self.release_capture();

        let reason = cause.to_string();
        self.fsm.transition(AgentState::Error, &reason);
        self.schedule(
            self.config.error_cooldown,
            SessionEvent::CooldownElapsed { epoch: self.epoch },
        );
    }

    fn handle_cooldown(&mut self, epoch: u64) {
        if epoch != self.epoch || self.fsm.state() != AgentState::Error {
            return;
        }
        // No automatic retry against the paid endpoints: the host restarts
        self.fsm.reset("Error recovery");
        self.vad.reset();
    }

    /// End the session from any phase. Always lands in Idle.
    pub fn stop(&mut self, reason: &str) {
        self.epoch += 1;
        self.abandon_turn();
        self.release_capture();
        self.vad.reset();
        if self.fsm.state() != AgentState::Idle {
            self.fsm.reset(reason);
        }
    }

    fn abandon_turn(&mut self) {
        if let Some(playback) = self.playback.take() {
            playback.cancel();
        }
        self.response = None;
        self.utterance.clear();
    }

    fn release_capture(&mut self) {
        if self.capture.take().is_some() {
            self.collaborators.recognizer.stop();
            self.emit(StateEvent::AudioCaptureStopped);
        }
    }

    fn discard_stale(&self, epoch: u64) {
        warn!(epoch, current_epoch = self.epoch, state = %self.fsm.state(), "discarding stale response");
        self.emit(StateEvent::StaleResponseDiscarded {
            epoch,
            current_epoch: self.epoch,
        });
    }

    fn schedule(&self, delay: Duration, event: SessionEvent) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(event);
        });
    }

    fn emit(&self, event: StateEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Default)]
    struct MockRecognizer {
        starts: AtomicUsize,
        stops: AtomicUsize,
        sink: Mutex<Option<RecognizerSink>>,
    }

    impl SpeechRecognizer for MockRecognizer {
        fn start(&self, sink: RecognizerSink) -> Result<(), ServiceError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockCompletion {
        delay: Duration,
        replies: Mutex<VecDeque<Result<CompletionResponse, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl MockCompletion {
        fn replying(delay: Duration, text: &str) -> Self {
            Self::with_results(
                delay,
                vec![Ok(CompletionResponse {
                    text: text.to_string(),
                    latency_ms: 420,
                })],
            )
        }

        fn with_results(delay: Duration, results: Vec<Result<CompletionResponse, ServiceError>>) -> Self {
            Self {
                delay,
                replies: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for MockCompletion {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Completion("no scripted reply".into())))
        }
    }

    /// Plays fixed-length chunks until done or cancelled
    struct MockOutput {
        chunks: usize,
        chunk_len: Duration,
        played: AtomicUsize,
        cancelled: AtomicUsize,
        texts: Mutex<Vec<String>>,
    }

    impl MockOutput {
        fn new(chunks: usize, chunk_len: Duration) -> Self {
            Self {
                chunks,
                chunk_len,
                played: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                texts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SpeechOutput for MockOutput {
        async fn play(
            &self,
            request: SpeechRequest,
            cancel: CancellationToken,
        ) -> Result<PlaybackOutcome, ServiceError> {
            self.texts.lock().unwrap().push(request.text);
            for _ in 0..self.chunks {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        return Ok(PlaybackOutcome::Cancelled);
                    }
                    _ = tokio::time::sleep(self.chunk_len) => {
                        self.played.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Ok(PlaybackOutcome::Completed)
        }
    }

    struct Harness {
        orch: Orchestrator,
        queue: mpsc::UnboundedReceiver<SessionEvent>,
        events: broadcast::Receiver<StateEvent>,
        recognizer: Arc<MockRecognizer>,
        completion: Arc<MockCompletion>,
        output: Arc<MockOutput>,
        devices: AudioDevices,
        clock: Duration,
    }

    impl Harness {
        fn new(completion: MockCompletion, output: MockOutput) -> Self {
            let recognizer = Arc::new(MockRecognizer::default());
            let completion = Arc::new(completion);
            let output = Arc::new(output);
            let devices = AudioDevices::default();
            let (event_tx, events) = broadcast::channel(256);

            let (orch, queue) = Orchestrator::new(
                SessionConfig::default(),
                VadConfig::default(),
                Collaborators {
                    recognizer: recognizer.clone(),
                    completion: completion.clone(),
                    output: output.clone(),
                },
                devices.clone(),
                event_tx,
            );

            Self {
                orch,
                queue,
                events,
                recognizer,
                completion,
                output,
                devices,
                clock: Duration::ZERO,
            }
        }

        fn standard() -> Self {
            Self::new(
                MockCompletion::replying(Duration::from_millis(50), "Your portfolio is worth **$12,400**."),
                MockOutput::new(4, Duration::from_millis(250)),
            )
        }

        /// Apply the next queued event, advancing paused time as needed
        async fn pump(&mut self) {
            let event = self.queue.recv().await.expect("queue closed");
            self.orch.handle_event(event);
        }

        async fn pump_until_state(&mut self, state: AgentState) {
            for _ in 0..32 {
                if self.orch.state() == state {
                    return;
                }
                self.pump().await;
            }
            panic!("never reached {state}, stuck in {}", self.orch.state());
        }

        /// Feed `ms` of 20ms frames at `amplitude`
        fn frames(&mut self, amplitude: f32, ms: u64) {
            for _ in 0..ms / 20 {
                let samples: Vec<f32> = (0..320)
                    .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
                    .collect();
                self.orch
                    .handle_event(SessionEvent::Frame(AudioFrame::new(samples, self.clock)));
                self.clock += Duration::from_millis(20);
            }
        }

        fn say(&mut self, text: &str) {
            self.orch
                .handle_event(SessionEvent::Transcript(TranscriptSegment::final_result(text)));
        }

        fn transitions(&mut self) -> Vec<(AgentState, AgentState, String)> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let StateEvent::StateChanged { from, to, reason, .. } = event {
                    out.push((from, to, reason));
                }
            }
            out
        }

        fn drain_events(&mut self) -> Vec<StateEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_acquires_microphone() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);

        assert_eq!(h.orch.state(), AgentState::Listening);
        assert!(h.orch.is_capturing());
        assert!(h.devices.capture.is_in_use());
        assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);

        // A second start is a no-op
        h.orch.handle_event(SessionEvent::Start);
        assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_busy_microphone_stays_idle() {
        let mut h = Harness::standard();
        let _other = h.devices.capture.acquire().unwrap();

        h.orch.handle_event(SessionEvent::Start);
        assert_eq!(h.orch.state(), AgentState::Idle);
        assert!(!h.orch.is_capturing());
        assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_then_start() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Wake);
        assert_eq!(h.orch.state(), AgentState::Wake);
        h.orch.handle_event(SessionEvent::Start);
        assert_eq!(h.orch.state(), AgentState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_turn() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        h.say("what's my portfolio worth");

        assert_eq!(h.orch.state(), AgentState::Thinking);
        assert_eq!(h.orch.utterance(), "what's my portfolio worth");
        assert_eq!(h.recognizer.stops.load(Ordering::SeqCst), 1);

        h.pump_until_state(AgentState::Speaking).await;
        assert_eq!(h.orch.response(), Some("Your portfolio is worth $12,400."));
        assert!(h.devices.output.is_in_use());

        h.pump_until_state(AgentState::Listening).await;
        assert_eq!(h.orch.utterance(), "");
        assert_eq!(h.orch.response(), None);
        assert!(!h.devices.output.is_in_use());
        assert_eq!(h.output.played.load(Ordering::SeqCst), 4);
        assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);
        assert_eq!(
            *h.output.texts.lock().unwrap(),
            vec!["Your portfolio is worth $12,400.".to_string()]
        );

        let path: Vec<_> = h.transitions().into_iter().map(|(_, to, _)| to).collect();
        assert_eq!(
            path,
            vec![
                AgentState::Listening,
                AgentState::Thinking,
                AgentState::Speaking,
                AgentState::Listening
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_waits_for_settle_delay() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        h.say("hello");
        h.pump_until_state(AgentState::Speaking).await;

        // Playback finishes, but the phase holds until the settle delay elapses
        h.pump().await;
        assert!(!h.orch.is_playing());
        assert_eq!(h.orch.state(), AgentState::Speaking);

        let before = tokio::time::Instant::now();
        h.pump_until_state(AgentState::Listening).await;
        assert!(before.elapsed() >= SessionConfig::default().settle_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_cancels_playback_once() {
        let mut h = Harness::new(
            MockCompletion::replying(Duration::from_millis(50), "a long answer"),
            MockOutput::new(40, Duration::from_millis(100)),
        );
        h.orch.handle_event(SessionEvent::Start);
        h.say("tell me everything");
        h.pump_until_state(AgentState::Speaking).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(h.orch.is_playing());
        h.drain_events();

        // User talks over the response
        h.frames(0.0, 200);
        h.frames(0.5, 600);

        assert_eq!(h.orch.state(), AgentState::Listening);
        assert_eq!(h.orch.response(), None);
        assert!(!h.devices.output.is_in_use());

        let played = {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.output.played.load(Ordering::SeqCst)
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.output.cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(h.output.played.load(Ordering::SeqCst), played);

        let events = h.drain_events();
        assert!(events.contains(&StateEvent::SpeechStarted));
        assert_eq!(
            events.iter().filter(|e| matches!(e, StateEvent::BargeIn { .. })).count(),
            1
        );
        assert!(events.iter().any(|e| matches!(
            e,
            StateEvent::StateChanged { from: AgentState::Speaking, to: AgentState::Listening, reason, .. }
                if reason == "barge-in"
        )));

        // The cancelled playback reports back under the abandoned epoch
        h.pump().await;
        assert_eq!(h.orch.state(), AgentState::Listening);
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, StateEvent::StaleResponseDiscarded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_while_listening_is_not_barge_in() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        h.drain_events();

        h.frames(0.0, 200);
        h.frames(0.5, 600);
        assert_eq!(h.orch.vad_state(), VadState::Speech);
        assert_eq!(h.orch.state(), AgentState::Listening);
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, StateEvent::BargeIn { .. })));

        let status = h.orch.status();
        assert_eq!(status.vad_state, VadState::Speech);
        assert!((status.raw_energy - 0.5).abs() < 1e-4);
        assert!(status.energy > status.threshold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_and_interim_transcripts_ignored() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        let epoch = h.orch.epoch();

        h.say("   \t ");
        h.orch
            .handle_event(SessionEvent::Transcript(TranscriptSegment::interim("what's")));

        assert_eq!(h.orch.state(), AgentState::Listening);
        assert_eq!(h.orch.epoch(), epoch);
        assert_eq!(h.completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_final_transcript_processed_once() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);

        let sink = h.recognizer.sink.lock().unwrap().clone().unwrap();
        sink.on_result(TranscriptSegment::final_result("what's my portfolio worth"));
        sink.on_result(TranscriptSegment::final_result("what's my portfolio worth"));

        h.pump().await;
        h.pump().await;
        assert_eq!(h.orch.state(), AgentState::Thinking);

        h.pump_until_state(AgentState::Speaking).await;
        assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_error_recovers_to_idle() {
        let mut h = Harness::new(
            MockCompletion::with_results(
                Duration::from_millis(50),
                vec![Err(ServiceError::Completion("502 from upstream".into()))],
            ),
            MockOutput::new(1, Duration::from_millis(100)),
        );
        h.orch.handle_event(SessionEvent::Start);
        h.say("hello");

        h.pump_until_state(AgentState::Error).await;
        assert!(!h.orch.is_capturing());
        assert!(!h.devices.capture.is_in_use());

        let started = tokio::time::Instant::now();
        h.pump_until_state(AgentState::Idle).await;
        assert!(started.elapsed() >= SessionConfig::default().error_cooldown);

        let transitions = h.transitions();
        let (_, _, reason) = transitions.last().unwrap();
        assert_eq!(reason, "Error recovery");

        // The session is disabled: transcripts no longer trigger work
        h.say("are you there");
        assert_eq!(h.orch.state(), AgentState::Idle);
        assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_stale() {
        let mut h = Harness::new(
            MockCompletion::replying(Duration::from_secs(20), "too late"),
            MockOutput::new(1, Duration::from_millis(100)),
        );
        h.orch.handle_event(SessionEvent::Start);
        h.say("what's my portfolio worth");

        h.pump().await;
        assert_eq!(h.orch.state(), AgentState::Error);
        assert!(!h.devices.capture.is_in_use());

        h.pump().await;
        assert_eq!(h.orch.state(), AgentState::Idle);
        let epoch = h.orch.epoch();
        h.drain_events();

        // Completion finally answers at 20s
        h.pump().await;
        assert_eq!(h.orch.state(), AgentState::Idle);
        assert_eq!(h.orch.epoch(), epoch);
        assert!(!h.devices.output.is_in_use());
        let events = h.drain_events();
        assert!(matches!(
            events.as_slice(),
            [StateEvent::StaleResponseDiscarded { current_epoch, .. }] if *current_epoch == epoch
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unspeakable_response_is_an_error() {
        let mut h = Harness::new(
            MockCompletion::replying(Duration::from_millis(10), "**  ``"),
            MockOutput::new(1, Duration::from_millis(100)),
        );
        h.orch.handle_event(SessionEvent::Start);
        h.say("hello");
        h.pump_until_state(AgentState::Error).await;
        assert_eq!(h.output.texts.lock().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_error_releases_microphone() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        h.orch
            .handle_event(SessionEvent::RecognizerError("network unreachable".into()));

        assert_eq!(h.orch.state(), AgentState::Error);
        assert!(!h.devices.capture.is_in_use());
        assert_eq!(h.recognizer.stops.load(Ordering::SeqCst), 1);

        // Frames after release are ignored by the detector
        h.frames(0.5, 600);
        assert_eq!(h.orch.vad_state(), VadState::Silence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_restart_after_end() {
        let mut h = Harness::standard();
        h.orch.handle_event(SessionEvent::Start);
        h.orch.handle_event(SessionEvent::RecognizerEnded);

        let before = tokio::time::Instant::now();
        h.pump().await;
        assert!(before.elapsed() >= Duration::from_millis(100));
        assert_eq!(h.recognizer.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_speaking_releases_everything() {
        let mut h = Harness::new(
            MockCompletion::replying(Duration::from_millis(10), "an answer"),
            MockOutput::new(40, Duration::from_millis(100)),
        );
        h.orch.handle_event(SessionEvent::Start);
        h.say("hello");
        h.pump_until_state(AgentState::Speaking).await;

        h.orch.handle_event(SessionEvent::Stop);
        assert_eq!(h.orch.state(), AgentState::Idle);
        assert!(!h.devices.capture.is_in_use());
        assert!(!h.devices.output.is_in_use());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.output.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_with_handle() {
        let h = Harness::standard();
        let devices = h.devices.clone();
        let handle = h.orch.handle();
        let task = tokio::spawn(h.orch.run(h.queue));

        handle.start().unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AgentState::Listening);
        assert!(status.session_active);

        handle.stop().unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, AgentState::Idle);
        assert!(!status.session_active);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(!devices.capture.is_in_use());
    }
}
