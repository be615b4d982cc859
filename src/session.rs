//! Per-call session state machine — the heart of the system.
//!
//! Owns one STT, TTS, and LLM instance, the pre-greeting audio buffer, the
//! outbound TTS-audio queue, and the phase/gate flags that multiplex the
//! three streaming services across a single call.
//!
//! Grounded in `server/realtime_voice.rs`'s `SessionState`/`Interrupt`
//! handling as the closest existing barge-in analogue and
//! `voice/coordinator.rs`'s event-channel shape, with exact
//! phase/gate/greeting-protocol/barge-in semantics from
//! `original_source/voice_caller/src/websocket_server.py`'s `CallSession`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::stream as futures_stream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BedrockConfig;
use crate::llm::LlmClient;
use crate::stt::{SttClient, SttEvent};
use crate::tts::{TtsClient, TtsEvent};

const PRE_GREETING_BUFFER_CAP: usize = 500;
const TTS_OUT_QUEUE_CAP: usize = 1000;
/// Barge-in is only honored once this many TTS frames have actually reached
/// telephony, to suppress false positives from residual echo / VAD glitches.
const BARGEIN_CHUNK_THRESHOLD: u32 = 10;
const GREETING_QUEUE_READY_LEN: usize = 10;
const GREETING_QUEUE_READY_TIMEOUT: Duration = Duration::from_secs(1);
const GREETING_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const GREETING_DRAIN_POLL: Duration = Duration::from_millis(20);
const GREETING_POST_DRAIN_SETTLE: Duration = Duration::from_millis(500);

/// Session lifecycle phase (§4.4). `Terminated` is the implicit sixth state
/// the gate-invariant table requires alongside the five named in the
/// transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Greeting,
    Listening,
    Thinking,
    Speaking,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

/// Per-call state machine. Cheap to clone (`Arc`); internal state is behind
/// small, never-held-across-`.await` locks for the fields the session's own
/// task and the endpoint's drain loop both touch, per §5's shared-resource
/// policy.
pub struct Session {
    pub call_id: String,
    pub stream_id: String,

    phase: StdMutex<Phase>,
    stt_gate: AtomicBool,
    bargein_armed: AtomicBool,
    tts_sent_chunks: AtomicU32,
    is_ready: AtomicBool,
    is_active: AtomicBool,

    conversation: StdMutex<Vec<Turn>>,
    pre_greeting_buffer: StdMutex<VecDeque<Vec<u8>>>,
    tts_out_queue: StdMutex<VecDeque<Vec<u8>>>,

    greeting_text: String,
    llm: AsyncMutex<LlmClient>,

    stt: StdMutex<Option<Arc<SttClient>>>,
    tts: StdMutex<Option<Arc<TtsClient>>>,

    pending_llm_task: StdMutex<Option<JoinHandle<()>>>,
    run_handle: StdMutex<Option<JoinHandle<()>>>,

    /// Set on barge-in; the telephony drain loop consumes it once to tell
    /// the telephony side to clear whatever audio it already buffered from
    /// frames sent before the cancellation took effect locally.
    clear_pending: AtomicBool,
}

impl Session {
    /// Construct a new Session in the `Connecting` phase. STT/TTS are not
    /// yet attached; inbound audio is buffered until `attach_and_begin` runs.
    pub fn new(
        call_id: String,
        stream_id: String,
        greeting_text: String,
        system_prompt: Option<String>,
        bedrock_config: BedrockConfig,
    ) -> Arc<Session> {
        let mut llm = LlmClient::new(bedrock_config, system_prompt);
        llm.set_pending_greeting(greeting_text.clone());

        Arc::new(Session {
            call_id,
            stream_id,
            phase: StdMutex::new(Phase::Connecting),
            stt_gate: AtomicBool::new(false),
            bargein_armed: AtomicBool::new(false),
            tts_sent_chunks: AtomicU32::new(0),
            is_ready: AtomicBool::new(false),
            is_active: AtomicBool::new(true),
            conversation: StdMutex::new(Vec::new()),
            pre_greeting_buffer: StdMutex::new(VecDeque::with_capacity(64)),
            tts_out_queue: StdMutex::new(VecDeque::with_capacity(64)),
            greeting_text,
            llm: AsyncMutex::new(llm),
            stt: StdMutex::new(None),
            tts: StdMutex::new(None),
            pending_llm_task: StdMutex::new(None),
            run_handle: StdMutex::new(None),
            clear_pending: AtomicBool::new(false),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn stt_gate(&self) -> bool {
        self.stt_gate.load(Ordering::SeqCst)
    }

    pub fn tts_sent_chunks(&self) -> u32 {
        self.tts_sent_chunks.load(Ordering::SeqCst)
    }

    pub fn conversation_snapshot(&self) -> Vec<Turn> {
        self.conversation.lock().unwrap().clone()
    }

    pub fn pre_greeting_buffer_len(&self) -> usize {
        self.pre_greeting_buffer.lock().unwrap().len()
    }

    pub fn tts_out_queue_len(&self) -> usize {
        self.tts_out_queue.lock().unwrap().len()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn clear_pre_greeting_buffer(&self) {
        let mut buf = self.pre_greeting_buffer.lock().unwrap();
        if !buf.is_empty() {
            info!("discarding {} buffered pre-greeting audio frames", buf.len());
        }
        buf.clear();
    }

    /// §4.5 `handle_media`: route an inbound-track audio frame per the
    /// current phase's gate invariant.
    pub async fn handle_inbound_audio(&self, data: Vec<u8>) {
        if !self.is_active() {
            return;
        }
        match self.phase() {
            Phase::Connecting => {
                let mut buf = self.pre_greeting_buffer.lock().unwrap();
                if buf.len() >= PRE_GREETING_BUFFER_CAP {
                    buf.pop_front();
                }
                buf.push_back(data);
            }
            Phase::Greeting => { /* discard: caller silence expected */ }
            Phase::Terminated => { /* drop */ }
            Phase::Listening | Phase::Thinking | Phase::Speaking => {
                if self.stt_gate() {
                    let stt = self.stt.lock().unwrap().clone();
                    if let Some(stt) = stt {
                        stt.send_audio(&data).await;
                    }
                }
            }
        }
    }

    /// Called once STT and TTS have both connected successfully. Clears the
    /// pre-greeting buffer, enters `Greeting`, and spawns the session's
    /// single run loop (greeting protocol, then the event-driven main loop).
    pub fn attach_and_begin(
        self: &Arc<Self>,
        stt: Arc<SttClient>,
        stt_rx: UnboundedReceiver<SttEvent>,
        tts: Arc<TtsClient>,
        tts_rx: UnboundedReceiver<TtsEvent>,
    ) {
        *self.stt.lock().unwrap() = Some(stt);
        *self.tts.lock().unwrap() = Some(tts);
        self.is_ready.store(true, Ordering::SeqCst);
        self.clear_pre_greeting_buffer();
        self.set_phase(Phase::Greeting);

        let me = self.clone();
        let handle = tokio::spawn(async move { me.run_loop(stt_rx, tts_rx).await });
        *self.run_handle.lock().unwrap() = Some(handle);
    }

    async fn run_loop(
        self: Arc<Self>,
        mut stt_rx: UnboundedReceiver<SttEvent>,
        mut tts_rx: UnboundedReceiver<TtsEvent>,
    ) {
        self.run_greeting_protocol().await;

        loop {
            if !self.is_active() {
                break;
            }
            let mut stt_closed = false;
            let mut tts_closed = false;
            tokio::select! {
                maybe = stt_rx.recv() => {
                    match maybe {
                        Some(event) => self.handle_stt_event(event),
                        None => stt_closed = true,
                    }
                }
                maybe = tts_rx.recv() => {
                    match maybe {
                        Some(event) => self.handle_tts_event(event),
                        None => tts_closed = true,
                    }
                }
            }
            if stt_closed && tts_closed {
                break;
            }
        }
    }

    /// §4.4 Greeting protocol: send the greeting + flush, wait for the queue
    /// to fill or 1s to pass, poll until it drains (bounded ~10s), settle
    /// 500ms, then arm STT/barge-in and enter Listening.
    async fn run_greeting_protocol(&self) {
        let tts = self.tts.lock().unwrap().clone();
        let Some(tts) = tts else {
            warn!("greeting protocol started without a TTS client attached");
            return;
        };

        info!("sending greeting: {}", self.greeting_text);
        tts.send(&self.greeting_text).await;
        tts.flush().await;

        let wait_start = Instant::now();
        loop {
            if !self.is_active() {
                return;
            }
            if self.tts_out_queue_len() > GREETING_QUEUE_READY_LEN {
                break;
            }
            if wait_start.elapsed() >= GREETING_QUEUE_READY_TIMEOUT {
                break;
            }
            tokio::time::sleep(GREETING_DRAIN_POLL).await;
        }

        let drain_start = Instant::now();
        loop {
            if !self.is_active() {
                return;
            }
            if self.tts_out_queue_len() == 0 {
                break;
            }
            if drain_start.elapsed() >= GREETING_DRAIN_TIMEOUT {
                warn!("greeting drain timed out with frames still queued");
                break;
            }
            tokio::time::sleep(GREETING_DRAIN_POLL).await;
        }

        tokio::time::sleep(GREETING_POST_DRAIN_SETTLE).await;

        if !self.is_active() {
            return;
        }
        info!("greeting playback complete, enabling STT and barge-in");
        self.set_phase(Phase::Listening);
        self.stt_gate.store(true, Ordering::SeqCst);
        self.bargein_armed.store(false, Ordering::SeqCst);
    }

    fn handle_stt_event(self: &Arc<Self>, event: SttEvent) {
        match event {
            SttEvent::SpeechStarted => self.on_speech_started(),
            SttEvent::SpeechEnded(text) => self.on_turn_trigger(text),
            SttEvent::UtteranceEnd | SttEvent::InterimTranscript(_) | SttEvent::FinalTranscript { .. } => {
                // Already folded into a consolidated `SpeechEnded` by the STT
                // client when non-empty; nothing further to do here.
            }
        }
    }

    /// §4.4 barge-in rule: only cancels if armed, `phase` is Thinking or
    /// Speaking, and enough TTS has actually reached telephony to rule out a
    /// false trigger.
    fn on_speech_started(self: &Arc<Self>) {
        let phase = self.phase();
        let armed = self.bargein_armed.load(Ordering::SeqCst);
        let sent = self.tts_sent_chunks();

        if !(armed && matches!(phase, Phase::Thinking | Phase::Speaking) && sent > BARGEIN_CHUNK_THRESHOLD) {
            debug!(
                "speech detected but not enough to trigger barge-in (phase={:?}, armed={}, sent={})",
                phase, armed, sent
            );
            return;
        }

        info!("barge-in detected after {} TTS chunks, cancelling", sent);

        if let Some(handle) = self.pending_llm_task.lock().unwrap().take() {
            handle.abort();
        }
        let tts = self.tts.lock().unwrap().clone();
        if let Some(tts) = tts {
            tokio::spawn(async move { tts.cancel().await });
        }
        self.tts_out_queue.lock().unwrap().clear();
        self.tts_sent_chunks.store(0, Ordering::SeqCst);
        self.clear_pending.store(true, Ordering::SeqCst);
        self.set_phase(Phase::Listening);
        self.bargein_armed.store(false, Ordering::SeqCst);
    }

    /// Consumed by the telephony drain loop: true at most once per barge-in,
    /// telling it to tell telephony to clear whatever it already buffered.
    pub fn take_clear_pending(&self) -> bool {
        self.clear_pending.swap(false, Ordering::SeqCst)
    }

    /// §4.4 turn trigger: bound to both `speech_ended` and `utterance_end`;
    /// idempotent against an already-consumed (empty) transcript.
    fn on_turn_trigger(self: &Arc<Self>, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if !matches!(self.phase(), Phase::Listening | Phase::Thinking | Phase::Speaking) {
            return;
        }

        info!("user said: {}", text);
        self.conversation.lock().unwrap().push(Turn {
            role: TurnRole::User,
            text: text.clone(),
        });

        if let Some(tts) = self.tts.lock().unwrap().clone() {
            tts.reset_cancel();
        }
        self.set_phase(Phase::Thinking);
        self.bargein_armed.store(true, Ordering::SeqCst);
        self.tts_sent_chunks.store(0, Ordering::SeqCst);

        let me = self.clone();
        let handle = tokio::spawn(async move { me.run_turn(text).await });
        *self.pending_llm_task.lock().unwrap() = Some(handle);
    }

    /// Generate the assistant's reply and pipe it into TTS. If this task is
    /// aborted (barge-in), execution stops before the final history append,
    /// so no partial assistant turn is ever recorded (§3 turn-ordering
    /// invariant, §7).
    async fn run_turn(self: Arc<Self>, user_text: String) {
        let fragments = {
            let mut llm = self.llm.lock().await;
            llm.generate_stream(&user_text).await
        };
        let full_text = fragments.join("");

        let tts = self.tts.lock().unwrap().clone();
        if let Some(tts) = tts {
            tts.stream(futures_stream::iter(fragments)).await;
        }

        self.conversation.lock().unwrap().push(Turn {
            role: TurnRole::Assistant,
            text: full_text,
        });
        self.pending_llm_task.lock().unwrap().take();
    }

    fn handle_tts_event(&self, event: TtsEvent) {
        match event {
            TtsEvent::Audio(bytes) => {
                if !self.is_active() {
                    return;
                }
                let mut queue = self.tts_out_queue.lock().unwrap();
                if queue.len() >= TTS_OUT_QUEUE_CAP {
                    queue.pop_front();
                }
                queue.push_back(bytes);
            }
            TtsEvent::Flushed => {
                let mut phase = self.phase.lock().unwrap();
                if *phase == Phase::Speaking {
                    *phase = Phase::Listening;
                    self.bargein_armed.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Pop up to one frame for the drain loop (§4.6) to send to telephony.
    pub fn pop_tts_frame(&self) -> Option<Vec<u8>> {
        self.tts_out_queue.lock().unwrap().pop_front()
    }

    /// Record that a frame actually reached telephony. Transitions
    /// `Thinking` → `Speaking` on the first such frame of the turn.
    pub fn note_tts_frame_sent(&self) {
        let previous = self.tts_sent_chunks.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            let mut phase = self.phase.lock().unwrap();
            if *phase == Phase::Thinking {
                *phase = Phase::Speaking;
            }
        }
    }

    /// Idempotent teardown: cancels the pending turn, closes STT/TTS
    /// concurrently, and marks the session Terminated.
    pub async fn close(&self) {
        if !self.is_active.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("closing session {}", self.stream_id);

        if let Some(handle) = self.run_handle.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.pending_llm_task.lock().unwrap().take() {
            handle.abort();
        }

        self.set_phase(Phase::Terminated);
        self.stt_gate.store(false, Ordering::SeqCst);
        self.bargein_armed.store(false, Ordering::SeqCst);

        let stt = self.stt.lock().unwrap().clone();
        let tts = self.tts.lock().unwrap().clone();
        tokio::join!(
            async {
                if let Some(stt) = stt {
                    stt.close().await;
                }
            },
            async {
                if let Some(tts) = tts {
                    tts.close().await;
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BedrockConfig {
        BedrockConfig {
            api_key: "test".to_string(),
            region: "us-east-1".to_string(),
            model_id: "us.amazon.nova-pro-v1:0".to_string(),
            max_tokens: 50,
            temperature: 0.7,
        }
    }

    fn new_session() -> Arc<Session> {
        Session::new(
            "call-1".to_string(),
            "stream-1".to_string(),
            "Hello!".to_string(),
            None,
            test_config(),
        )
    }

    #[test]
    fn starts_in_connecting_with_gates_closed() {
        let session = new_session();
        assert_eq!(session.phase(), Phase::Connecting);
        assert!(!session.stt_gate());
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn connecting_phase_buffers_inbound_audio() {
        let session = new_session();
        session.handle_inbound_audio(vec![1, 2, 3]).await;
        assert_eq!(session.pre_greeting_buffer_len(), 1);
    }

    #[tokio::test]
    async fn pre_greeting_buffer_drops_oldest_when_full() {
        let session = new_session();
        for i in 0..(PRE_GREETING_BUFFER_CAP + 5) {
            session.handle_inbound_audio(vec![i as u8]).await;
        }
        assert_eq!(session.pre_greeting_buffer_len(), PRE_GREETING_BUFFER_CAP);
    }

    #[tokio::test]
    async fn greeting_phase_discards_inbound_audio() {
        let session = new_session();
        session.set_phase(Phase::Greeting);
        session.handle_inbound_audio(vec![9, 9, 9]).await;
        assert_eq!(session.pre_greeting_buffer_len(), 0);
    }

    #[test]
    fn empty_transcript_does_not_trigger_a_turn() {
        let session = new_session();
        session.set_phase(Phase::Listening);
        session.on_turn_trigger("   ".to_string());
        assert!(session.conversation_snapshot().is_empty());
        assert_eq!(session.phase(), Phase::Listening);
    }

    #[test]
    fn glitch_suppression_does_not_cancel_on_low_chunk_count() {
        let session = new_session();
        session.set_phase(Phase::Speaking);
        session.bargein_armed.store(true, Ordering::SeqCst);
        session.tts_sent_chunks.store(3, Ordering::SeqCst);
        session.tts_out_queue.lock().unwrap().push_back(vec![0; 10]);

        session.on_speech_started();

        assert_eq!(session.phase(), Phase::Speaking);
        assert_eq!(session.tts_out_queue_len(), 1);
    }

    #[test]
    fn barge_in_clears_queue_and_returns_to_listening() {
        let session = new_session();
        session.attach_stubbed_tts_for_test();
        session.set_phase(Phase::Speaking);
        session.bargein_armed.store(true, Ordering::SeqCst);
        session.tts_sent_chunks.store(50, Ordering::SeqCst);
        session.tts_out_queue.lock().unwrap().push_back(vec![0; 10]);

        session.on_speech_started();

        assert_eq!(session.phase(), Phase::Listening);
        assert_eq!(session.tts_out_queue_len(), 0);
        assert_eq!(session.tts_sent_chunks(), 0);
        assert!(!session.bargein_armed.load(Ordering::SeqCst));
    }

    #[test]
    fn bounded_tts_queue_drops_oldest_on_overflow() {
        let session = new_session();
        for i in 0..(TTS_OUT_QUEUE_CAP + 10) {
            session.handle_tts_event(TtsEvent::Audio(vec![i as u8]));
        }
        assert_eq!(session.tts_out_queue_len(), TTS_OUT_QUEUE_CAP);
    }

    #[test]
    fn first_sent_frame_during_thinking_transitions_to_speaking() {
        let session = new_session();
        session.set_phase(Phase::Thinking);
        session.note_tts_frame_sent();
        assert_eq!(session.phase(), Phase::Speaking);
    }

    #[test]
    fn flushed_event_during_speaking_returns_to_listening() {
        let session = new_session();
        session.set_phase(Phase::Speaking);
        session.bargein_armed.store(true, Ordering::SeqCst);
        session.handle_tts_event(TtsEvent::Flushed);
        assert_eq!(session.phase(), Phase::Listening);
        assert!(!session.bargein_armed.load(Ordering::SeqCst));
    }

    impl Session {
        /// Test helper: exercise barge-in without a real TTS connection.
        fn attach_stubbed_tts_for_test(self: &Arc<Self>) {
            // `on_speech_started` tolerates a `None` TTS client; nothing to attach.
        }
    }
}
