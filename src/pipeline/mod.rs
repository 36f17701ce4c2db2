//! Pipeline wiring: the queues between stages and the service
//! definitions that bring the six workers up in dependency order.
//!
//! Queue receivers are shared behind async mutexes (the Rust analogue of
//! the reference queues the stages block on) so a stage can be stopped
//! and restarted — the TTS voice swap and the capture/monitor start/stop
//! surface both rely on this.

pub mod messages;
pub mod monitor;
pub mod stages;

use crate::asr::HttpAsrEngine;
use crate::audio::aec::ReferenceBuffer;
use crate::audio::{AudioCapture, CpalPlayer};
use crate::config::{DialogueConfig, TtsConfig};
use crate::llm::LlmClient;
use crate::pipeline::messages::{Frame, UiMessage, VoiceTask};
use crate::pipeline::monitor::SpeechMonitor;
use crate::prompts::PromptStore;
use crate::services::{ServiceDefinition, spawn_service};
use crate::state::StateRegistry;
use crate::state::events::PipelineSignals;
use crate::tts::HttpTtsEngine;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Channel buffer sizes.
const AUDIO_FRAMES_CHANNEL_SIZE: usize = 64;
const USER_VOICE_CHANNEL_SIZE: usize = 8;
const TRANSCRIBED_TEXT_CHANNEL_SIZE: usize = 8;
const TEXT_INPUT_CHANNEL_SIZE: usize = 16;
const AUDIO_OUTPUT_CHANNEL_SIZE: usize = 16;

/// A queue endpoint a restartable stage can block on.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

fn shared<T>(rx: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(rx))
}

/// Receive from a shared queue endpoint.
pub(crate) async fn recv_shared<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// The in-process queues coupling the stages.
pub struct PipelineQueues {
    pub audio_frames_tx: mpsc::Sender<Frame>,
    pub audio_frames_rx: SharedReceiver<Frame>,
    pub user_voice_tx: mpsc::Sender<VoiceTask>,
    pub user_voice_rx: SharedReceiver<VoiceTask>,
    pub transcribed_text_tx: mpsc::Sender<VoiceTask>,
    pub transcribed_text_rx: SharedReceiver<VoiceTask>,
    pub text_input_tx: mpsc::Sender<VoiceTask>,
    pub text_input_rx: SharedReceiver<VoiceTask>,
    pub audio_output_tx: mpsc::Sender<VoiceTask>,
    pub audio_output_rx: SharedReceiver<VoiceTask>,
    pub ui_messages_tx: mpsc::UnboundedSender<UiMessage>,
}

impl PipelineQueues {
    /// Create all queues; the UI message receiver goes to the WebSocket
    /// forwarder.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiMessage>) {
        let (audio_frames_tx, audio_frames_rx) = mpsc::channel(AUDIO_FRAMES_CHANNEL_SIZE);
        let (user_voice_tx, user_voice_rx) = mpsc::channel(USER_VOICE_CHANNEL_SIZE);
        let (transcribed_text_tx, transcribed_text_rx) =
            mpsc::channel(TRANSCRIBED_TEXT_CHANNEL_SIZE);
        let (text_input_tx, text_input_rx) = mpsc::channel(TEXT_INPUT_CHANNEL_SIZE);
        let (audio_output_tx, audio_output_rx) = mpsc::channel(AUDIO_OUTPUT_CHANNEL_SIZE);
        let (ui_messages_tx, ui_messages_rx) = mpsc::unbounded_channel();

        (
            Self {
                audio_frames_tx,
                audio_frames_rx: shared(audio_frames_rx),
                user_voice_tx,
                user_voice_rx: shared(user_voice_rx),
                transcribed_text_tx,
                transcribed_text_rx: shared(transcribed_text_rx),
                text_input_tx,
                text_input_rx: shared(text_input_rx),
                audio_output_tx,
                audio_output_rx: shared(audio_output_rx),
                ui_messages_tx,
            },
            ui_messages_rx,
        )
    }
}

/// Everything the stages and the HTTP surface share.
pub struct PipelineContext {
    pub config: DialogueConfig,
    pub registry: Arc<StateRegistry>,
    pub signals: Arc<PipelineSignals>,
    pub queues: PipelineQueues,
    pub prompts: Arc<PromptStore>,
    /// Playback suppression flag (the playback stop/resume control).
    pub playback_stopped: Arc<AtomicBool>,
    /// Capture pause flag (capture keeps reading, stops enqueueing).
    pub capture_paused: Arc<AtomicBool>,
    /// Echo-canceller reference ring shared by playback and capture.
    pub reference: ReferenceBuffer,
}

impl PipelineContext {
    /// Build the shared context from configuration.
    pub fn new(config: DialogueConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<UiMessage>) {
        let (queues, ui_messages_rx) = PipelineQueues::new();
        let reference = ReferenceBuffer::new(config.audio.input_sample_rate);
        let ctx = Arc::new(Self {
            config,
            registry: Arc::new(StateRegistry::new()),
            signals: PipelineSignals::new(),
            queues,
            prompts: Arc::new(PromptStore::new()),
            playback_stopped: Arc::new(AtomicBool::new(false)),
            capture_paused: Arc::new(AtomicBool::new(false)),
            reference,
        });
        (ctx, ui_messages_rx)
    }
}

/// Service names.
pub const ASR_SERVICE: &str = "asr_worker";
pub const LLM_SERVICE: &str = "llm_generator";
pub const TTS_SERVICE: &str = "tts_audio_generator";
pub const PLAYBACK_SERVICE: &str = "audio_player";
pub const MONITOR_SERVICE: &str = "speech_monitor";
pub const CAPTURE_SERVICE: &str = "audio_capture";

/// The model-backed services started at boot, in dependency order.
pub fn core_service_definitions(ctx: &Arc<PipelineContext>) -> Vec<ServiceDefinition> {
    vec![
        asr_service(ctx),
        llm_service(ctx),
        tts_service(ctx, ctx.config.tts.clone()),
        playback_service(ctx),
    ]
}

/// ASR stage definition.
pub fn asr_service(ctx: &Arc<PipelineContext>) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    let timeout = Duration::from_secs(ctx.config.services.startup_timeout_secs);
    ServiceDefinition::new(
        ASR_SERVICE,
        Box::new(move || {
            let engine = Box::new(HttpAsrEngine::for_language(&ctx.config.asr));
            let config = ctx.config.asr.clone();
            let registry = Arc::clone(&ctx.registry);
            let signals = Arc::clone(&ctx.signals);
            let rx = Arc::clone(&ctx.queues.user_voice_rx);
            let tx = ctx.queues.transcribed_text_tx.clone();
            Ok(spawn_service(move |ready, cancel| {
                stages::run_asr_stage(engine, config, registry, signals, rx, tx, ready, cancel)
            }))
        }),
    )
    .with_startup_timeout(timeout)
}

/// LLM stage definition (slow model servers get a longer timeout).
pub fn llm_service(ctx: &Arc<PipelineContext>) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    let timeout = Duration::from_secs(ctx.config.services.llm_startup_timeout_secs);
    ServiceDefinition::new(
        LLM_SERVICE,
        Box::new(move || {
            let client = LlmClient::new(&ctx.config.llm);
            let config = ctx.config.llm.clone();
            let prompts = Arc::clone(&ctx.prompts);
            let registry = Arc::clone(&ctx.registry);
            let rx = Arc::clone(&ctx.queues.transcribed_text_rx);
            let tx = ctx.queues.text_input_tx.clone();
            let ui_tx = ctx.queues.ui_messages_tx.clone();
            Ok(spawn_service(move |ready, cancel| {
                stages::run_llm_stage(
                    client, config, prompts, registry, rx, tx, ui_tx, ready, cancel,
                )
            }))
        }),
    )
    .with_dependencies(&[ASR_SERVICE])
    .with_startup_timeout(timeout)
}

/// TTS stage definition. `tts_config` is separate so the engine-swap
/// surface can start a replacement with a different voice.
pub fn tts_service(ctx: &Arc<PipelineContext>, tts_config: TtsConfig) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    let timeout = Duration::from_secs(ctx.config.services.tts_startup_timeout_secs);
    ServiceDefinition::new(
        TTS_SERVICE,
        Box::new(move || {
            let engine = Box::new(HttpTtsEngine::new(&tts_config));
            let registry = Arc::clone(&ctx.registry);
            let signals = Arc::clone(&ctx.signals);
            let rx = Arc::clone(&ctx.queues.text_input_rx);
            let tx = ctx.queues.audio_output_tx.clone();
            Ok(spawn_service(move |ready, cancel| {
                stages::run_tts_stage(engine, registry, signals, rx, tx, ready, cancel)
            }))
        }),
    )
    .with_dependencies(&[LLM_SERVICE])
    .with_startup_timeout(timeout)
}

/// Playback stage definition.
pub fn playback_service(ctx: &Arc<PipelineContext>) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    ServiceDefinition::new(
        PLAYBACK_SERVICE,
        Box::new(move || {
            let player = Box::new(CpalPlayer::new(&ctx.config.audio)?);
            let registry = Arc::clone(&ctx.registry);
            let signals = Arc::clone(&ctx.signals);
            let control = stages::PlaybackControl {
                stopped: Arc::clone(&ctx.playback_stopped),
                aec_ref: ctx.config.aec.enabled.then(|| ctx.reference.handle()),
            };
            let rx = Arc::clone(&ctx.queues.audio_output_rx);
            let ui_tx = ctx.queues.ui_messages_tx.clone();
            Ok(spawn_service(move |ready, cancel| {
                stages::run_playback_stage(
                    player, registry, signals, control, rx, ui_tx, ready, cancel,
                )
            }))
        }),
    )
    .with_dependencies(&[TTS_SERVICE])
}

/// Speech monitor definition (started by the system-start surface).
pub fn monitor_service(ctx: &Arc<PipelineContext>) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    ServiceDefinition::new(
        MONITOR_SERVICE,
        Box::new(move || {
            let monitor = SpeechMonitor::new(
                ctx.config.monitor.clone(),
                ctx.config.asr.language,
                Arc::clone(&ctx.registry),
                Arc::clone(&ctx.signals),
            );
            let rx = Arc::clone(&ctx.queues.audio_frames_rx);
            let tx = ctx.queues.user_voice_tx.clone();
            Ok(spawn_service(move |ready, cancel| {
                monitor::run_monitor_stage(monitor, rx, tx, ready, cancel)
            }))
        }),
    )
}

/// Audio capture definition (started by the system-start surface).
pub fn capture_service(ctx: &Arc<PipelineContext>) -> ServiceDefinition {
    let ctx = Arc::clone(ctx);
    ServiceDefinition::new(
        CAPTURE_SERVICE,
        Box::new(move || {
            let capture = AudioCapture::new(
                &ctx.config.audio,
                &ctx.config.aec,
                &ctx.config.monitor,
                ctx.reference.clone(),
                Arc::clone(&ctx.capture_paused),
            )?;
            let tx = ctx.queues.audio_frames_tx.clone();
            Ok(spawn_service(move |ready, cancel| async move {
                if let Err(e) = capture.run(tx, ready, cancel).await {
                    tracing::error!("capture stage failed: {e}");
                }
            }))
        }),
    )
    .with_dependencies(&[MONITOR_SERVICE])
}
