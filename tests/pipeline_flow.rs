//! Stage-level behavior with scripted engines: interruption checkpoints,
//! long-utterance stitching, engine-failure recovery, and the playback
//! gate.

use async_trait::async_trait;
use parlance::asr::AsrEngine;
use parlance::audio::AudioPlayer;
use parlance::config::{AsrConfig, Language};
use parlance::error::{DialogueError, Result};
use parlance::pipeline::messages::{AudioClip, UiMessage, VoiceTask};
use parlance::pipeline::stages::{
    PlaybackControl, run_asr_stage, run_playback_stage, run_tts_stage,
};
use parlance::services::spawn_service;
use parlance::state::events::PipelineSignals;
use parlance::state::{AudioTaskState, StateRegistry};
use parlance::tts::TtsEngine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Shared<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

fn shared<T>(rx: mpsc::Receiver<T>) -> Shared<T> {
    Arc::new(tokio::sync::Mutex::new(rx))
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn recv_or_panic(rx: &mut mpsc::Receiver<VoiceTask>) -> VoiceTask {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("stage output within timeout")
        .expect("stage output channel open")
}

async fn assert_no_output(rx: &mut mpsc::Receiver<VoiceTask>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err(),
        "expected no stage output"
    );
}

/// ASR engine replaying a scripted sequence of results.
struct ScriptedAsr {
    replies: Mutex<VecDeque<Result<String>>>,
}

impl ScriptedAsr {
    fn new(replies: Vec<Result<String>>) -> Box<Self> {
        Box::new(Self {
            replies: Mutex::new(replies.into()),
        })
    }
}

#[async_trait]
impl AsrEngine for ScriptedAsr {
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    async fn warmup(&mut self) -> Result<()> {
        Ok(())
    }
    async fn transcribe(&mut self, _samples: &[f32], _language: Language) -> Result<String> {
        self.replies
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// TTS engine that renders one sample per input character, or fails on
/// scripted sentences.
struct ScriptedTts {
    fail_on: Vec<String>,
}

#[async_trait]
impl TtsEngine for ScriptedTts {
    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    async fn warmup(&mut self) -> Result<()> {
        Ok(())
    }
    async fn synthesize(&mut self, text: &str) -> Result<AudioClip> {
        if self.fail_on.iter().any(|s| s == text) {
            return Err(DialogueError::Tts("scripted failure".into()));
        }
        Ok(AudioClip {
            samples: vec![0.1; text.chars().count()],
            sample_rate: 24_000,
        })
    }
}

/// Player recording what it was asked to play.
#[derive(Clone, Default)]
struct RecordingPlayer {
    played: Arc<Mutex<Vec<usize>>>,
}

impl AudioPlayer for RecordingPlayer {
    fn play(&mut self, clip: &AudioClip) -> Result<()> {
        self.played.lock().expect("played lock").push(clip.samples.len());
        Ok(())
    }
}

fn utterance_task(registry: &StateRegistry) -> VoiceTask {
    let mut task = VoiceTask::new(
        registry.create_task_id(),
        registry.current_session_id(),
        Language::En,
    );
    task.answer_id = uuid::Uuid::new_v4().to_string();
    task.user_voice = vec![0.1; 16_000];
    task
}

fn sentence_task(registry: &StateRegistry, answer_id: &str, index: u32, text: &str) -> VoiceTask {
    let mut task = VoiceTask::new(
        registry.current_task_id(),
        registry.current_session_id(),
        Language::En,
    );
    task.answer_id = answer_id.to_owned();
    task.answer_index = index;
    task.answer_sentence = text.to_owned();
    task
}

struct AsrHarness {
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    input: mpsc::Sender<VoiceTask>,
    output: mpsc::Receiver<VoiceTask>,
    handle: parlance::services::ServiceHandle,
}

fn start_asr(engine: Box<ScriptedAsr>) -> AsrHarness {
    let registry = Arc::new(StateRegistry::new());
    let signals = PipelineSignals::new();
    let (input, rx) = mpsc::channel(8);
    let (tx, output) = mpsc::channel(8);
    let config = AsrConfig::default();
    let registry_clone = Arc::clone(&registry);
    let signals_clone = Arc::clone(&signals);
    let rx = shared(rx);
    let handle = spawn_service(move |ready, cancel| {
        run_asr_stage(
            engine,
            config,
            registry_clone,
            signals_clone,
            rx,
            tx,
            ready,
            cancel,
        )
    });
    AsrHarness {
        registry,
        signals,
        input,
        output,
        handle,
    }
}

#[tokio::test]
async fn asr_forwards_transcript_and_clears_audio() {
    let mut h = start_asr(ScriptedAsr::new(vec![Ok("hello world".to_owned())]));
    let task = utterance_task(&h.registry);
    h.input.send(task.clone()).await.expect("send");

    let out = recv_or_panic(&mut h.output).await;
    assert_eq!(out.transcribed_text, "hello world");
    assert!(out.user_voice.is_empty());
    assert!(out.timings.asr_started_at.is_some());
    assert!(out.timings.asr_finished_at.is_some());
    // A successful transcription leaves the utterance task in place.
    assert_eq!(h.registry.current_task_id(), task.id);
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn asr_empty_transcript_resets_task_id() {
    let mut h = start_asr(ScriptedAsr::new(vec![Ok("   ".to_owned())]));
    let task = utterance_task(&h.registry);
    h.input.send(task).await.expect("send");

    assert_no_output(&mut h.output).await;
    assert!(h.registry.current_task_id().is_empty());
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn asr_engine_failure_resets_task_id() {
    let mut h = start_asr(ScriptedAsr::new(vec![Err(DialogueError::Asr(
        "scripted".into(),
    ))]));
    let task = utterance_task(&h.registry);
    h.input.send(task).await.expect("send");

    assert_no_output(&mut h.output).await;
    assert!(h.registry.current_task_id().is_empty());
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn asr_stitches_long_utterance_fragments() {
    let mut h = start_asr(ScriptedAsr::new(vec![
        Ok("the first part".to_owned()),
        Ok("and the rest".to_owned()),
    ]));

    // Fragment 1: flushed at the long-utterance boundary while the user
    // keeps talking.
    let mut frag1 = utterance_task(&h.registry);
    frag1.over_long_threshold = true;
    h.signals.user_still_speaking.set();
    h.input.send(frag1.clone()).await.expect("send");

    // The fragment is cached and dropped, and the event consumed.
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !h.registry.is_answer_dropped(&frag1.answer_id) {
        assert!(tokio::time::Instant::now() < deadline, "fragment not dropped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.signals.user_still_speaking.is_set());
    assert_eq!(
        h.registry.audio_task_state(&frag1.id),
        Some(AudioTaskState::Drop)
    );

    // Fragment 2: same task id, fresh answer, dispatched after silence.
    let mut frag2 = frag1.clone();
    frag2.answer_id = uuid::Uuid::new_v4().to_string();
    frag2.over_long_threshold = false;
    h.input.send(frag2).await.expect("send");

    let out = recv_or_panic(&mut h.output).await;
    assert_eq!(out.transcribed_text, "the first part and the rest");
    h.handle.cancel.cancel();
}

struct TtsHarness {
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    input: mpsc::Sender<VoiceTask>,
    output: mpsc::Receiver<VoiceTask>,
    handle: parlance::services::ServiceHandle,
}

fn start_tts(engine: ScriptedTts) -> TtsHarness {
    let registry = Arc::new(StateRegistry::new());
    let signals = PipelineSignals::new();
    let (input, rx) = mpsc::channel(8);
    let (tx, output) = mpsc::channel(8);
    let registry_clone = Arc::clone(&registry);
    let signals_clone = Arc::clone(&signals);
    let rx = shared(rx);
    let handle = spawn_service(move |ready, cancel| {
        run_tts_stage(
            Box::new(engine),
            registry_clone,
            signals_clone,
            rx,
            tx,
            ready,
            cancel,
        )
    });
    TtsHarness {
        registry,
        signals,
        input,
        output,
        handle,
    }
}

#[tokio::test]
async fn tts_attaches_engine_audio() {
    let mut h = start_tts(ScriptedTts { fail_on: vec![] });
    h.registry.create_task_id();
    let task = sentence_task(&h.registry, "a1", 0, "Hello there.");
    h.input.send(task).await.expect("send");

    let out = recv_or_panic(&mut h.output).await;
    let clip = out.sentence_audio.expect("clip attached");
    assert_eq!(clip.sample_rate, 24_000);
    assert_eq!(clip.samples.len(), "Hello there.".chars().count());
    assert!(out.timings.tts_finished_at.is_some());
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn tts_drops_punctuation_only_sentence() {
    let mut h = start_tts(ScriptedTts { fail_on: vec![] });
    h.registry.create_task_id();
    let task = sentence_task(&h.registry, "a1", 0, "，。！？");
    h.input.send(task).await.expect("send");
    assert_no_output(&mut h.output).await;
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn tts_failure_drops_remainder_of_answer() {
    let mut h = start_tts(ScriptedTts {
        fail_on: vec!["second sentence".to_owned()],
    });
    h.registry.create_task_id();
    h.input
        .send(sentence_task(&h.registry, "a1", 0, "first sentence"))
        .await
        .expect("send");
    h.input
        .send(sentence_task(&h.registry, "a1", 1, "second sentence"))
        .await
        .expect("send");
    h.input
        .send(sentence_task(&h.registry, "a1", 2, "third sentence"))
        .await
        .expect("send");

    let out = recv_or_panic(&mut h.output).await;
    assert_eq!(out.answer_index, 0);
    // Sentence 2 failed; sentence 3 is dropped with the answer, and the
    // utterance slot is released.
    assert_no_output(&mut h.output).await;
    assert!(h.registry.is_answer_dropped("a1"));
    assert!(h.registry.current_task_id().is_empty());
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn tts_barge_in_drops_task_and_marks_answer() {
    let mut h = start_tts(ScriptedTts { fail_on: vec![] });
    h.registry.create_task_id();
    let task = sentence_task(&h.registry, "a1", 0, "about to be dropped");
    h.signals.user_still_speaking.set();
    h.input.send(task.clone()).await.expect("send");

    assert_no_output(&mut h.output).await;
    assert!(h.registry.is_answer_dropped("a1"));
    assert!(!h.signals.user_still_speaking.is_set());
    h.handle.cancel.cancel();
}

struct PlaybackHarness {
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    stopped: Arc<AtomicBool>,
    played: Arc<Mutex<Vec<usize>>>,
    input: mpsc::Sender<VoiceTask>,
    ui: mpsc::UnboundedReceiver<UiMessage>,
    handle: parlance::services::ServiceHandle,
}

fn start_playback() -> PlaybackHarness {
    let registry = Arc::new(StateRegistry::new());
    let signals = PipelineSignals::new();
    let stopped = Arc::new(AtomicBool::new(false));
    let player = RecordingPlayer::default();
    let played = Arc::clone(&player.played);
    let (input, rx) = mpsc::channel(8);
    let (ui_tx, ui) = mpsc::unbounded_channel();
    let registry_clone = Arc::clone(&registry);
    let signals_clone = Arc::clone(&signals);
    let control = PlaybackControl {
        stopped: Arc::clone(&stopped),
        aec_ref: None,
    };
    let rx = shared(rx);
    let handle = spawn_service(move |ready, cancel| {
        run_playback_stage(
            Box::new(player),
            registry_clone,
            signals_clone,
            control,
            rx,
            ui_tx,
            ready,
            cancel,
        )
    });
    PlaybackHarness {
        registry,
        signals,
        stopped,
        played,
        input,
        ui,
        handle,
    }
}

fn playable_task(h: &PlaybackHarness, answer_id: &str, index: u32, text: &str) -> VoiceTask {
    let mut task = sentence_task(&h.registry, answer_id, index, text);
    task.transcribed_text = "the question".to_owned();
    task.sentence_audio = Some(AudioClip {
        samples: vec![0.1; text.chars().count()],
        sample_rate: 24_000,
    });
    task
}

async fn wait_for_play_count(h: &PlaybackHarness, n: usize) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while h.played.lock().expect("played lock").len() < n {
        assert!(tokio::time::Instant::now() < deadline, "clip {n} not played");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn playback_waits_for_silence_gate() {
    let mut h = start_playback();
    h.registry.create_task_id();
    let task = playable_task(&h, "a1", 0, "hello");
    h.input.send(task.clone()).await.expect("send");

    // Gate closed: nothing plays.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.played.lock().expect("played lock").is_empty());

    h.signals.silence_over_threshold.set();
    wait_for_play_count(&h, 1).await;

    // The answer event went out and history was recorded as played.
    match h.ui.recv().await {
        Some(UiMessage::Answer { answer, answer_index, .. }) => {
            assert_eq!(answer, "hello");
            assert_eq!(answer_index, 0);
        }
        other => panic!("expected answer event, got {other:?}"),
    }
    let history = h.registry.windowed_history(&task.session_id, 3);
    assert_eq!(history, vec![("the question".to_owned(), "hello".to_owned())]);
    assert_eq!(h.registry.audio_task_state(&task.id), Some(AudioTaskState::Playing));
    assert!(h.registry.current_task_id().is_empty());
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn playback_drops_task_from_stale_session() {
    let mut h = start_playback();
    h.registry.create_task_id();
    h.signals.silence_over_threshold.set();
    let task = playable_task(&h, "a1", 0, "stale");

    // The session rotates between dispatch and playback.
    h.registry.reset_session_id();
    h.input.send(task).await.expect("send");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.played.lock().expect("played lock").is_empty());
    assert!(h.ui.try_recv().is_err(), "no UI event for a dropped task");
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn playback_stop_suppresses_audio_but_keeps_bookkeeping() {
    let mut h = start_playback();
    h.registry.create_task_id();
    h.signals.silence_over_threshold.set();
    h.stopped.store(true, Ordering::Relaxed);

    let task = playable_task(&h, "a1", 0, "quiet");
    h.input.send(task.clone()).await.expect("send");

    match tokio::time::timeout(RECV_TIMEOUT, h.ui.recv()).await {
        Ok(Some(UiMessage::Answer { .. })) => {}
        other => panic!("expected answer event, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.played.lock().expect("played lock").is_empty());
    assert_eq!(h.registry.windowed_history(&task.session_id, 3).len(), 1);
    h.handle.cancel.cancel();
}

#[tokio::test]
async fn playback_barge_in_drops_waiting_task() {
    let mut h = start_playback();
    h.registry.create_task_id();
    let task = playable_task(&h, "a1", 0, "never played");
    h.signals.user_still_speaking.set();
    h.input.send(task.clone()).await.expect("send");

    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !h.registry.is_answer_dropped("a1") {
        assert!(tokio::time::Instant::now() < deadline, "task not dropped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.played.lock().expect("played lock").is_empty());
    assert!(!h.signals.user_still_speaking.is_set());
    h.handle.cancel.cancel();
}
