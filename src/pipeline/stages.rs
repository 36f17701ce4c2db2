//! The ASR, LLM, TTS and playback stage workers.
//!
//! Every worker has the same shape: block on its inbound queue, check the
//! interruption state at each hand-off, and swallow engine errors after
//! logging so the dialogue stays alive. Only startup problems escape, by
//! way of the service never signalling ready.

use crate::asr::{AsrEngine, ensure_minimum_duration};
use crate::audio::AudioPlayer;
use crate::audio::aec::ReferenceHandle;
use crate::config::{AsrConfig, LlmConfig};
use crate::llm::{LlmClient, SentenceSegmenter};
use crate::pipeline::messages::{UiMessage, VoiceTask};
use crate::pipeline::{SharedReceiver, recv_shared};
use crate::prompts::PromptStore;
use crate::state::StateRegistry;
use crate::state::events::{Event, PipelineSignals};
use crate::state::lru::LruCache;
use crate::tts::{TtsEngine, has_word_characters};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long playback waits between gate re-checks.
const PLAYBACK_GATE_POLL: Duration = Duration::from_millis(50);

/// Long-utterance fragment cache capacity (task ids).
const FRAGMENT_CACHE_CAPACITY: usize = 10;

/// Run the speech recognition worker.
///
/// Failure to set up the engine leaves the service not-ready, which the
/// service manager turns into a startup error; warmup failure is logged
/// and ignored.
pub async fn run_asr_stage(
    mut engine: Box<dyn AsrEngine>,
    config: AsrConfig,
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    rx: SharedReceiver<VoiceTask>,
    tx: mpsc::Sender<VoiceTask>,
    ready: Arc<Event>,
    cancel: CancellationToken,
) {
    if let Err(e) = engine.setup().await {
        error!("failed to set up ASR engine: {e}");
        return;
    }
    if let Err(e) = engine.warmup().await {
        warn!("ASR warmup failed (continuing): {e}");
    }
    ready.set();
    info!("ASR stage ready ({})", config.language);

    // Transcript fragments of long utterances, keyed by task id.
    let mut fragments: LruCache<String, Vec<String>> = LruCache::new(FRAGMENT_CACHE_CAPACITY);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            task = recv_shared(&rx) => {
                let Some(mut task) = task else { break };

                task.timings.asr_started_at = Some(Instant::now());
                let clip = ensure_minimum_duration(&task.user_voice, config.min_clip_secs, 16_000);

                let text = match engine.transcribe(&clip, task.language).await {
                    Ok(text) => text,
                    Err(e) => {
                        error!("ASR failed for task <{}>: {e}", task.id);
                        registry.reset_task_id();
                        continue;
                    }
                };
                if text.trim().is_empty() {
                    registry.reset_task_id();
                    continue;
                }
                task.timings.asr_finished_at = Some(Instant::now());

                // Long-utterance fragments accumulate under the task id;
                // this happens before the drop checks so preempted
                // fragments still contribute to the final transcript.
                let is_fragmented = task.over_long_threshold || fragments.contains(&task.id);
                if is_fragmented {
                    let mut list = fragments.remove(&task.id).unwrap_or_default();
                    list.push(text.trim().to_owned());
                    fragments.insert(task.id.clone(), list);
                }

                if registry.handle_user_speaking_interruption(&task, &signals) {
                    continue;
                }
                if registry.is_answer_dropped(&task.answer_id) {
                    continue;
                }

                task.transcribed_text = if is_fragmented {
                    fragments
                        .get(&task.id)
                        .map(|list| list.join(" "))
                        .unwrap_or_else(|| text.trim().to_owned())
                } else {
                    text.trim().to_owned()
                };
                task.user_voice.clear();

                info!("transcribed task <{}>: {}", task.id, task.transcribed_text);
                if tx.send(task).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("ASR stage stopped");
}

/// Run the answer generation worker: stream the model output and fan it
/// out to TTS sentence by sentence.
pub async fn run_llm_stage(
    client: LlmClient,
    config: LlmConfig,
    prompts: Arc<PromptStore>,
    registry: Arc<StateRegistry>,
    rx: SharedReceiver<VoiceTask>,
    tx: mpsc::Sender<VoiceTask>,
    ui_tx: mpsc::UnboundedSender<UiMessage>,
    ready: Arc<Event>,
    cancel: CancellationToken,
) {
    let warmup_prompt = prompts.prompt_for(crate::config::Language::Zh);
    if let Err(e) = client.warmup(&warmup_prompt).await {
        warn!("LLM warmup failed (continuing): {e}");
    }
    ready.set();
    info!("LLM stage ready");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            task = recv_shared(&rx) => {
                let Some(task) = task else { break };
                if process_llm_task(&client, &config, &prompts, &registry, &tx, &ui_tx, task)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    info!("LLM stage stopped");
}

/// Handle one transcribed utterance. Returns `Err` only when the outbound
/// queue is gone and the worker should exit.
async fn process_llm_task(
    client: &LlmClient,
    config: &LlmConfig,
    prompts: &PromptStore,
    registry: &StateRegistry,
    tx: &mpsc::Sender<VoiceTask>,
    ui_tx: &mpsc::UnboundedSender<UiMessage>,
    mut task: VoiceTask,
) -> std::result::Result<(), ()> {
    let question = task.transcribed_text.clone();
    info!("user question: {question}");
    let _ = ui_tx.send(UiMessage::Question {
        session_id: task.session_id.clone(),
        task_id: task.id.clone(),
        question: question.clone(),
    });

    let system_prompt = prompts.prompt_for(task.language);
    let history = registry.windowed_history(&task.session_id, config.history_turns);

    task.timings.llm_started_at = Some(Instant::now());
    let (mut chunks, handle) = client.stream(&system_prompt, &history, &question, &task.session_id);

    let mut segmenter = SentenceSegmenter::new();
    let mut answer_index: u32 = 0;
    let mut aborted = false;

    while let Some(chunk) = chunks.recv().await {
        // Fine-grained abort: validity is re-checked on every chunk, and
        // dropping the receiver stops the HTTP stream at the next chunk.
        if !registry.is_task_valid(&task) {
            aborted = true;
            break;
        }
        if chunk.is_empty() || matches!(chunk.as_str(), "<think>" | "</think>" | "\n\n") {
            continue;
        }
        if let Some(sentence) = segmenter.push_chunk(&chunk) {
            emit_sentence(tx, &mut task, &mut answer_index, sentence).await?;
        }
    }
    drop(chunks);

    if !aborted && let Some(sentence) = segmenter.finish() {
        emit_sentence(tx, &mut task, &mut answer_index, sentence).await?;
    }

    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("LLM stream failed for task <{}>: {e}", task.id);
            registry.reset_task_id();
        }
        Err(e) => {
            error!("LLM stream task panicked: {e}");
            registry.reset_task_id();
        }
    }
    Ok(())
}

/// Stamp and enqueue one sentence copy of the task.
async fn emit_sentence(
    tx: &mpsc::Sender<VoiceTask>,
    task: &mut VoiceTask,
    answer_index: &mut u32,
    sentence: String,
) -> std::result::Result<(), ()> {
    task.answer_index = *answer_index;
    task.answer_sentence = sentence;
    task.timings.llm_finished_at = Some(Instant::now());
    if tx.send(task.clone()).await.is_err() {
        return Err(());
    }
    task.timings.llm_started_at = Some(Instant::now());
    *answer_index += 1;
    Ok(())
}

/// Run the synthesis worker.
pub async fn run_tts_stage(
    mut engine: Box<dyn TtsEngine>,
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    rx: SharedReceiver<VoiceTask>,
    tx: mpsc::Sender<VoiceTask>,
    ready: Arc<Event>,
    cancel: CancellationToken,
) {
    if let Err(e) = engine.setup().await {
        error!("failed to set up TTS engine: {e}");
        return;
    }
    if let Err(e) = engine.warmup().await {
        warn!("TTS warmup failed (continuing): {e}");
    }
    ready.set();
    info!("TTS stage ready");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            task = recv_shared(&rx) => {
                let Some(mut task) = task else { break };
                if task.answer_sentence.is_empty() {
                    continue;
                }
                if registry.handle_user_speaking_interruption(&task, &signals) {
                    continue;
                }
                if !registry.is_task_valid(&task) {
                    info!("TTS: task <{}> invalid, dropping", task.id);
                    continue;
                }
                if !has_word_characters(&task.answer_sentence) {
                    info!("TTS: skipping punctuation-only text '{}'", task.answer_sentence);
                    continue;
                }

                task.timings.tts_started_at = Some(Instant::now());
                match engine.synthesize(&task.answer_sentence).await {
                    Ok(clip) => {
                        task.timings.tts_finished_at = Some(Instant::now());
                        task.sentence_audio = Some(clip);
                        if tx.send(task).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TTS failed for task <{}>: {e}", task.id);
                        // The rest of this answer is unplayable in order;
                        // drop it rather than skip a sentence mid-answer.
                        registry.mark_answer_dropped(&task.answer_id);
                        registry.reset_task_id();
                    }
                }
            }
        }
    }
    info!("TTS stage stopped");
}

/// Control handles for the playback worker.
pub struct PlaybackControl {
    /// Suppresses playback without discarding queued tasks.
    pub stopped: Arc<AtomicBool>,
    /// Reference feed for the echo canceller, when AEC is active.
    pub aec_ref: Option<ReferenceHandle>,
}

/// Run the playback worker: gate on the monitor's signals, emit the UI
/// event, record history, then play the clip to completion.
pub async fn run_playback_stage(
    mut player: Box<dyn AudioPlayer>,
    registry: Arc<StateRegistry>,
    signals: Arc<PipelineSignals>,
    control: PlaybackControl,
    rx: SharedReceiver<VoiceTask>,
    ui_tx: mpsc::UnboundedSender<UiMessage>,
    ready: Arc<Event>,
    cancel: CancellationToken,
) {
    ready.set();
    info!("playback stage ready");

    'next_task: loop {
        let task = tokio::select! {
            () = cancel.cancelled() => break,
            task = recv_shared(&rx) => {
                let Some(task) = task else { break };
                task
            }
        };

        // Gate: wait for the user to be properly silent, re-checking the
        // interruption state on every pass.
        loop {
            if cancel.is_cancelled() {
                break 'next_task;
            }
            if registry.handle_user_speaking_interruption(&task, &signals) {
                continue 'next_task;
            }
            if !registry.is_task_valid(&task) {
                info!("playback: task <{}> invalid, dropping", task.id);
                continue 'next_task;
            }
            if signals.silence_over_threshold.is_set() {
                break;
            }
            tokio::time::sleep(PLAYBACK_GATE_POLL).await;
        }

        let _ = ui_tx.send(UiMessage::Answer {
            session_id: task.session_id.clone(),
            task_id: task.id.clone(),
            answer_index: task.answer_index,
            answer: task.answer_sentence.clone(),
        });

        registry.append_history(
            &task.session_id,
            &task.answer_id,
            &task.transcribed_text,
            &task.answer_sentence,
        );
        registry.set_audio_playing(&task.id);
        registry.reset_task_id();

        if control.stopped.load(Ordering::Relaxed) {
            continue;
        }
        if let Some(ref clip) = task.sentence_audio {
            if let Some(ref aec) = control.aec_ref {
                aec.push(&clip.samples, clip.sample_rate);
            }
            // Blocks until the clip ends; preemption only ever takes
            // effect at the next clip boundary.
            if let Err(e) = player.play(clip) {
                error!("playback failed for task <{}>: {e}", task.id);
            }
        }
    }
    info!("playback stage stopped");
}
