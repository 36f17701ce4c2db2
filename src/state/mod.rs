//! Process-wide dialogue state: session/task identity, interruption
//! bookkeeping, and per-session history.

pub mod events;
pub mod lru;
pub mod session;

use crate::pipeline::messages::VoiceTask;
use events::PipelineSignals;
use lru::LruCache;
use session::SessionHistory;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

/// Playback state of a dispatched audio task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTaskState {
    /// The task's audio reached the playback stage.
    Playing,
    /// The task was preempted; the monitor clears this on its next pass.
    Drop,
}

/// Capacity of the audio-task state map.
const AUDIO_TASK_STATES_CAPACITY: usize = 10;
/// Capacity of the dropped-answer set.
const DROPPED_ANSWERS_CAPACITY: usize = 50;

/// Cross-cutting pipeline state, shared by every stage.
///
/// The registry is a small set of mutex-guarded cells; no lock is held
/// across an await point or an inference call. The monitor is the sole
/// writer of `interrupt_task_id`; ASR and TTS write the dropped-answer
/// set; playback writes history.
#[derive(Debug)]
pub struct StateRegistry {
    session_id: Mutex<String>,
    task_id: Mutex<String>,
    interrupt_task_id: Mutex<String>,
    audio_task_states: Mutex<LruCache<String, AudioTaskState>>,
    dropped_answers: Mutex<LruCache<String, ()>>,
    history: Mutex<HashMap<String, SessionHistory>>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StateRegistry {
    /// Create a registry with a fresh session identity.
    pub fn new() -> Self {
        Self {
            session_id: Mutex::new(uuid::Uuid::new_v4().to_string()),
            task_id: Mutex::new(String::new()),
            interrupt_task_id: Mutex::new(String::new()),
            audio_task_states: Mutex::new(LruCache::new(AUDIO_TASK_STATES_CAPACITY)),
            dropped_answers: Mutex::new(LruCache::new(DROPPED_ANSWERS_CAPACITY)),
            history: Mutex::new(HashMap::new()),
        }
    }

    // --- session identity ---

    /// The current session id.
    pub fn current_session_id(&self) -> String {
        match self.session_id.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => String::new(),
        }
    }

    /// Replace the session id.
    pub fn set_session_id(&self, id: &str) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = id.to_owned();
        }
    }

    /// Generate and install a fresh session id, returning it.
    ///
    /// In-flight tasks carrying the previous id become invalid at their
    /// next stage checkpoint.
    pub fn reset_session_id(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.set_session_id(&id);
        id
    }

    // --- utterance task identity ---

    /// The current task id, empty when no utterance is in progress.
    pub fn current_task_id(&self) -> String {
        match self.task_id.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => String::new(),
        }
    }

    /// Create a new task id for the next utterance, returning it.
    pub fn create_task_id(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(mut guard) = self.task_id.lock() {
            *guard = id.clone();
        }
        id
    }

    /// Clear the current task id (utterance finished or failed).
    pub fn reset_task_id(&self) {
        if let Ok(mut guard) = self.task_id.lock() {
            guard.clear();
        }
    }

    // --- interruption ---

    /// The id of the task being preempted, empty when none.
    pub fn interrupt_task_id(&self) -> String {
        match self.interrupt_task_id.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => String::new(),
        }
    }

    /// Mark `task_id` as preempted. Only the monitor calls this.
    pub fn set_interrupt_task_id(&self, task_id: &str) {
        if let Ok(mut guard) = self.interrupt_task_id.lock() {
            *guard = task_id.to_owned();
        }
    }

    /// Clear the interrupt marker.
    pub fn reset_interrupt_task_id(&self) {
        if let Ok(mut guard) = self.interrupt_task_id.lock() {
            guard.clear();
        }
    }

    // --- audio task states ---

    /// Current playback state for `task_id`, if tracked.
    pub fn audio_task_state(&self, task_id: &str) -> Option<AudioTaskState> {
        match self.audio_task_states.lock() {
            Ok(mut guard) => guard.get(&task_id.to_owned()).copied(),
            Err(_) => None,
        }
    }

    /// Record that `task_id` started playing.
    pub fn set_audio_playing(&self, task_id: &str) {
        if let Ok(mut guard) = self.audio_task_states.lock() {
            guard.insert(task_id.to_owned(), AudioTaskState::Playing);
        }
    }

    /// Record that `task_id` was dropped mid-flight.
    pub fn drop_audio_task(&self, task_id: &str) {
        if let Ok(mut guard) = self.audio_task_states.lock() {
            guard.insert(task_id.to_owned(), AudioTaskState::Drop);
        }
    }

    /// Remove the tracked state for `task_id`.
    pub fn cleanup_task_state(&self, task_id: &str) {
        if let Ok(mut guard) = self.audio_task_states.lock() {
            guard.remove(&task_id.to_owned());
        }
    }

    // --- dropped answers ---

    /// Add `answer_id` to the dropped set; later sentences of that answer
    /// are discarded at every stage.
    pub fn mark_answer_dropped(&self, answer_id: &str) {
        if let Ok(mut guard) = self.dropped_answers.lock() {
            guard.insert(answer_id.to_owned(), ());
        }
    }

    /// Whether `answer_id` has been dropped.
    pub fn is_answer_dropped(&self, answer_id: &str) -> bool {
        match self.dropped_answers.lock() {
            Ok(mut guard) => guard.contains(&answer_id.to_owned()),
            Err(_) => false,
        }
    }

    // --- validity checks (the per-stage checkpoint) ---

    /// Whether `task` is the one being preempted by a newer utterance.
    pub fn is_task_interrupted(&self, task: &VoiceTask) -> bool {
        let interrupt_id = self.interrupt_task_id();
        if interrupt_id.is_empty() {
            return false;
        }
        if task.id != interrupt_id {
            info!("task <{}> preempted by task <{}>", task.id, interrupt_id);
            return true;
        }
        false
    }

    /// Whether `task` may proceed: not preempted, same session, answer
    /// not dropped. Invalid tasks are dropped silently by the caller.
    pub fn is_task_valid(&self, task: &VoiceTask) -> bool {
        if self.is_task_interrupted(task) {
            return false;
        }
        let session_id = self.current_session_id();
        if task.session_id != session_id {
            info!(
                "task <{}> session mismatch: {} != {}",
                task.id, task.session_id, session_id
            );
            return false;
        }
        if self.is_answer_dropped(&task.answer_id) {
            info!("task <{}> answer {} already dropped", task.id, task.answer_id);
            return false;
        }
        true
    }

    /// Barge-in checkpoint: when *user-still-speaking* is set, drop the
    /// task, mark its answer dropped, clear the event, and report `true`.
    pub fn handle_user_speaking_interruption(
        &self,
        task: &VoiceTask,
        signals: &PipelineSignals,
    ) -> bool {
        if signals.user_still_speaking.is_set() {
            info!("user still speaking, dropping task <{}>", task.id);
            self.drop_audio_task(&task.id);
            self.mark_answer_dropped(&task.answer_id);
            signals.user_still_speaking.clear();
            return true;
        }
        false
    }

    // --- history ---

    /// Append a played sentence to the session history under `answer_id`.
    pub fn append_history(&self, session_id: &str, answer_id: &str, question: &str, sentence: &str) {
        if let Ok(mut guard) = self.history.lock() {
            guard
                .entry(session_id.to_owned())
                .or_default()
                .append_sentence(answer_id, question, sentence);
        }
    }

    /// The last `k` turns of `session_id` as (question, answer) pairs.
    pub fn windowed_history(&self, session_id: &str, k: usize) -> Vec<(String, String)> {
        match self.history.lock() {
            Ok(guard) => guard
                .get(session_id)
                .map(|h| h.windowed(k))
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Language;

    fn task(registry: &StateRegistry) -> VoiceTask {
        VoiceTask::new(
            registry.create_task_id(),
            registry.current_session_id(),
            Language::En,
        )
    }

    #[test]
    fn fresh_task_is_valid() {
        let registry = StateRegistry::new();
        let t = task(&registry);
        assert!(registry.is_task_valid(&t));
    }

    #[test]
    fn session_reset_invalidates_in_flight_tasks() {
        let registry = StateRegistry::new();
        let t = task(&registry);
        registry.reset_session_id();
        assert!(!registry.is_task_valid(&t));
    }

    #[test]
    fn dropped_answer_invalidates_task() {
        let registry = StateRegistry::new();
        let mut t = task(&registry);
        t.answer_id = "answer-1".to_owned();
        registry.mark_answer_dropped("answer-1");
        assert!(!registry.is_task_valid(&t));
    }

    #[test]
    fn interrupt_marks_other_tasks_not_self() {
        let registry = StateRegistry::new();
        let t = task(&registry);
        // The interrupted task id belongs to the *newest* utterance; a task
        // whose id matches it is the one allowed to continue.
        registry.set_interrupt_task_id(&t.id);
        assert!(!registry.is_task_interrupted(&t));

        let mut stale = t.clone();
        stale.id = "older-task".to_owned();
        assert!(registry.is_task_interrupted(&stale));
    }

    #[test]
    fn user_speaking_interruption_drops_and_clears() {
        let registry = StateRegistry::new();
        let signals = PipelineSignals::new();
        let mut t = task(&registry);
        t.answer_id = "answer-2".to_owned();

        signals.user_still_speaking.set();
        assert!(registry.handle_user_speaking_interruption(&t, &signals));
        assert!(!signals.user_still_speaking.is_set());
        assert!(registry.is_answer_dropped("answer-2"));
        assert_eq!(registry.audio_task_state(&t.id), Some(AudioTaskState::Drop));

        // Event consumed: a second call is a no-op.
        assert!(!registry.handle_user_speaking_interruption(&t, &signals));
    }

    #[test]
    fn task_id_lifecycle() {
        let registry = StateRegistry::new();
        assert!(registry.current_task_id().is_empty());
        let id = registry.create_task_id();
        assert_eq!(registry.current_task_id(), id);
        registry.reset_task_id();
        assert!(registry.current_task_id().is_empty());
    }
}
