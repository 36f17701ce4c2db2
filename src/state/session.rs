//! Per-session dialogue history.

/// One completed or in-progress dialogue turn.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Answer identity this turn belongs to.
    pub answer_id: String,
    /// The user's transcribed question.
    pub question: String,
    /// Assistant sentences, appended as they are played.
    pub sentences: Vec<String>,
}

/// Ordered dialogue history for one session.
///
/// Turns are keyed by `answer_id` and kept in arrival order; the playback
/// stage appends each sentence as it starts playing, so the history only
/// ever contains what the user actually heard.
#[derive(Debug, Default)]
pub struct SessionHistory {
    turns: Vec<Turn>,
}

impl SessionHistory {
    /// Append one played sentence under `answer_id`, recording the user
    /// question on the turn's first sentence.
    pub fn append_sentence(&mut self, answer_id: &str, question: &str, sentence: &str) {
        match self.turns.iter_mut().find(|t| t.answer_id == answer_id) {
            Some(turn) => turn.sentences.push(sentence.to_owned()),
            None => self.turns.push(Turn {
                answer_id: answer_id.to_owned(),
                question: question.to_owned(),
                sentences: vec![sentence.to_owned()],
            }),
        }
    }

    /// The last `k` turns as (question, joined answer) pairs, oldest first.
    ///
    /// This is the window fed back to the LLM; sentences of a turn are
    /// joined with spaces the way they were spoken.
    pub fn windowed(&self, k: usize) -> Vec<(String, String)> {
        let start = self.turns.len().saturating_sub(k);
        self.turns[start..]
            .iter()
            .map(|t| (t.question.clone(), t.sentences.join(" ")))
            .collect()
    }

    /// Number of turns recorded.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_accumulate_under_one_answer() {
        let mut history = SessionHistory::default();
        history.append_sentence("a1", "hello", "Hi,");
        history.append_sentence("a1", "hello", "how are you?");
        assert_eq!(history.len(), 1);
        let window = history.windowed(3);
        assert_eq!(window, vec![("hello".to_owned(), "Hi, how are you?".to_owned())]);
    }

    #[test]
    fn window_keeps_last_k_turns() {
        let mut history = SessionHistory::default();
        for i in 0..5 {
            history.append_sentence(&format!("a{i}"), &format!("q{i}"), "ok");
        }
        let window = history.windowed(3);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].0, "q2");
        assert_eq!(window[2].0, "q4");
    }

    #[test]
    fn question_recorded_once_per_turn() {
        let mut history = SessionHistory::default();
        history.append_sentence("a1", "first", "one");
        history.append_sentence("a1", "ignored", "two");
        assert_eq!(history.windowed(1)[0].0, "first");
    }
}
