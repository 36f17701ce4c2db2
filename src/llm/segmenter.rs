//! Streaming sentence segmentation for LLM output.
//!
//! Turns a stream of content chunks into playable sentence units. Two rules
//! dominate perceived latency and are the contract of this module:
//!
//! * **Right-most-punctuation split** — each incoming chunk is split at its
//!   right-most punctuation character, so a long unsegmented tail stays
//!   buffered for the next iteration while the head can still complete a
//!   sentence now.
//! * **First-sentence bias** — the first sentence of an answer is emitted
//!   as soon as it is minimally speakable (more than 2 Chinese characters
//!   or more than one English word, ending in a sentence mark), trading
//!   prosody for sub-second time-to-first-audio.

/// Chinese sentence-end marks.
const CHINESE_END_MARKS: [char; 7] = ['，', '。', '！', '？', '：', '；', '、'];
/// English sentence-end marks.
const ENGLISH_END_MARKS: [char; 6] = ['!', '?', '.', ',', ':', ';'];

/// Incremental sentence assembler for one answer.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    parts: Vec<String>,
    emitted: usize,
}

impl SentenceSegmenter {
    /// Create a segmenter for a fresh answer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sentences emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Feed one content chunk; returns a sentence when one completes.
    pub fn push_chunk(&mut self, chunk: &str) -> Option<String> {
        let (before, mark, after) = split_rightmost_punctuation(chunk);
        if !before.is_empty() {
            self.parts.push(before.to_owned());
        }
        if let Some(m) = mark {
            self.parts.push(m.to_string());
        }

        let candidate = assemble(&self.parts);
        if candidate.is_empty() {
            if !after.is_empty() {
                self.parts.push(after.to_owned());
            }
            return None;
        }

        let emit = match mark {
            Some(m) => should_emit(&candidate, m, self.emitted == 0),
            None => false,
        };

        if emit {
            self.parts.clear();
            if !after.is_empty() {
                self.parts.push(after.to_owned());
            }
            self.emitted += 1;
            Some(candidate.trim().to_owned())
        } else {
            if !after.is_empty() {
                self.parts.push(after.to_owned());
            }
            None
        }
    }

    /// Flush whatever remains at end of stream.
    ///
    /// Returns `None` when the remainder is empty or solely punctuation.
    pub fn finish(&mut self) -> Option<String> {
        let candidate = assemble(&self.parts);
        self.parts.clear();
        let trimmed = candidate.trim();
        if trimmed.is_empty() || trimmed.chars().all(is_punctuation) {
            return None;
        }
        self.emitted += 1;
        Some(trimmed.to_owned())
    }
}

/// Split `chunk` at its right-most punctuation character into
/// (before, punctuation, after).
///
/// With no punctuation present the whole chunk is returned as `before`.
fn split_rightmost_punctuation(chunk: &str) -> (&str, Option<char>, &str) {
    for (idx, c) in chunk.char_indices().rev() {
        if is_punctuation(c) {
            let before = &chunk[..idx];
            let after = &chunk[idx + c.len_utf8()..];
            return (before, Some(c), after);
        }
    }
    (chunk, None, "")
}

/// Join the buffered parts into a candidate sentence.
///
/// When the candidate ends in a sentence mark, intra-sentence `!`, `?` and
/// `.` are normalized to `,` so TTS reads the body as one prosodic unit,
/// keeping only the terminal mark.
fn assemble(parts: &[String]) -> String {
    let joined = parts.concat();
    let Some(last) = joined.chars().last() else {
        return joined;
    };
    if !is_end_mark(last) {
        return joined;
    }
    let body: String = joined[..joined.len() - last.len_utf8()]
        .chars()
        .map(|c| match c {
            '!' | '?' | '.' => ',',
            other => other,
        })
        .collect();
    let mut out = body;
    out.push(last);
    out
}

/// Emission policy. `first` selects the latency-biased first-sentence rule.
fn should_emit(sentence: &str, mark: char, first: bool) -> bool {
    if sentence.is_empty() || !is_end_mark(mark) {
        return false;
    }
    let chinese = CHINESE_END_MARKS.contains(&mark);

    if first {
        return if chinese {
            sentence.chars().count() > 2
        } else {
            sentence.split_whitespace().count() > 1
        };
    }

    if chinese {
        sentence.chars().count() > 4
    } else {
        let words = sentence.split_whitespace().count();
        words > 4 || (words > 2 && matches!(mark, '.' | '?' | '!'))
    }
}

/// Whether `c` counts as a sentence-end mark in either script.
fn is_end_mark(c: char) -> bool {
    CHINESE_END_MARKS.contains(&c) || ENGLISH_END_MARKS.contains(&c)
}

/// Punctuation test covering the scripts this pipeline speaks: ASCII
/// punctuation, CJK punctuation, fullwidth forms, and common general
/// punctuation (dashes, ellipsis, curly quotes).
pub(crate) fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(c,
            '\u{3001}'..='\u{303F}'
            | '\u{FF01}'..='\u{FF0F}'
            | '\u{FF1A}'..='\u{FF1F}'
            | '\u{FF3B}'..='\u{FF40}'
            | '\u{FF5B}'..='\u{FF65}'
            | '\u{2013}'..='\u{2014}'
            | '\u{2018}'..='\u{201F}'
            | '\u{2026}'
            | '\u{00B7}')
}
