//! Language model integration: streaming chat client and the sentence
//! segmenter that turns its token stream into playable units.

pub mod client;
pub mod segmenter;

pub use client::LlmClient;
pub use segmenter::SentenceSegmenter;
