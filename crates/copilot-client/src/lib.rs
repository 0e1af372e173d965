pub mod error;
pub mod gemini;
pub mod sentiment;

pub use error::{CopilotError, CopilotResult};
pub use gemini::{CopilotReply, GeminiClient, GeminiConfig, DEFAULT_GEMINI_URL, FALLBACK_MODEL};
pub use sentiment::{label_for, lexicon_score, SentimentAnalyzer, SentimentReport, MAX_ARTICLES};
