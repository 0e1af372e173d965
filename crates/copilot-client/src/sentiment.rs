use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use market_core::NewsArticle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{CopilotError, CopilotResult};
use crate::gemini::GeminiClient;

pub const MAX_ARTICLES: usize = 10;
pub const LLM_CONFIDENCE: f64 = 0.8;
pub const LEXICON_CONFIDENCE: f64 = 0.5;

const BULLISH_WORDS: &[&str] = &[
    "beat", "beats", "bullish", "buy", "gain", "gains", "growth", "high", "jump", "jumps",
    "outperform", "profit", "rally", "record", "rise", "rises", "soar", "soars", "strong",
    "surge", "surges", "upgrade", "upgraded",
];

const BEARISH_WORDS: &[&str] = &[
    "bearish", "crash", "cut", "decline", "declines", "downgrade", "downgraded", "drop",
    "drops", "fall", "falls", "fear", "loss", "losses", "miss", "misses", "plunge",
    "plunges", "sell", "slump", "weak", "warning",
];

/// `bullish` above 0.1, `bearish` below -0.1, otherwise `neutral`.
pub fn label_for(score: f64) -> &'static str {
    if score > 0.1 {
        "bullish"
    } else if score < -0.1 {
        "bearish"
    } else {
        "neutral"
    }
}

/// Word-count polarity in [-1, 1]; 0 when no polar word occurs.
pub fn lexicon_score(text: &str) -> f64 {
    let (mut pos, mut neg) = (0usize, 0usize);
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
    {
        if BULLISH_WORDS.contains(&word.as_str()) {
            pos += 1;
        } else if BEARISH_WORDS.contains(&word.as_str()) {
            neg += 1;
        }
    }

    let total = pos + neg;
    if total == 0 {
        0.0
    } else {
        (pos as f64 - neg as f64) / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReport {
    pub score: f64,
    pub sentiment: String,
    pub confidence: f64,
    pub article_count: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SentimentReport {
    pub fn neutral(error: Option<String>) -> Self {
        Self {
            score: 0.0,
            sentiment: "neutral".to_string(),
            confidence: 0.0,
            article_count: 0,
            timestamp: Utc::now(),
            error,
        }
    }

    fn from_scores(scores: &[f64], confidence: f64) -> Self {
        let score = scores.iter().sum::<f64>() / scores.len() as f64;
        Self {
            score,
            sentiment: label_for(score).to_string(),
            confidence,
            article_count: scores.len(),
            timestamp: Utc::now(),
            error: None,
        }
    }
}

fn headline_text(article: &NewsArticle) -> String {
    match &article.summary {
        Some(summary) if !summary.trim().is_empty() => format!("{}. {}", article.title, summary),
        _ => article.title.clone(),
    }
}

/// Scores news headlines. Uses the LLM when one is configured and falls
/// back to a word list otherwise.
#[derive(Clone)]
pub struct SentimentAnalyzer {
    llm: Arc<GeminiClient>,
}

impl SentimentAnalyzer {
    pub fn new(llm: Arc<GeminiClient>) -> Self {
        Self { llm }
    }

    async fn score_article(&self, text: &str) -> CopilotResult<f64> {
        let prompt = format!(
            "Rate the market sentiment of this financial news on a scale from -1 (very bearish) \
             to 1 (very bullish). Reply with JSON of the form {{\"score\": <number>}}.\n\n{}",
            text
        );
        let config = json!({
            "temperature": 0.1,
            "response_mime_type": "application/json",
        });

        let (_, reply) = self.llm.generate_with_fallback(&prompt, config).await?;
        let value: Value = serde_json::from_str(reply.trim())?;
        value
            .get("score")
            .and_then(Value::as_f64)
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(-1.0, 1.0))
            .ok_or_else(|| CopilotError::InvalidResponse(format!("no score in {}", reply)))
    }

    /// Average sentiment over at most `MAX_ARTICLES` articles. Never fails:
    /// with nothing scorable the report is neutral and carries `error`.
    pub async fn analyze(&self, articles: &[NewsArticle]) -> SentimentReport {
        let texts: Vec<String> = articles
            .iter()
            .take(MAX_ARTICLES)
            .map(headline_text)
            .filter(|t| !t.trim().is_empty())
            .collect();

        if texts.is_empty() {
            return SentimentReport::neutral(Some("No news articles available".to_string()));
        }

        if !self.llm.is_configured() {
            let scores: Vec<f64> = texts.iter().map(|t| lexicon_score(t)).collect();
            return SentimentReport::from_scores(&scores, LEXICON_CONFIDENCE);
        }

        let results = join_all(texts.iter().map(|t| self.score_article(t))).await;
        let mut last_error = None;
        let scores: Vec<f64> = results
            .into_iter()
            .filter_map(|r| match r {
                Ok(score) => Some(score),
                Err(e) => {
                    tracing::warn!("Article sentiment failed: {}", e);
                    last_error = Some(e.to_string());
                    None
                }
            })
            .collect();

        if scores.is_empty() {
            tracing::error!("Sentiment analysis failed for every article");
            return SentimentReport::neutral(last_error);
        }

        tracing::debug!(articles = scores.len(), "Sentiment scored");
        SentimentReport::from_scores(&scores, LLM_CONFIDENCE)
    }
}
