use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

use crate::error::{CopilotError, CopilotResult};
use crate::sentiment::{label_for, lexicon_score};

pub const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1/models";
pub const FALLBACK_MODEL: &str = "gemini-1.5-flash-latest";

const APOLOGY: &str = "I'm having trouble connecting right now. Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_GEMINI_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Answer to a copilot question. Always produced, even when the LLM is
/// unreachable; `error` then says why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotReply {
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub market_bias: String,
    pub sentiment_score: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CopilotReply {
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        tracing::error!("Copilot error: {}", error);
        Self {
            answer: APOLOGY.to_string(),
            model: None,
            market_bias: "neutral".to_string(),
            sentiment_score: 0.0,
            timestamp: Utc::now(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

/// Gemini-compatible REST client.
///
/// The model list is fetched lazily on first use, flash models first. A
/// model that answers successfully becomes the first one tried next time.
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
    models: OnceCell<Vec<String>>,
    preferred: RwLock<Option<String>>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        if config.api_key.is_none() {
            tracing::warn!("GEMINI_API_KEY missing; copilot and LLM sentiment are disabled");
        }

        Self {
            client,
            config,
            models: OnceCell::new(),
            preferred: RwLock::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn key(&self) -> CopilotResult<&str> {
        self.config.api_key.as_deref().ok_or(CopilotError::NotConfigured)
    }

    /// Models that support `generateContent`, flash variants first.
    pub async fn list_models(&self) -> CopilotResult<Vec<String>> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[("key", self.key()?)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CopilotError::Upstream {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let list: ModelList = response.json().await?;
        let (flash, other): (Vec<String>, Vec<String>) = list
            .models
            .into_iter()
            .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
            .map(|m| m.name.trim_start_matches("models/").to_string())
            .partition(|name| name.to_lowercase().contains("flash"));

        Ok(flash.into_iter().chain(other).collect())
    }

    async fn models(&self) -> &[String] {
        self.models
            .get_or_init(|| async {
                match self.list_models().await {
                    Ok(models) if !models.is_empty() => {
                        tracing::info!(count = models.len(), current = %models[0], "Available models fetched");
                        models
                    }
                    Ok(_) => {
                        tracing::warn!("Model list was empty, using {}", FALLBACK_MODEL);
                        vec![FALLBACK_MODEL.to_string()]
                    }
                    Err(e) => {
                        tracing::warn!("Failed to fetch models: {}, using {}", e, FALLBACK_MODEL);
                        vec![FALLBACK_MODEL.to_string()]
                    }
                }
            })
            .await
    }

    /// One `generateContent` call; returns the first candidate's text.
    pub async fn generate(&self, model: &str, prompt: &str, generation_config: Value) -> CopilotResult<String> {
        let url = format!("{}/{}:generateContent", self.config.base_url, model);
        let payload = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.key()?)])
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CopilotError::Upstream {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let data: Value = response.json().await?;
        data.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| CopilotError::InvalidResponse("No candidates in response".into()))
    }

    /// Try the preferred model, then every listed model in order.
    pub async fn generate_with_fallback(&self, prompt: &str, generation_config: Value) -> CopilotResult<(String, String)> {
        self.key()?;
        let listed = self.models().await;
        if listed.is_empty() {
            return Err(CopilotError::NoModels);
        }

        let preferred = self.preferred.read().await.clone();
        let order: Vec<&str> = preferred
            .as_deref()
            .into_iter()
            .chain(listed.iter().map(String::as_str).filter(|m| Some(*m) != preferred.as_deref()))
            .collect();

        let mut last_error = CopilotError::NoModels;
        for model in order {
            match self.generate(model, prompt, generation_config.clone()).await {
                Ok(text) => {
                    if preferred.as_deref() != Some(model) {
                        *self.preferred.write().await = Some(model.to_string());
                    }
                    return Ok((model.to_string(), text));
                }
                Err(e) => {
                    tracing::warn!(model, "Model failed, trying next: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Ask the copilot. Never fails; problems come back in `error`.
    pub async fn chat(&self, question: &str, symbols: &[String]) -> CopilotReply {
        if !self.is_configured() {
            return CopilotReply::failure("Gemini API key is not configured.");
        }

        let prompt = if symbols.is_empty() {
            question.to_string()
        } else {
            format!("Symbols in focus: {}\n\n{}", symbols.join(", "), question)
        };
        let generation_config = json!({
            "temperature": 0.7,
            "topK": 40,
            "topP": 0.95,
            "maxOutputTokens": 2048,
        });

        match self.generate_with_fallback(&prompt, generation_config).await {
            Ok((model, answer)) => {
                let score = lexicon_score(&answer);
                tracing::info!(model = %model, chars = answer.len(), "Copilot response generated");
                CopilotReply {
                    answer,
                    model: Some(model),
                    market_bias: label_for(score).to_string(),
                    sentiment_score: score,
                    timestamp: Utc::now(),
                    error: None,
                }
            }
            Err(e) => CopilotReply::failure(format!("All models failed. Last error: {}", e)),
        }
    }
}
