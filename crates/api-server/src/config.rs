use anyhow::{Context, Result};
use market_core::{parse_symbol_list, Symbol};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub session_ttl: chrono::Duration,
    pub finnhub_api_key: Option<String>,
    pub finnhub_ws_url: String,
    pub finnhub_rest_url: String,
    pub stream_symbols: BTreeSet<Symbol>,
    pub feed_reconnect: Duration,
    pub event_buffer: usize,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub llm_timeout: Duration,
    pub market_data_timeout: Duration,
    pub auth_max_failures: u32,
    pub auth_failure_window: Duration,
    pub auth_lockout: Duration,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, e)),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |name: &str, default: &str| non_empty(&lookup, name).unwrap_or_else(|| default.to_string());

        let allowed_origins = text("ALLOWED_ORIGINS", "http://localhost:5173,http://127.0.0.1:5173")
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let stream_symbols = parse_symbol_list(&text("STREAM_SYMBOLS", "AAPL,MSFT,TSLA"))
            .context("invalid STREAM_SYMBOLS")?;

        let bind_addr = text("BIND_ADDR", "0.0.0.0:8000");
        let bind_addr = bind_addr
            .parse()
            .with_context(|| format!("invalid BIND_ADDR={:?}", bind_addr))?;

        let event_buffer: usize = parse_or(&lookup, "EVENT_BUFFER", 1024)?;
        if event_buffer == 0 {
            anyhow::bail!("EVENT_BUFFER must be greater than zero");
        }

        Ok(Self {
            database_url: text("DATABASE_URL", "sqlite:trading_copilot.db"),
            bind_addr,
            allowed_origins,
            session_ttl: chrono::Duration::minutes(parse_or(&lookup, "SESSION_TTL_MINUTES", 30i64)?),
            finnhub_api_key: non_empty(&lookup, "FINNHUB_API_KEY"),
            finnhub_ws_url: text("FINNHUB_WS_URL", price_feed::websocket::DEFAULT_FEED_URL),
            finnhub_rest_url: text("FINNHUB_REST_URL", price_feed::rest::DEFAULT_REST_URL),
            stream_symbols,
            feed_reconnect: Duration::from_secs(parse_or(&lookup, "FEED_RECONNECT_SECS", 3u64)?),
            event_buffer,
            gemini_api_key: non_empty(&lookup, "GEMINI_API_KEY"),
            gemini_base_url: text("GEMINI_BASE_URL", copilot_client::DEFAULT_GEMINI_URL),
            llm_timeout: Duration::from_secs(parse_or(&lookup, "LLM_TIMEOUT_SECS", 30u64)?),
            market_data_timeout: Duration::from_secs(parse_or(&lookup, "MARKET_DATA_TIMEOUT_SECS", 10u64)?),
            auth_max_failures: parse_or(&lookup, "AUTH_MAX_FAILURES", 5u32)?,
            auth_failure_window: Duration::from_secs(parse_or(&lookup, "AUTH_FAILURE_WINDOW_SECS", 300u64)?),
            auth_lockout: Duration::from_secs(parse_or(&lookup, "AUTH_LOCKOUT_SECS", 900u64)?),
        })
    }
}
