use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use market_core::{Symbol, Tick};
use serde::Deserialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;

pub const DEFAULT_FEED_URL: &str = "wss://ws.finnhub.io";
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lazy, infinite sequence of ticks. Ends only when the feed's
/// cancellation token fires.
pub type TickStream = BoxStream<'static, Tick>;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub reconnect_backoff: Duration,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Upstream URL with the token query appended. A bare authority gets a
    /// `/` path so the handshake request line stays in origin form.
    fn endpoint(&self) -> String {
        let Some(key) = &self.api_key else {
            return self.url.clone();
        };

        let mut url = self.url.clone();
        let authority = url.find("://").map(|i| i + 3).unwrap_or(0);
        match url[authority..].find(['/', '?', '#']) {
            Some(i) if url.as_bytes()[authority + i] == b'/' => {}
            Some(i) => url.insert(authority + i, '/'),
            None => url.push('/'),
        }

        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", url, sep, key)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_URL, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(Symbol),
    Unsubscribe(Symbol),
}

/// Authoritative symbol set, read on every (re)connect.
#[derive(Debug, Clone, Default)]
struct SharedSymbols(Arc<Mutex<BTreeSet<Symbol>>>);

impl SharedSymbols {
    fn snapshot(&self) -> BTreeSet<Symbol> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn insert(&self, symbol: Symbol) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol)
    }

    fn remove(&self, symbol: &Symbol) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(symbol)
    }
}

/// Runtime control over a connected feed. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    symbols: SharedSymbols,
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedHandle {
    pub(crate) fn channel(
        initial: BTreeSet<Symbol>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            symbols: SharedSymbols(Arc::new(Mutex::new(initial))),
            commands,
        };
        (handle, rx)
    }

    /// Add a symbol to the upstream subscription. No-op if already subscribed.
    pub fn subscribe(&self, symbol: Symbol) {
        if self.symbols.insert(symbol.clone()) {
            let _ = self.commands.send(FeedCommand::Subscribe(symbol));
        }
    }

    pub fn unsubscribe(&self, symbol: &Symbol) {
        if self.symbols.remove(symbol) {
            let _ = self.commands.send(FeedCommand::Unsubscribe(symbol.clone()));
        }
    }

    pub fn symbols(&self) -> BTreeSet<Symbol> {
        self.symbols.snapshot()
    }
}

pub struct PriceFeed {
    config: FeedConfig,
}

impl PriceFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }

    /// Open the tick stream for `symbols`.
    ///
    /// Nothing touches the network until the stream is first polled. On any
    /// transport failure the stream waits `reconnect_backoff`, reconnects and
    /// resubscribes the handle's current symbol set; it never ends on its own.
    pub fn connect(
        &self,
        symbols: BTreeSet<Symbol>,
        cancel: CancellationToken,
    ) -> (FeedHandle, TickStream) {
        let (handle, commands) = FeedHandle::channel(symbols);
        let session = FeedSession {
            config: self.config.clone(),
            symbols: handle.symbols.clone(),
            commands,
            cancel,
            state: FeedState::Idle,
            pending: VecDeque::new(),
            connects: 0,
        };

        let stream = futures_util::stream::unfold(session, |mut session| async move {
            session.next_tick().await.map(|tick| (tick, session))
        })
        .boxed();

        (handle, stream)
    }
}

enum FeedState {
    Idle,
    Live(WsStream),
    Backoff,
}

struct FeedSession {
    config: FeedConfig,
    symbols: SharedSymbols,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    cancel: CancellationToken,
    state: FeedState,
    pending: VecDeque<Tick>,
    connects: u64,
}

impl FeedSession {
    async fn next_tick(&mut self) -> Option<Tick> {
        loop {
            if let Some(tick) = self.pending.pop_front() {
                return Some(tick);
            }
            if self.cancel.is_cancelled() {
                if let FeedState::Live(mut ws) = std::mem::replace(&mut self.state, FeedState::Idle) {
                    let _ = ws.send(Message::Close(None)).await;
                }
                tracing::info!("Price feed cancelled");
                return None;
            }

            self.state = match std::mem::replace(&mut self.state, FeedState::Idle) {
                FeedState::Idle => self.open().await,
                FeedState::Live(ws) => self.pump(ws).await,
                FeedState::Backoff => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => FeedState::Idle,
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => FeedState::Idle,
                    }
                }
            };
        }
    }

    async fn open(&mut self) -> FeedState {
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => return FeedState::Idle,
            result = self.handshake() => result,
        };

        match result {
            Ok(ws) => FeedState::Live(ws),
            Err(e) => {
                tracing::warn!(
                    "Price feed connect to {} failed: {}, retrying in {:?}",
                    self.config.url,
                    e,
                    self.config.reconnect_backoff
                );
                FeedState::Backoff
            }
        }
    }

    async fn handshake(&mut self) -> Result<WsStream, FeedError> {
        let (mut ws, _) = connect_async(self.config.endpoint()).await?;

        // Queued commands are already reflected in the symbol set.
        while self.commands.try_recv().is_ok() {}

        let symbols = self.symbols.snapshot();
        for symbol in &symbols {
            ws.send(Message::Text(subscribe_message(symbol))).await?;
        }

        self.connects += 1;
        tracing::info!(
            connects = self.connects,
            "Connected to price feed, subscribed to {} symbols",
            symbols.len()
        );
        Ok(ws)
    }

    async fn pump(&mut self, mut ws: WsStream) -> FeedState {
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;

            _ = cancel.cancelled() => FeedState::Live(ws),

            Some(cmd) = self.commands.recv() => {
                let text = match &cmd {
                    FeedCommand::Subscribe(s) => subscribe_message(s),
                    FeedCommand::Unsubscribe(s) => unsubscribe_message(s),
                };
                match ws.send(Message::Text(text)).await {
                    Ok(()) => {
                        tracing::debug!("Price feed command sent: {:?}", cmd);
                        FeedState::Live(ws)
                    }
                    Err(e) => {
                        tracing::warn!("Price feed send failed: {}, reconnecting", e);
                        FeedState::Backoff
                    }
                }
            }

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match decode_message(&text) {
                        Ok(ticks) => self.pending.extend(ticks),
                        Err(e) => tracing::debug!("Dropping undecodable feed message: {}", e),
                    }
                    FeedState::Live(ws)
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                    FeedState::Live(ws)
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!(
                        "Price feed connection closed, reconnecting in {:?}",
                        self.config.reconnect_backoff
                    );
                    FeedState::Backoff
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        "Price feed error: {}, reconnecting in {:?}",
                        e,
                        self.config.reconnect_backoff
                    );
                    FeedState::Backoff
                }
                Some(Ok(_)) => FeedState::Live(ws),
            },
        }
    }
}

fn subscribe_message(symbol: &Symbol) -> String {
    serde_json::json!({"type": "subscribe", "symbol": symbol.as_str()}).to_string()
}

fn unsubscribe_message(symbol: &Symbol) -> String {
    serde_json::json!({"type": "unsubscribe", "symbol": symbol.as_str()}).to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum UpstreamMessage {
    Trade { data: Vec<RawTrade> },
    Error { msg: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    s: String,
    p: f64,
    #[serde(default)]
    v: Option<f64>,
    #[serde(default)]
    t: Option<i64>,
}

/// Decode one upstream text frame into zero or more ticks, in wire order.
///
/// Pings and unknown message types decode to no ticks. Individual trades
/// with an unusable symbol or a non-finite price are dropped.
pub fn decode_message(text: &str) -> Result<Vec<Tick>, FeedError> {
    match serde_json::from_str::<UpstreamMessage>(text)? {
        UpstreamMessage::Trade { data } => Ok(data
            .into_iter()
            .filter_map(|raw| {
                if !raw.p.is_finite() {
                    return None;
                }
                let symbol = Symbol::parse(&raw.s).ok()?;
                Some(Tick {
                    symbol,
                    price: raw.p,
                    volume: raw.v,
                    timestamp_ms: raw.t,
                    sentiment_score: None,
                })
            })
            .collect()),
        UpstreamMessage::Error { msg } => Err(FeedError::Upstream(msg)),
        UpstreamMessage::Other => Ok(Vec::new()),
    }
}
