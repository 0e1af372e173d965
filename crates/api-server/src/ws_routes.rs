use alert_engine::StreamEvent;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use market_core::{parse_symbol_list, Symbol};
use price_feed::SymbolLease;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::live::{LiveStream, RecentTriggers};
use crate::{AppError, AppState};

#[derive(Deserialize, Default)]
pub struct PriceStreamQuery {
    #[serde(default)]
    pub symbols: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws/prices", get(ws_prices_handler))
}

async fn ws_prices_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<PriceStreamQuery>,
) -> Result<Response, AppError> {
    let symbols = match query.symbols.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_symbol_list(raw).map_err(AppError::bad_request)?,
        None => state.config.stream_symbols.clone(),
    };
    if symbols.is_empty() {
        return Err(AppError::bad_request("No symbols requested"));
    }

    let user_id = match query.token.as_deref().filter(|t| !t.is_empty()) {
        None => None,
        Some(token) => match state.users.user_for_token(token).await {
            Ok(Some(user)) => Some(user.id),
            Ok(None) => {
                tracing::warn!("Price stream opened with an invalid token; sending ticks only");
                None
            }
            Err(e) => {
                tracing::warn!("Price stream token lookup failed: {:#}; sending ticks only", e);
                None
            }
        },
    };

    Ok(ws
        .on_upgrade(move |socket| handle_price_socket(socket, state, symbols, user_id))
        .into_response())
}

/// One connected client: the symbols it leased, whose triggers it may see,
/// and its own view of the shared event broadcast.
struct ClientSession {
    lease: SymbolLease,
    user_id: Option<i64>,
    events: broadcast::Receiver<StreamEvent>,
    recent: RecentTriggers,
    connected_at: DateTime<Utc>,
    delivered: HashSet<i64>,
}

impl ClientSession {
    fn new(live: &LiveStream, symbols: BTreeSet<Symbol>, user_id: Option<i64>) -> Self {
        Self {
            events: live.subscribe(),
            lease: live.hub.acquire(symbols),
            user_id,
            recent: live.recent.clone(),
            connected_at: Utc::now(),
            delivered: HashSet::new(),
        }
    }

    /// Frame for one broadcast event, if this client should see it. Each
    /// alert is delivered at most once.
    fn accept(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::Tick(tick) => self.lease.contains(&tick.symbol).then(|| event.to_frame()),
            StreamEvent::AlertTriggered(ev) => {
                if self.user_id != Some(ev.user_id) || !self.delivered.insert(ev.alert_id) {
                    return None;
                }
                Some(event.to_frame())
            }
        }
    }

    /// Owner triggers recorded since connect that this client never got.
    fn replay_missed(&mut self) -> Vec<String> {
        let Some(user_id) = self.user_id else {
            return Vec::new();
        };
        self.recent
            .since(user_id, self.connected_at)
            .into_iter()
            .filter(|ev| self.delivered.insert(ev.alert_id))
            .map(|ev| StreamEvent::AlertTriggered(ev).to_frame())
            .collect()
    }

    /// Frames to write for one receive. `None` once the broadcast closed.
    fn frames_for(&mut self, received: Result<StreamEvent, RecvError>) -> Option<Vec<String>> {
        match received {
            Ok(event) => Some(self.accept(&event).into_iter().collect()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, user_id = ?self.user_id, "Price stream client lagging, ticks dropped");
                Some(self.replay_missed())
            }
            Err(RecvError::Closed) => None,
        }
    }

    async fn run(mut self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        'session: loop {
            tokio::select! {
                received = self.events.recv() => {
                    let Some(frames) = self.frames_for(received) else {
                        break;
                    };
                    for frame in frames {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break 'session;
                        }
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        let _ = sender.close().await;
        tracing::debug!(symbols = ?self.lease.symbols(), "Price stream client disconnected");
    }
}

async fn handle_price_socket(
    mut socket: WebSocket,
    state: AppState,
    symbols: BTreeSet<Symbol>,
    user_id: Option<i64>,
) {
    let live = match &state.live {
        Some(live) => live.clone(),
        None => {
            let _ = socket
                .send(Message::Text(
                    serde_json::json!({"error": "price stream not configured"}).to_string(),
                ))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let session = ClientSession::new(&live, symbols, user_id);
    tracing::debug!(symbols = ?session.lease.symbols(), user_id = ?user_id, "Price stream client connected");
    session.run(socket).await;
}
