use alert_engine::{EventSink, Scope, SinkClosed, StreamDispatcher, StreamEvent, TriggerEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use price_feed::{FeedConfig, FeedHub, PriceFeed};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::AppState;

/// Triggers kept per user for sessions that fall behind the broadcast.
pub const RECENT_TRIGGERS_PER_USER: usize = 64;

/// Latest trigger events per owner. A lagging session replays the ones it
/// never delivered, so only ticks are lost to lag.
#[derive(Clone, Default)]
pub struct RecentTriggers {
    by_user: Arc<DashMap<i64, VecDeque<TriggerEvent>>>,
}

impl RecentTriggers {
    pub fn record(&self, event: &TriggerEvent) {
        let mut recent = self.by_user.entry(event.user_id).or_default();
        if recent.len() == RECENT_TRIGGERS_PER_USER {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }

    /// Triggers for `user_id` at or after `since`, oldest first.
    pub fn since(&self, user_id: i64, since: DateTime<Utc>) -> Vec<TriggerEvent> {
        self.by_user
            .get(&user_id)
            .map(|recent| {
                recent
                    .iter()
                    .filter(|ev| ev.triggered_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Dispatcher output: remember triggers, then broadcast every event.
struct LiveSink {
    events: broadcast::Sender<StreamEvent>,
    recent: RecentTriggers,
}

#[async_trait]
impl EventSink for LiveSink {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        if let StreamEvent::AlertTriggered(ev) = &event {
            self.recent.record(ev);
        }
        EventSink::send(&mut self.events, event).await
    }
}

/// The shared live pipeline: one upstream feed, one dispatcher, and a
/// broadcast of its ordered output to every connected client session.
#[derive(Clone)]
pub struct LiveStream {
    pub hub: Arc<FeedHub>,
    pub events: broadcast::Sender<StreamEvent>,
    pub recent: RecentTriggers,
}

impl LiveStream {
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }
}

/// Connect the upstream feed and spawn the dispatcher task. Live ticks are
/// evaluated against every user's alerts; sessions filter what they forward.
pub fn start(state: &AppState, cancel: CancellationToken) -> LiveStream {
    let config = &state.config;
    let feed = PriceFeed::new(
        FeedConfig::new(config.finnhub_ws_url.clone(), config.finnhub_api_key.clone())
            .with_backoff(config.feed_reconnect),
    );

    let (handle, ticks) = feed.connect(config.stream_symbols.clone(), cancel);
    let hub = FeedHub::new(handle, config.stream_symbols.clone());
    let (events, _) = broadcast::channel(config.event_buffer);
    let recent = RecentTriggers::default();

    let dispatcher = StreamDispatcher::new(state.engine.clone(), Scope::AllUsers);
    let mut sink = LiveSink {
        events: events.clone(),
        recent: recent.clone(),
    };
    tokio::spawn(async move {
        let stats = dispatcher.run(ticks, &mut sink).await;
        tracing::info!(
            ticks = stats.ticks,
            triggers = stats.triggers,
            evaluation_errors = stats.evaluation_errors,
            "Live dispatcher stopped"
        );
    });

    tracing::info!(symbols = ?config.stream_symbols, "Live price stream started");
    LiveStream { hub, events, recent }
}
