use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use market_core::Tick;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::engine::{AlertEngine, Scope, TriggerEvent};

/// Ordered output of the dispatcher: a tick, then any triggers it caused.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(Tick),
    AlertTriggered(TriggerEvent),
}

impl StreamEvent {
    /// JSON frame sent to WebSocket clients.
    pub fn to_frame(&self) -> String {
        match self {
            Self::Tick(tick) => serde_json::to_string(tick).unwrap_or_default(),
            Self::AlertTriggered(ev) => json!({
                "type": "alert_triggered",
                "id": ev.alert_id,
                "symbol": ev.symbol,
                "alert_type": ev.alert_type,
                "message": ev.message,
                "trigger_price": ev.trigger_price,
                "triggered_at": ev.triggered_at,
            })
            .to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for dispatcher output.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<StreamEvent> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, event).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<StreamEvent> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        mpsc::UnboundedSender::send(self, event).map_err(|_| SinkClosed)
    }
}

/// Fan-out to every connected client. Having no subscribers at the moment
/// is not a failure; the event is simply dropped.
#[async_trait]
impl EventSink for broadcast::Sender<StreamEvent> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), SinkClosed> {
        let _ = broadcast::Sender::send(self, event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub ticks: u64,
    pub triggers: u64,
    pub evaluation_errors: u64,
}

/// Drives ticks through the alert engine and into a sink, strictly in order.
pub struct StreamDispatcher {
    engine: Arc<AlertEngine>,
    scope: Scope,
}

impl StreamDispatcher {
    pub fn new(engine: Arc<AlertEngine>, scope: Scope) -> Self {
        Self { engine, scope }
    }

    /// For each tick: forward it, evaluate it, forward its triggers, and
    /// only then take the next tick. Evaluation errors are logged and
    /// produce no triggers. Returns when the tick stream ends or the sink
    /// closes.
    pub async fn run<S, K>(&self, ticks: S, sink: &mut K) -> DispatchStats
    where
        S: Stream<Item = Tick> + Send,
        K: EventSink + ?Sized,
    {
        let mut stats = DispatchStats::default();
        let mut ticks = std::pin::pin!(ticks);

        while let Some(tick) = ticks.next().await {
            stats.ticks += 1;

            if sink.send(StreamEvent::Tick(tick.clone())).await.is_err() {
                tracing::debug!("Dispatcher sink closed");
                return stats;
            }

            let events = match self.engine.evaluate(&tick, self.scope).await {
                Ok(events) => events,
                Err(e) => {
                    stats.evaluation_errors += 1;
                    tracing::error!(symbol = %tick.symbol, "Alert evaluation failed: {}", e);
                    continue;
                }
            };

            for event in events {
                stats.triggers += 1;
                if sink.send(StreamEvent::AlertTriggered(event)).await.is_err() {
                    tracing::debug!("Dispatcher sink closed");
                    return stats;
                }
            }
        }

        tracing::info!(
            ticks = stats.ticks,
            triggers = stats.triggers,
            "Tick stream ended"
        );
        stats
    }
}
