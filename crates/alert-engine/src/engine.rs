use chrono::{DateTime, Utc};
use journal_store::{AlertKind, AlertStore};
use market_core::{Symbol, Tick};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::rules::{AlertRule, Firing};

/// Whose alerts a tick is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    AllUsers,
    User(i64),
}

impl Scope {
    fn user_id(&self) -> Option<i64> {
        match self {
            Self::AllUsers => None,
            Self::User(id) => Some(*id),
        }
    }
}

/// One alert that this evaluation flipped from active to triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub alert_id: i64,
    pub user_id: i64,
    pub symbol: Symbol,
    pub alert_type: AlertKind,
    pub message: String,
    pub trigger_value: f64,
    pub trigger_price: f64,
    pub triggered_at: DateTime<Utc>,
}

pub struct AlertEngine {
    store: AlertStore,
}

impl AlertEngine {
    pub fn new(store: AlertStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AlertStore {
        &self.store
    }

    /// Evaluate every active alert on `tick.symbol` within `scope`.
    ///
    /// Fired alerts are flipped inside one transaction with a conditional
    /// update; only alerts this call actually flipped are returned, so an
    /// alert yields at most one event no matter how many evaluations race.
    /// Nothing is written when no rule fires.
    pub async fn evaluate(&self, tick: &Tick, scope: Scope) -> Result<Vec<TriggerEvent>, EngineError> {
        let candidates = self
            .store
            .active_for_symbol(&tick.symbol, scope.user_id())
            .await?;

        let fired: Vec<(i64, i64, AlertKind, Firing)> = candidates
            .iter()
            .filter_map(|alert| {
                let rule = match AlertRule::from_alert(alert) {
                    Ok(rule) => rule,
                    Err(e) => {
                        tracing::warn!(alert_id = alert.id, "Skipping alert: {}", e);
                        return None;
                    }
                };
                rule.evaluate(tick)
                    .map(|firing| (alert.id, alert.user_id, rule.kind(), firing))
            })
            .collect();

        if fired.is_empty() {
            return Ok(Vec::new());
        }

        let triggered_at = Utc::now();
        let mut tx = self.store.db().begin().await?;
        let mut events = Vec::with_capacity(fired.len());

        for (alert_id, user_id, alert_type, firing) in fired {
            if AlertStore::mark_triggered(&mut tx, alert_id, &firing.message, triggered_at).await? {
                events.push(TriggerEvent {
                    alert_id,
                    user_id,
                    symbol: tick.symbol.clone(),
                    alert_type,
                    message: firing.message,
                    trigger_value: firing.trigger_value,
                    trigger_price: tick.price,
                    triggered_at,
                });
            } else {
                tracing::debug!(alert_id, "Alert already inactive, another evaluation won");
            }
        }

        tx.commit().await?;

        if !events.is_empty() {
            tracing::info!(
                symbol = %tick.symbol,
                "Triggered {} alert(s) at price {}",
                events.len(),
                tick.price
            );
        }
        Ok(events)
    }
}
