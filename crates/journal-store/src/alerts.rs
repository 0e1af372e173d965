use crate::db::JournalDb;
use crate::models::*;
use anyhow::Result;
use chrono::{DateTime, Utc};
use market_core::Symbol;
use sqlx::SqliteConnection;

/// Alert persistence. Owner-facing calls are scoped by `user_id`; the
/// trigger path goes through [`AlertStore::mark_triggered`] only.
#[derive(Clone)]
pub struct AlertStore {
    db: JournalDb,
}

/// Convert rows, skipping (and logging) any that no longer parse.
fn typed(records: Vec<AlertRecord>) -> Vec<Alert> {
    records
        .into_iter()
        .filter_map(|rec| {
            let id = rec.id;
            match Alert::try_from(rec) {
                Ok(alert) => Some(alert),
                Err(e) => {
                    tracing::warn!(alert_id = id, "Skipping malformed alert row: {}", e);
                    None
                }
            }
        })
        .collect()
}

impl AlertStore {
    pub fn new(db: JournalDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &JournalDb {
        &self.db
    }

    pub async fn create(&self, user_id: i64, input: AlertInput) -> Result<Alert> {
        let (symbol, kind) = input.validate()?;
        let record = sqlx::query_as::<_, AlertRecord>(
            r#"
            INSERT INTO alerts
            (user_id, symbol, alert_type, threshold_value, condition, is_active, message, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(symbol.as_str())
        .bind(kind.as_str())
        .bind(input.threshold_value)
        .bind(&input.condition)
        .bind(&input.message)
        .bind(Utc::now())
        .fetch_one(self.db.pool())
        .await?;

        Ok(Alert::try_from(record)?)
    }

    pub async fn list(&self, user_id: i64, skip: i64, limit: i64) -> Result<Vec<Alert>> {
        let records = sqlx::query_as::<_, AlertRecord>(
            "SELECT * FROM alerts WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(self.db.pool())
        .await?;

        Ok(typed(records))
    }

    pub async fn active(&self, user_id: i64) -> Result<Vec<Alert>> {
        let records = sqlx::query_as::<_, AlertRecord>(
            "SELECT * FROM alerts WHERE user_id = ? AND is_active = 1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(typed(records))
    }

    pub async fn get(&self, user_id: i64, id: i64) -> Result<Option<Alert>> {
        let record = sqlx::query_as::<_, AlertRecord>(
            "SELECT * FROM alerts WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record.map(Alert::try_from).transpose()?)
    }

    /// Owner edit. Never touches `is_active` or `triggered_at`.
    pub async fn update(&self, user_id: i64, id: i64, input: AlertInput) -> Result<Option<Alert>> {
        let (symbol, kind) = input.validate()?;
        let record = sqlx::query_as::<_, AlertRecord>(
            r#"
            UPDATE alerts
            SET symbol = ?, alert_type = ?, threshold_value = ?, condition = ?, message = ?
            WHERE id = ? AND user_id = ?
            RETURNING *
            "#,
        )
        .bind(symbol.as_str())
        .bind(kind.as_str())
        .bind(input.threshold_value)
        .bind(&input.condition)
        .bind(&input.message)
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record.map(Alert::try_from).transpose()?)
    }

    pub async fn delete(&self, user_id: i64, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alerts WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Owner deactivation: `is_active = 0`, `triggered_at` untouched.
    /// Returns whether the alert exists for this user.
    pub async fn deactivate(&self, user_id: i64, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE alerts SET is_active = 0 WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Active alerts on `symbol`, optionally restricted to one owner.
    pub async fn active_for_symbol(&self, symbol: &Symbol, user_id: Option<i64>) -> Result<Vec<Alert>> {
        let records = match user_id {
            Some(uid) => {
                sqlx::query_as::<_, AlertRecord>(
                    "SELECT * FROM alerts WHERE user_id = ? AND symbol = ? AND is_active = 1 ORDER BY id",
                )
                .bind(uid)
                .bind(symbol.as_str())
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, AlertRecord>(
                    "SELECT * FROM alerts WHERE symbol = ? AND is_active = 1 ORDER BY id",
                )
                .bind(symbol.as_str())
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(typed(records))
    }

    /// Distinct symbols across a user's active alerts.
    pub async fn active_symbols(&self, user_id: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT symbol FROM alerts WHERE user_id = ? AND is_active = 1 ORDER BY symbol",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    /// Compare-and-set flip of one alert from active to triggered.
    ///
    /// Returns `true` only when this call performed the transition; an alert
    /// already inactive (triggered elsewhere, or deactivated) is left alone.
    pub async fn mark_triggered(
        conn: &mut SqliteConnection,
        id: i64,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET is_active = 0, triggered_at = ?, message = ? WHERE id = ? AND is_active = 1",
        )
        .bind(at)
        .bind(message)
        .bind(id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
