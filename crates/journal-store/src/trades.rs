use crate::db::JournalDb;
use crate::models::*;
use anyhow::Result;
use chrono::Utc;
use sqlx::SqliteConnection;

/// Per-user trade journal.
#[derive(Clone)]
pub struct TradeStore {
    db: JournalDb,
}

impl TradeStore {
    pub fn new(db: JournalDb) -> Self {
        Self { db }
    }

    pub(crate) async fn insert(
        conn: &mut SqliteConnection,
        user_id: i64,
        trade: &TradeInput,
    ) -> Result<Trade> {
        let symbol = trade.validate()?;
        let row = sqlx::query_as::<_, Trade>(
            r#"
            INSERT INTO trades (user_id, symbol, trade_type, quantity, price, timestamp, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(symbol.as_str())
        .bind(trade.trade_type)
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.timestamp.unwrap_or_else(Utc::now))
        .bind(&trade.notes)
        .fetch_one(conn)
        .await?;

        Ok(row)
    }

    pub async fn create(&self, user_id: i64, trade: TradeInput) -> Result<Trade> {
        let mut conn = self.db.pool().acquire().await?;
        Self::insert(&mut conn, user_id, &trade).await
    }

    /// Newest first.
    pub async fn list(&self, user_id: i64, skip: i64, limit: i64) -> Result<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(skip)
        .fetch_all(self.db.pool())
        .await?;

        Ok(trades)
    }

    /// Oldest first, for position and P&L replay.
    pub async fn all_chronological(&self, user_id: i64) -> Result<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT * FROM trades WHERE user_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(trades)
    }

    pub async fn get(&self, user_id: i64, id: i64) -> Result<Option<Trade>> {
        let trade = sqlx::query_as::<_, Trade>("SELECT * FROM trades WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(trade)
    }

    /// Replace a trade's fields. `None` when the trade does not belong to the user.
    pub async fn update(&self, user_id: i64, id: i64, trade: TradeInput) -> Result<Option<Trade>> {
        let symbol = trade.validate()?;
        let row = sqlx::query_as::<_, Trade>(
            r#"
            UPDATE trades
            SET symbol = ?, trade_type = ?, quantity = ?, price = ?,
                timestamp = COALESCE(?, timestamp), notes = ?
            WHERE id = ? AND user_id = ?
            RETURNING *
            "#,
        )
        .bind(symbol.as_str())
        .bind(trade.trade_type)
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.timestamp)
        .bind(&trade.notes)
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    pub async fn delete(&self, user_id: i64, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM trades WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserStore;

    async fn setup() -> (TradeStore, i64, i64) {
        let db = JournalDb::new("sqlite::memory:").await.unwrap();
        let users = UserStore::new(db.clone());
        let mut ids = Vec::new();
        for name in ["erin", "frank"] {
            let u = users
                .register(NewUser {
                    username: name.into(),
                    email: format!("{}@example.com", name),
                    password: "password123".into(),
                })
                .await
                .unwrap();
            ids.push(u.id);
        }
        (TradeStore::new(db), ids[0], ids[1])
    }

    fn input(symbol: &str, trade_type: TradeType, qty: f64, price: f64) -> TradeInput {
        TradeInput {
            symbol: symbol.into(),
            trade_type,
            quantity: qty,
            price,
            timestamp: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_crud_is_user_scoped() {
        let (store, erin, frank) = setup().await;
        let trade = store
            .create(erin, input("aapl", TradeType::Buy, 10.0, 150.0))
            .await
            .unwrap();
        assert_eq!(trade.symbol, "AAPL");
        assert_eq!(trade.trade_type, TradeType::Buy);

        assert!(store.get(frank, trade.id).await.unwrap().is_none());
        assert!(store
            .update(frank, trade.id, input("AAPL", TradeType::Sell, 1.0, 1.0))
            .await
            .unwrap()
            .is_none());
        assert!(!store.delete(frank, trade.id).await.unwrap());

        let updated = store
            .update(erin, trade.id, input("AAPL", TradeType::Buy, 12.0, 149.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.quantity, 12.0);
        assert_eq!(updated.timestamp, trade.timestamp);

        assert_eq!(store.list(erin, 0, 100).await.unwrap().len(), 1);
        assert!(store.delete(erin, trade.id).await.unwrap());
        assert!(store.list(erin, 0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_trade_rejected() {
        let (store, erin, _) = setup().await;
        let err = store
            .create(erin, input("AAPL", TradeType::Buy, -1.0, 10.0))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<InputError>().is_some());
    }
}
