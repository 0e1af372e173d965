use crate::db::JournalDb;
use crate::models::{Trade, TradeInput, TradeType};
use crate::trades::TradeStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

const REQUIRED_COLUMNS: [&str; 4] = ["symbol", "trade_type", "quantity", "price"];

#[derive(Error, Debug)]
pub enum CsvImportError {
    #[error("CSV is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("Row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },

    #[error("CSV parse error: {0}")]
    Malformed(#[from] csv::Error),

    #[error("CSV file contains no trades")]
    Empty,

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl CsvImportError {
    /// Whether the caller sent bad data (as opposed to a storage failure).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Database(_))
    }
}

struct Columns {
    symbol: usize,
    trade_type: usize,
    quantity: usize,
    price: usize,
    notes: Option<usize>,
    timestamp: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, CsvImportError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let require = |name: &'static str| find(name).ok_or(CsvImportError::MissingColumn(name));

        Ok(Self {
            symbol: require(REQUIRED_COLUMNS[0])?,
            trade_type: require(REQUIRED_COLUMNS[1])?,
            quantity: require(REQUIRED_COLUMNS[2])?,
            price: require(REQUIRED_COLUMNS[3])?,
            notes: find("notes"),
            timestamp: find("timestamp"),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Parse and validate every row. Row numbers are 1-based data rows
/// (the header is not counted).
pub fn parse_trades_csv(data: &[u8]) -> Result<Vec<TradeInput>, CsvImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let cols = Columns::locate(reader.headers()?)?;
    let mut trades = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        let row = idx + 1;
        let record = result?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let invalid = |reason: String| CsvImportError::InvalidRow { row, reason };

        let trade_type: TradeType = field(cols.trade_type)
            .parse()
            .map_err(|e: crate::models::InputError| invalid(e.0))?;
        let quantity: f64 = field(cols.quantity)
            .parse()
            .map_err(|_| invalid(format!("quantity '{}' is not a number", field(cols.quantity))))?;
        let price: f64 = field(cols.price)
            .parse()
            .map_err(|_| invalid(format!("price '{}' is not a number", field(cols.price))))?;
        let timestamp = match cols.timestamp.map(field).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                parse_timestamp(raw).ok_or_else(|| invalid(format!("unrecognized timestamp '{}'", raw)))?,
            ),
            None => None,
        };

        let trade = TradeInput {
            symbol: field(cols.symbol).to_string(),
            trade_type,
            quantity,
            price,
            timestamp,
            notes: cols
                .notes
                .map(field)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
        trade.validate().map_err(|e| invalid(e.0))?;
        trades.push(trade);
    }

    if trades.is_empty() {
        return Err(CsvImportError::Empty);
    }
    Ok(trades)
}

/// Validate the whole file, then insert every row in one transaction.
/// Either all rows land or none do.
pub async fn import_trades_csv(
    db: &JournalDb,
    user_id: i64,
    data: &[u8],
) -> Result<Vec<Trade>, CsvImportError> {
    let inputs = parse_trades_csv(data)?;

    let mut tx = db.begin().await?;
    let mut inserted = Vec::with_capacity(inputs.len());
    for input in &inputs {
        inserted.push(TradeStore::insert(&mut tx, user_id, input).await?);
    }
    tx.commit().await.map_err(anyhow::Error::from)?;

    tracing::info!(user_id, "Imported {} trades from CSV", inserted.len());
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUser;
    use crate::users::UserStore;

    #[test]
    fn test_parse_csv() {
        let csv = "symbol,trade_type,quantity,price,notes,timestamp\n\
                   aapl,buy,10,150.00,First,2025-01-02\n\
                   MSFT,SELL,5,300.00,,2025-01-15T14:30:00Z\n";

        let rows = parse_trades_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].trade_type, TradeType::Buy);
        assert_eq!(rows[0].notes.as_deref(), Some("First"));
        assert_eq!(rows[1].trade_type, TradeType::Sell);
        assert!(rows[1].notes.is_none());
        assert!(rows[1].timestamp.is_some());
    }

    #[test]
    fn test_missing_column() {
        let csv = "symbol,trade_type,price\nAAPL,buy,1\n";
        assert!(matches!(
            parse_trades_csv(csv.as_bytes()),
            Err(CsvImportError::MissingColumn("quantity"))
        ));
    }

    #[test]
    fn test_first_invalid_row_is_reported() {
        let csv = "symbol,trade_type,quantity,price\n\
                   AAPL,buy,10,150\n\
                   AAPL,hold,10,150\n\
                   AAPL,buy,0,150\n";
        match parse_trades_csv(csv.as_bytes()) {
            Err(CsvImportError::InvalidRow { row, .. }) => assert_eq!(row, 2),
            other => panic!("expected invalid row, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_empty_csv() {
        let csv = "symbol,trade_type,quantity,price\n";
        assert!(matches!(parse_trades_csv(csv.as_bytes()), Err(CsvImportError::Empty)));
    }

    #[tokio::test]
    async fn test_import_is_all_or_nothing() {
        let db = JournalDb::new("sqlite::memory:").await.unwrap();
        let user = UserStore::new(db.clone())
            .register(NewUser {
                username: "gina".into(),
                email: "gina@example.com".into(),
                password: "password123".into(),
            })
            .await
            .unwrap();
        let store = TradeStore::new(db.clone());

        let bad = "symbol,trade_type,quantity,price\nAAPL,buy,10,150\nAAPL,buy,abc,150\n";
        assert!(import_trades_csv(&db, user.id, bad.as_bytes()).await.is_err());
        assert!(store.list(user.id, 0, 100).await.unwrap().is_empty());

        let good = "symbol,trade_type,quantity,price\nAAPL,buy,10,150\nAAPL,sell,5,160\n";
        let imported = import_trades_csv(&db, user.id, good.as_bytes()).await.unwrap();
        assert_eq!(imported.len(), 2);
        assert_eq!(store.list(user.id, 0, 100).await.unwrap().len(), 2);
    }
}
