pub mod models;
pub mod db;
pub mod users;
pub mod trades;
pub mod alerts;
pub mod csv_import;
pub mod analytics;

pub use db::JournalDb;
pub use models::*;
pub use users::{IssuedSession, UserStore};
pub use trades::TradeStore;
pub use alerts::AlertStore;
pub use csv_import::{import_trades_csv, parse_trades_csv, CsvImportError};
pub use analytics::{risk_metrics, summarize, OpenPosition, RiskMetrics, TradeSummary};
