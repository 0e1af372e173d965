use chrono::{DateTime, Utc};
use market_core::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted `alerts.condition` qualifier.
pub const MAX_CONDITION_LEN: usize = 20;

/// Caller-supplied data failed validation. Surfaces as a 400.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InputError(pub String);

impl InputError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), InputError> {
        let username = self.username.trim();
        if username.len() < 3 || username.len() > 50 {
            return Err(InputError::new("Username must be 3-50 characters"));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(InputError::new(
                "Username may only contain letters, digits, '_', '-' and '.'",
            ));
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => return Err(InputError::new("Invalid email address")),
        }
        if self.password.len() < 8 {
            return Err(InputError::new("Password must be at least 8 characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
}

impl FromStr for TradeType {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(InputError(format!(
                "Invalid trade_type '{}', expected 'buy' or 'sell'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub trade_type: TradeType,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInput {
    pub symbol: String,
    pub trade_type: TradeType,
    pub quantity: f64,
    pub price: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl TradeInput {
    /// Check ranges and return the normalized symbol.
    pub fn validate(&self) -> Result<Symbol, InputError> {
        let symbol =
            Symbol::parse(&self.symbol).map_err(|e| InputError(e.to_string()))?;
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(InputError::new("quantity must be greater than 0"));
        }
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(InputError::new("price must be greater than 0"));
        }
        Ok(symbol)
    }
}

/// The closed set of alert rules the engine knows how to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PriceAbove,
    PriceBelow,
    VolumeSpike,
    SentimentChange,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceAbove => "price_above",
            Self::PriceBelow => "price_below",
            Self::VolumeSpike => "volume_spike",
            Self::SentimentChange => "sentiment_change",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_above" => Ok(Self::PriceAbove),
            "price_below" => Ok(Self::PriceBelow),
            "volume_spike" => Ok(Self::VolumeSpike),
            "sentiment_change" => Ok(Self::SentimentChange),
            other => Err(InputError(format!("Unknown alert_type '{}'", other))),
        }
    }
}

/// Alert row as stored; `alert_type` is not yet known to be valid.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRecord {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub alert_type: String,
    pub threshold_value: Option<f64>,
    pub condition: Option<String>,
    pub is_active: bool,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub user_id: i64,
    pub symbol: Symbol,
    pub alert_type: AlertKind,
    pub threshold_value: Option<f64>,
    pub condition: Option<String>,
    pub is_active: bool,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRecord> for Alert {
    type Error = InputError;

    fn try_from(rec: AlertRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: Symbol::parse(&rec.symbol).map_err(|e| InputError(e.to_string()))?,
            alert_type: rec.alert_type.parse()?,
            id: rec.id,
            user_id: rec.user_id,
            threshold_value: rec.threshold_value,
            condition: rec.condition,
            is_active: rec.is_active,
            message: rec.message,
            created_at: rec.created_at,
            triggered_at: rec.triggered_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInput {
    pub symbol: String,
    pub alert_type: String,
    #[serde(default)]
    pub threshold_value: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AlertInput {
    pub fn validate(&self) -> Result<(Symbol, AlertKind), InputError> {
        let symbol =
            Symbol::parse(&self.symbol).map_err(|e| InputError(e.to_string()))?;
        let kind: AlertKind = self.alert_type.parse()?;
        if let Some(t) = self.threshold_value {
            if !t.is_finite() {
                return Err(InputError::new("threshold_value must be a finite number"));
            }
        }
        if let Some(c) = &self.condition {
            if c.chars().count() > MAX_CONDITION_LEN {
                return Err(InputError(format!(
                    "condition must be at most {} characters",
                    MAX_CONDITION_LEN
                )));
            }
        }
        Ok((symbol, kind))
    }
}
