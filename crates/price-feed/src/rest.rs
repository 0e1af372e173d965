use chrono::{DateTime, Duration as ChronoDuration, Utc};
use market_core::{Bar, NewsArticle, Quote, Symbol};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::FeedError;

pub const DEFAULT_REST_URL: &str = "https://finnhub.io/api/v1";

/// Request/response market data: quotes, daily candles and news headlines.
#[derive(Clone)]
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    c: f64,
    #[serde(default)]
    h: Option<f64>,
    #[serde(default)]
    l: Option<f64>,
    #[serde(default)]
    o: Option<f64>,
    #[serde(default)]
    pc: Option<f64>,
    #[serde(default)]
    t: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    s: String,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    v: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct NewsItem {
    headline: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    datetime: Option<i64>,
}

impl MarketDataClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .query(&[("token", &self.api_key)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::Upstream(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        Ok(response.json::<T>().await?)
    }

    /// Latest quote. The provider answers unknown symbols with an all-zero body.
    pub async fn quote(&self, symbol: &Symbol) -> Result<Quote, FeedError> {
        let raw: QuoteResponse = self
            .get("/quote", &[("symbol", symbol.to_string())])
            .await?;

        if raw.c == 0.0 && raw.t.unwrap_or(0) == 0 {
            return Err(FeedError::NoData(symbol.to_string()));
        }

        Ok(Quote {
            symbol: symbol.clone(),
            current: raw.c,
            open: raw.o,
            high: raw.h,
            low: raw.l,
            previous_close: raw.pc,
            timestamp: raw.t.and_then(|t| DateTime::from_timestamp(t, 0)),
        })
    }

    /// Daily OHLCV bars for the last `days` calendar days, oldest first.
    pub async fn daily_candles(&self, symbol: &Symbol, days: i64) -> Result<Vec<Bar>, FeedError> {
        let to = Utc::now();
        let from = to - ChronoDuration::days(days);
        let raw: CandleResponse = self
            .get(
                "/stock/candle",
                &[
                    ("symbol", symbol.to_string()),
                    ("resolution", "D".to_string()),
                    ("from", from.timestamp().to_string()),
                    ("to", to.timestamp().to_string()),
                ],
            )
            .await?;

        if raw.s != "ok" {
            return Err(FeedError::NoData(symbol.to_string()));
        }

        let n = raw.c.len();
        if [raw.h.len(), raw.l.len(), raw.o.len(), raw.t.len(), raw.v.len()]
            .iter()
            .any(|&len| len != n)
        {
            return Err(FeedError::Upstream(format!(
                "Ragged candle arrays for {}",
                symbol
            )));
        }

        Ok((0..n)
            .map(|i| Bar {
                timestamp: DateTime::from_timestamp(raw.t[i], 0).unwrap_or_else(Utc::now),
                open: raw.o[i],
                high: raw.h[i],
                low: raw.l[i],
                close: raw.c[i],
                volume: raw.v[i],
            })
            .collect())
    }

    /// Company news for `symbol`, or general market news when `None`.
    pub async fn news(&self, symbol: Option<&Symbol>, days: i64) -> Result<Vec<NewsArticle>, FeedError> {
        let items: Vec<NewsItem> = match symbol {
            Some(sym) => {
                let to = Utc::now().date_naive();
                let from = to - ChronoDuration::days(days);
                self.get(
                    "/company-news",
                    &[
                        ("symbol", sym.to_string()),
                        ("from", from.format("%Y-%m-%d").to_string()),
                        ("to", to.format("%Y-%m-%d").to_string()),
                    ],
                )
                .await?
            }
            None => {
                self.get("/news", &[("category", "general".to_string())])
                    .await?
            }
        };

        Ok(items
            .into_iter()
            .filter(|item| !item.headline.trim().is_empty())
            .map(|item| NewsArticle {
                title: item.headline,
                summary: item.summary.filter(|s| !s.is_empty()),
                source: item.source,
                url: item.url,
                published_at: item.datetime.and_then(|t| DateTime::from_timestamp(t, 0)),
            })
            .collect())
    }
}
