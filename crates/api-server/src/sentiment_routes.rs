use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use copilot_client::SentimentReport;
use market_core::Symbol;
use serde::Deserialize;

use crate::{ApiResponse, AppState};

/// Days of headlines scored per request.
const NEWS_LOOKBACK_DAYS: i64 = 3;

#[derive(Deserialize)]
pub struct SentimentQuery {
    #[serde(default)]
    pub symbol: Option<String>,
}

pub fn sentiment_routes() -> Router<AppState> {
    Router::new().route("/api/sentiment/latest", get(latest_sentiment))
}

/// Score recent headlines for a symbol, or general market news without one.
/// Always answers; failures come back as a neutral report with `error`.
async fn latest_sentiment(
    State(state): State<AppState>,
    Query(query): Query<SentimentQuery>,
) -> Json<ApiResponse<SentimentReport>> {
    Json(ApiResponse::success(score_news(&state, query.symbol.as_deref()).await))
}

async fn score_news(state: &AppState, symbol: Option<&str>) -> SentimentReport {
    let symbol = match symbol.map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match Symbol::parse(raw) {
            Ok(symbol) => Some(symbol),
            Err(e) => return SentimentReport::neutral(Some(e.to_string())),
        },
    };

    let Some(market) = state.market_data.as_ref() else {
        return SentimentReport::neutral(Some("Market data is not configured".to_string()));
    };

    match market.news(symbol.as_ref(), NEWS_LOOKBACK_DAYS).await {
        Ok(articles) => state.sentiment.analyze(&articles).await,
        Err(e) => {
            tracing::warn!(symbol = ?symbol, "News fetch failed: {}", e);
            SentimentReport::neutral(Some(e.to_string()))
        }
    }
}
