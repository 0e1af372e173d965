use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use journal_store::{risk_metrics, summarize, RiskMetrics, TradeSummary};
use market_core::Symbol;
use price_feed::FeedError;
use technical_analysis::{analyze, TechnicalSnapshot};

use crate::auth::CurrentUser;
use crate::{ApiResponse, AppError, AppState};

/// Daily candles fetched for indicator computation.
const TECHNICAL_LOOKBACK_DAYS: i64 = 200;

pub fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/api/analytics/summary", get(get_summary))
        .route("/api/analytics/risk-metrics", get(get_risk_metrics))
        .route("/api/analytics/technical/:symbol", get(get_technical))
}

async fn get_summary(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<TradeSummary>>, AppError> {
    let trades = state.trades.all_chronological(user.id).await?;
    Ok(Json(ApiResponse::success(summarize(&trades))))
}

async fn get_risk_metrics(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<RiskMetrics>>, AppError> {
    let trades = state.trades.all_chronological(user.id).await?;
    Ok(Json(ApiResponse::success(risk_metrics(&trades))))
}

async fn get_technical(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<TechnicalSnapshot>>, AppError> {
    let symbol = Symbol::parse(&symbol).map_err(AppError::bad_request)?;
    let market = state.market_data()?;

    let bars = match market.daily_candles(&symbol, TECHNICAL_LOOKBACK_DAYS).await {
        Ok(bars) => bars,
        Err(FeedError::NoData(_)) => return Err(AppError::not_found(format!("Price history for {}", symbol))),
        Err(e) => {
            return Err(AppError::with_status(
                StatusCode::BAD_GATEWAY,
                anyhow::anyhow!("Market data request failed: {}", e),
            ))
        }
    };

    let snapshot = analyze(symbol, &bars).map_err(|e| AppError::with_status(StatusCode::NOT_FOUND, e.into()))?;
    Ok(Json(ApiResponse::success(snapshot)))
}
