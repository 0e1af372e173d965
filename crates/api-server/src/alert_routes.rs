use alert_engine::{AlertEngine, Scope, TriggerEvent};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use copilot_client::SentimentReport;
use journal_store::{Alert, AlertInput, AlertKind};
use market_core::{Symbol, Tick};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::auth::CurrentUser;
use crate::trade_routes::PageQuery;
use crate::{ApiResponse, AppError, AppState};

/// Days of headlines considered for `sentiment_change` alerts.
const SENTIMENT_NEWS_DAYS: i64 = 7;

#[derive(Serialize)]
pub struct CheckTriggersResponse {
    pub checked: usize,
    pub triggered: Vec<TriggerEvent>,
}

pub fn alert_routes() -> Router<AppState> {
    Router::new()
        .route("/api/alerts", get(list_alerts).post(create_alert))
        .route("/api/alerts/active", get(active_alerts))
        .route("/api/alerts/check-triggers", post(check_triggers))
        .route(
            "/api/alerts/:id",
            get(get_alert).put(update_alert).delete(delete_alert),
        )
        .route("/api/alerts/:id/deactivate", post(deactivate_alert))
}

async fn create_alert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<AlertInput>,
) -> Result<(StatusCode, Json<ApiResponse<Alert>>), AppError> {
    let alert = state.alerts.create(user.id, req).await?;
    tracing::info!(user_id = user.id, alert_id = alert.id, "Created {} alert on {}", alert.alert_type, alert.symbol);
    Ok((StatusCode::CREATED, Json(ApiResponse::success(alert))))
}

async fn list_alerts(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<Alert>>>, AppError> {
    let (skip, limit) = page.bounds();
    Ok(Json(ApiResponse::success(
        state.alerts.list(user.id, skip, limit).await?,
    )))
}

async fn active_alerts(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<Vec<Alert>>>, AppError> {
    Ok(Json(ApiResponse::success(state.alerts.active(user.id).await?)))
}

async fn get_alert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Alert>>, AppError> {
    let alert = state
        .alerts
        .get(user.id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Alert"))?;
    Ok(Json(ApiResponse::success(alert)))
}

async fn update_alert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Json(req): Json<AlertInput>,
) -> Result<Json<ApiResponse<Alert>>, AppError> {
    let alert = state
        .alerts
        .update(user.id, id, req)
        .await?
        .ok_or_else(|| AppError::not_found("Alert"))?;
    Ok(Json(ApiResponse::success(alert)))
}

async fn delete_alert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    if !state.alerts.delete(user.id, id).await? {
        return Err(AppError::not_found("Alert"));
    }
    Ok(Json(ApiResponse::success(serde_json::json!({ "deleted": id }))))
}

async fn deactivate_alert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Alert>>, AppError> {
    if !state.alerts.deactivate(user.id, id).await? {
        return Err(AppError::not_found("Alert"));
    }
    let alert = state
        .alerts
        .get(user.id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Alert"))?;
    Ok(Json(ApiResponse::success(alert)))
}

/// Distinct symbols of the active alerts, flagged when any of them needs a
/// sentiment score.
fn symbols_to_check(alerts: &[Alert]) -> BTreeMap<Symbol, bool> {
    let mut symbols = BTreeMap::new();
    for alert in alerts {
        let needs_sentiment = symbols.entry(alert.symbol.clone()).or_insert(false);
        *needs_sentiment |= alert.alert_type == AlertKind::SentimentChange;
    }
    symbols
}

/// Quote every symbol the caller has active alerts on and run those alerts
/// once. Symbols whose quote cannot be fetched are skipped.
async fn check_triggers(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<CheckTriggersResponse>>, AppError> {
    let market = state.market_data()?;
    let active = state.alerts.active(user.id).await?;

    let mut ticks = Vec::new();
    for (symbol, needs_sentiment) in symbols_to_check(&active) {
        let quote = match market.quote(&symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Quote unavailable, skipping: {}", e);
                continue;
            }
        };

        let mut tick = Tick::new(symbol.clone(), quote.current);
        if needs_sentiment {
            let report = match market.news(Some(&symbol), SENTIMENT_NEWS_DAYS).await {
                Ok(articles) => state.sentiment.analyze(&articles).await,
                Err(e) => SentimentReport::neutral(Some(e.to_string())),
            };
            if report.article_count > 0 {
                tick = tick.with_sentiment(report.score);
            }
        }
        ticks.push(tick);
    }

    let response = evaluate_ticks(&state.engine, &ticks, user.id).await;
    tracing::info!(
        user_id = user.id,
        checked = response.checked,
        triggered = response.triggered.len(),
        "Checked alert triggers"
    );
    Ok(Json(ApiResponse::success(response)))
}

/// Run the caller's alerts against each tick. A failed evaluation only
/// loses that tick; flips already committed for earlier ticks are reported.
async fn evaluate_ticks(engine: &AlertEngine, ticks: &[Tick], user_id: i64) -> CheckTriggersResponse {
    let mut triggered = Vec::new();
    for tick in ticks {
        match engine.evaluate(tick, Scope::User(user_id)).await {
            Ok(events) => triggered.extend(events),
            Err(e) => tracing::error!(user_id, symbol = %tick.symbol, "Alert evaluation failed: {:#}", e),
        }
    }
    CheckTriggersResponse {
        checked: ticks.len(),
        triggered,
    }
}
