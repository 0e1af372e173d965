use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use journal_store::{import_trades_csv, Trade, TradeInput};
use serde::{Deserialize, Serialize};

use crate::auth::CurrentUser;
use crate::{ApiResponse, AppError, AppState};

pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// `?skip&limit` paging shared by the journal list endpoints.
#[derive(Deserialize, Default, Clone, Copy)]
pub struct PageQuery {
    #[serde(default)]
    pub skip: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl PageQuery {
    pub fn bounds(&self) -> (i64, i64) {
        let skip = self.skip.unwrap_or(0).max(0);
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        (skip, limit)
    }
}

#[derive(Serialize)]
pub struct CsvUploadResponse {
    pub imported: usize,
    pub trades: Vec<Trade>,
}

pub fn trade_routes() -> Router<AppState> {
    Router::new()
        .route("/api/trades", get(list_trades).post(create_trade))
        .route("/api/trades/upload-csv", post(upload_csv))
        .route(
            "/api/trades/:id",
            get(get_trade).put(update_trade).delete(delete_trade),
        )
}

async fn create_trade(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<TradeInput>,
) -> Result<(StatusCode, Json<ApiResponse<Trade>>), AppError> {
    let trade = state.trades.create(user.id, req).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(trade))))
}

async fn list_trades(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<Vec<Trade>>>, AppError> {
    let (skip, limit) = page.bounds();
    let trades = state.trades.list(user.id, skip, limit).await?;
    Ok(Json(ApiResponse::success(trades)))
}

async fn get_trade(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Trade>>, AppError> {
    let trade = state
        .trades
        .get(user.id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Trade"))?;
    Ok(Json(ApiResponse::success(trade)))
}

async fn update_trade(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Json(req): Json<TradeInput>,
) -> Result<Json<ApiResponse<Trade>>, AppError> {
    let trade = state
        .trades
        .update(user.id, id, req)
        .await?
        .ok_or_else(|| AppError::not_found("Trade"))?;
    Ok(Json(ApiResponse::success(trade)))
}

async fn delete_trade(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    if !state.trades.delete(user.id, id).await? {
        return Err(AppError::not_found("Trade"));
    }
    Ok(Json(ApiResponse::success(serde_json::json!({ "deleted": id }))))
}

/// All-or-nothing CSV import from the multipart field `file`.
async fn upload_csv(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ApiResponse<CsvUploadResponse>>), AppError> {
    let mut data = None;
    while let Some(field) = multipart.next_field().await.map_err(AppError::bad_request)? {
        if field.name() != Some("file") {
            continue;
        }
        if let Some(name) = field.file_name() {
            if !name.to_ascii_lowercase().ends_with(".csv") {
                return Err(AppError::bad_request("File must be a CSV"));
            }
        }
        data = Some(field.bytes().await.map_err(AppError::bad_request)?);
        break;
    }

    let data = data.ok_or_else(|| AppError::bad_request("Missing multipart field 'file'"))?;
    let trades = import_trades_csv(&state.db, user.id, &data).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CsvUploadResponse {
            imported: trades.len(),
            trades,
        })),
    ))
}
