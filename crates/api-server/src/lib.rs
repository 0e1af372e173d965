//! HTTP and WebSocket surface of the trading copilot.

mod alert_routes;
mod analytics_routes;
mod auth;
mod auth_routes;
mod brute_force;
pub mod config;
mod copilot_routes;
mod live;
mod request_id;
mod sentiment_routes;
mod trade_routes;
mod ws_routes;

#[cfg(test)]
#[path = "routes_tests.rs"]
mod routes_tests;

use alert_engine::AlertEngine;
use axum::{
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use copilot_client::{GeminiClient, GeminiConfig, SentimentAnalyzer};
use journal_store::{AlertStore, CsvImportError, InputError, JournalDb, TradeStore, UserStore};
use price_feed::MarketDataClient;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use brute_force::BruteForceGuard;
pub use config::ServerConfig;
pub use live::LiveStream;

/// Shared handles passed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: JournalDb,
    pub users: UserStore,
    pub trades: TradeStore,
    pub alerts: AlertStore,
    pub engine: Arc<AlertEngine>,
    pub market_data: Option<MarketDataClient>,
    pub llm: Arc<GeminiClient>,
    pub sentiment: SentimentAnalyzer,
    pub live: Option<LiveStream>,
    pub brute_force_guard: Arc<BruteForceGuard>,
}

impl AppState {
    /// Wire stores, engine and clients. The live stream is attached
    /// separately by [`run_server`].
    pub fn new(config: ServerConfig, db: JournalDb) -> Self {
        let alerts = AlertStore::new(db.clone());
        let engine = Arc::new(AlertEngine::new(alerts.clone()));

        let market_data = config.finnhub_api_key.as_ref().map(|key| {
            MarketDataClient::new(
                config.finnhub_rest_url.clone(),
                key.clone(),
                config.market_data_timeout,
            )
        });
        if market_data.is_none() {
            tracing::warn!("FINNHUB_API_KEY missing; quotes, candles, news and the price stream are disabled");
        }

        let llm = Arc::new(GeminiClient::new(
            GeminiConfig::new(config.gemini_api_key.clone())
                .with_base_url(config.gemini_base_url.clone())
                .with_timeout(config.llm_timeout),
        ));

        let brute_force_guard = Arc::new(BruteForceGuard::new(
            config.auth_max_failures,
            config.auth_failure_window,
            config.auth_lockout,
        ));

        Self {
            users: UserStore::new(db.clone()),
            trades: TradeStore::new(db.clone()),
            alerts,
            engine,
            market_data,
            sentiment: SentimentAnalyzer::new(llm.clone()),
            llm,
            live: None,
            brute_force_guard,
            config: Arc::new(config),
            db,
        }
    }

    pub fn market_data(&self) -> Result<&MarketDataClient, AppError> {
        self.market_data.as_ref().ok_or_else(|| {
            AppError::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                anyhow::anyhow!("Market data is not configured"),
            )
        })
    }
}

/// JSON envelope for every REST response.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Handler error: an HTTP status plus the underlying cause.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: anyhow::Error,
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, anyhow::anyhow!("{} not found", what))
    }

    pub fn bad_request(msg: impl std::fmt::Display) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, anyhow::anyhow!("{}", msg))
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = if error.downcast_ref::<InputError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(auth) = error.downcast_ref::<auth::AuthError>() {
            auth.status()
        } else if let Some(csv) = error.downcast_ref::<CsvImportError>() {
            if csv.is_client_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, error }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() {
            tracing::error!(status = %self.status, "Request failed: {:#}", self.error);
            match self.status {
                StatusCode::SERVICE_UNAVAILABLE => self.error.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.error.to_string()
        };

        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Trading Copilot API",
        "docs": "/health",
    }))
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Response {
    let db_ok = sqlx::query("SELECT 1").execute(state.db.pool()).await.is_ok();
    let body = serde_json::json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "database": db_ok,
        "market_data": state.market_data.is_some(),
        "price_stream": state.live.is_some(),
        "copilot": state.llm.is_configured(),
    });
    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

/// Full application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(auth_routes::session_routes())
        .merge(trade_routes::trade_routes())
        .merge(alert_routes::alert_routes())
        .merge(analytics_routes::analytics_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::session_middleware,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(auth_routes::public_routes())
        .merge(sentiment_routes::sentiment_routes())
        .merge(copilot_routes::copilot_routes())
        .merge(ws_routes::ws_routes())
        .merge(protected)
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = tracing::field::Empty,
                )
            }),
        )
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Load config, open the database, start the live pipeline and serve until
/// a shutdown signal arrives.
pub async fn run_server() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    tracing::info!(
        bind = %config.bind_addr,
        database = %config.database_url,
        symbols = ?config.stream_symbols,
        "Configuration loaded"
    );

    let db = JournalDb::new(&config.database_url).await?;
    let mut state = AppState::new(config, db);
    let cancel = CancellationToken::new();

    if state.market_data.is_some() {
        state.live = Some(live::start(&state, cancel.clone()));
    }

    let guard = state.brute_force_guard.clone();
    let users = state.users.clone();
    let housekeeping_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = housekeeping_cancel.cancelled() => break,
                _ = interval.tick() => {
                    guard.cleanup();
                    match users.purge_expired_sessions().await {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("Purged {} expired sessions", n),
                        Err(e) => tracing::warn!("Session purge failed: {:#}", e),
                    }
                }
            }
        }
    });

    let addr = state.config.bind_addr;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    tracing::info!("Server stopped");
    Ok(())
}
