use axum::{extract::State, routing::post, Json, Router};
use copilot_client::CopilotReply;
use serde::Deserialize;

use crate::{ApiResponse, AppError, AppState};

const MAX_QUESTION_CHARS: usize = 4000;

#[derive(Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

pub fn copilot_routes() -> Router<AppState> {
    Router::new().route("/api/copilot/ask", post(ask))
}

async fn ask(
    State(state): State<AppState>,
    Json(req): Json<AskRequest>,
) -> Result<Json<ApiResponse<CopilotReply>>, AppError> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(AppError::bad_request("question must not be empty"));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(AppError::bad_request(format!(
            "question must be at most {} characters",
            MAX_QUESTION_CHARS
        )));
    }

    let symbols: Vec<String> = req
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(Json(ApiResponse::success(state.llm.chat(question, &symbols).await)))
}
