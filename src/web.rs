//! HTTP + WebSocket front end for the two pipelines.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::NaiveDate;
use futures::StreamExt;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::llm::{LlmConfig, LlmProvider, create_provider};
use crate::mailbox::{ImapConnector, MailboxConnector};
use crate::pipeline::{RangeSummarizer, UnreadScanner, parse_date_choice};

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scanner: Arc<UnreadScanner>,
    pub summarizer: Arc<RangeSummarizer>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        connector: Arc<dyn MailboxConnector>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            scanner: Arc::new(UnreadScanner::new(Arc::clone(&config), Arc::clone(&connector))),
            summarizer: Arc::new(RangeSummarizer::new(config, connector, llm)),
        }
    }
}

/// Wire the production stack: IMAP over TLS and, when a key is set, Gemini.
pub fn build_app(config: AppConfig) -> crate::error::Result<Router> {
    let connector: Arc<dyn MailboxConnector> = Arc::new(ImapConnector::from_config(&config));
    let llm = match &config.gemini_api_key {
        Some(key) => Some(create_provider(&LlmConfig::new(key.clone(), &config.model))?),
        None => None,
    };
    Ok(router(AppState::new(Arc::new(config), connector, llm)))
}

/// Build the Axum router with the page, REST and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/unread-dates", get(unread_dates))
        .route("/ws/summarize", get(ws_summarize))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-digest"
    }))
}

// ── Unread scan ─────────────────────────────────────────────────────────

async fn unread_dates(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scanner.scan().await)
}

// ── Range summary ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

/// Accepts `2024-01-11` or a selector label like `2024-01-11 (2封)`.
fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_date_choice(raw))
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

async fn ws_summarize(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let (Some(start), Some(end)) = (query.start.as_deref(), query.end.as_deref()) else {
        return bad_request("start and end are required");
    };
    let (Some(start), Some(end)) = (parse_day(start), parse_day(end)) else {
        return bad_request("dates must look like YYYY-MM-DD");
    };

    info!(start = %start, end = %end, "Summary client connecting");
    ws.on_upgrade(move |socket| stream_summary(socket, state.summarizer, start, end))
}

async fn stream_summary(
    mut socket: WebSocket,
    summarizer: Arc<RangeSummarizer>,
    start: NaiveDate,
    end: NaiveDate,
) {
    let mut updates = summarizer.summarize_range(start, end);

    while let Some(update) = updates.next().await {
        let json = match serde_json::to_string(&update) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode summary update");
                continue;
            }
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            // The run keeps going server-side so its session is still closed.
            debug!("Summary client disconnected");
            return;
        }
        if update.terminal {
            break;
        }
    }

    if socket.send(Message::Close(None)).await.is_err() {
        debug!("Summary client gone before close frame");
    }
    info!("Summary stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_day_accepts_plain_dates_and_labels() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 11).unwrap();
        assert_eq!(parse_day("2024-01-11"), Some(day));
        assert_eq!(parse_day(" 2024-01-11 "), Some(day));
        assert_eq!(parse_day("2024-01-11 (2封)"), Some(day));
        assert_eq!(parse_day("11/01/2024"), None);
    }

    #[tokio::test]
    async fn build_app_without_key_still_serves() {
        let app = build_app(AppConfig::default());
        assert!(app.is_ok());
    }
}
