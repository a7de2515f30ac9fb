use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clickrank_core::{
    Dispatcher, Document, RankedResult, RankingEngine, RetrainOutcome, SearchError, SettingEntry, SharedEngine, Store,
    StoreValue, MODEL_KEY,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod protocol;

use protocol::{error_json, results_json, ClientMessage, ErrorReply, FeedbackMessage, QueryMessage};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Sizes the worker pool from the stored settings.
    pub fn new(store: Arc<Store>, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let dispatcher = Dispatcher::from_settings(&store.settings())?;
        Ok(Self { store, dispatcher: Arc::new(dispatcher), shutdown })
    }

    /// The stored engine, or a freshly installed empty one. Goes through the
    /// first-write-wins path so concurrent callers agree on a single engine.
    fn engine_or_empty(&self) -> Result<SharedEngine, SearchError> {
        if let Some(engine) = self.store.engine() {
            return Ok(engine);
        }
        match self.store.set(MODEL_KEY, StoreValue::model(RankingEngine::default())) {
            Ok(()) => tracing::info!("no model stored yet, installed an empty engine"),
            Err(SearchError::KeyProtected { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.store.engine() {
            Some(engine) => Ok(engine),
            None => self.store.install_engine(RankingEngine::default()),
        }
    }
}

/// Error wrapper mapping the core taxonomy onto HTTP statuses.
pub struct ApiError(pub SearchError);

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SearchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SearchError::UnknownDocument { .. } => StatusCode::NOT_FOUND,
            SearchError::DuplicateDocument { .. } | SearchError::KeyProtected { .. } => StatusCode::CONFLICT,
            SearchError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorReply::from(&self.0))).into_response()
    }
}

pub fn build_app(state: AppState) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/ws", get(ws_handler))
        .route("/search", get(search_handler))
        .route("/feedback", post(feedback_handler))
        .route("/retrain", post(retrain_handler))
        .route("/index/batch", post(index_batch))
        .route("/doc", delete(remove_doc))
        .route("/settings", get(settings_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serves until `shutdown` fires, then stops accepting and lets open requests drain.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Cancels `shutdown` on Ctrl-C, or on SIGTERM where the platform has it.
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("interrupt received, shutting down"),
        _ = terminate => tracing::info!("terminate received, shutting down"),
    }
    shutdown.cancel();
}

/// Ranks through the worker pool. With no stored model the result is empty.
pub async fn run_query(
    state: &AppState,
    query: String,
    filter: Option<BTreeSet<String>>,
) -> Result<Vec<RankedResult>, SearchError> {
    let Some(engine) = state.store.engine() else {
        tracing::warn!("no model stored, build one with the indexer");
        return Ok(Vec::new());
    };
    state.dispatcher.rank(engine, query, filter)?.await
}

pub async fn record_feedback(state: &AppState, feedback: FeedbackMessage) -> Result<(), SearchError> {
    let Some(engine) = state.store.engine() else {
        return Err(SearchError::UnknownDocument { url: feedback.url });
    };
    state.dispatcher.absorb_feedback(engine, feedback.query, feedback.url, feedback.clicked)?.await
}

/// Flushes the store on a worker so the event loop never blocks on disk.
async fn persist(state: &AppState) {
    let store = Arc::clone(&state.store);
    match state.dispatcher.submit(move || store.save()) {
        Ok(handle) => {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "store save failed");
            }
        }
        Err(e) => tracing::error!(error = %e, "could not schedule store save"),
    }
}

/// Handles one client text message and produces the reply text.
pub async fn handle_message(state: &AppState, text: &str) -> String {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => return error_json(&SearchError::invalid(format!("malformed message: {e}"))),
    };
    match message {
        ClientMessage::Query(q) => {
            let filter = q.filter_set();
            match run_query(state, q.query, filter).await {
                Ok(results) => results_json(&results),
                Err(e) => error_json(&e),
            }
        }
        ClientMessage::Feedback { feedback } => match record_feedback(state, feedback).await {
            Ok(()) => r#"{"ok":true}"#.to_string(),
            Err(e) => error_json(&e),
        },
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One request at a time per connection: a reply is sent before the next message is read.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    tracing::debug!("websocket connected");
    loop {
        let incoming = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = socket.recv() => msg,
        };
        let message = match incoming {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "websocket receive failed");
                break;
            }
            None => break,
        };
        match message {
            Message::Text(text) => {
                tracing::info!(message = %text, "websocket message");
                let reply = handle_message(&state, &text).await;
                if let Err(e) = socket.send(Message::Text(reply)).await {
                    tracing::warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    tracing::debug!("websocket disconnected");
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    /// Comma-separated tag filter
    #[serde(default)]
    pub filters: Option<String>,
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<RankedResult>>, ApiError> {
    let message = QueryMessage {
        query: params.q,
        filters: params.filters.map(|f| f.split(',').map(str::to_string).collect()),
    };
    let filter = message.filter_set();
    Ok(Json(run_query(&state, message.query, filter).await?))
}

async fn feedback_handler(
    State(state): State<AppState>,
    Json(feedback): Json<FeedbackMessage>,
) -> Result<Json<serde_json::Value>, ApiError> {
    record_feedback(&state, feedback).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn retrain_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(engine) = state.store.engine() else {
        return Ok(Json(serde_json::json!({ "outcome": "nothing_to_train" })));
    };
    let outcome = state.dispatcher.retrain(engine)?.await?;
    let body = match outcome {
        RetrainOutcome::NothingToTrain => serde_json::json!({ "outcome": "nothing_to_train" }),
        RetrainOutcome::Trained { samples, skipped } => {
            persist(&state).await;
            serde_json::json!({ "outcome": "trained", "samples": samples, "skipped": skipped })
        }
    };
    Ok(Json(body))
}

async fn index_batch(
    State(state): State<AppState>,
    Json(docs): Json<Vec<Document>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let added = docs.len();
    let engine = state.engine_or_empty()?;
    let total = state.dispatcher.append_documents(engine, docs)?.await?;
    persist(&state).await;
    Ok(Json(serde_json::json!({ "added": added, "documents": total })))
}

#[derive(Deserialize)]
struct DocParams {
    url: String,
}

async fn remove_doc(
    State(state): State<AppState>,
    Query(params): Query<DocParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(engine) = state.store.engine() else {
        return Err(SearchError::UnknownDocument { url: params.url }.into());
    };
    let removed = state.dispatcher.remove_document(engine, params.url)?.await?;
    persist(&state).await;
    Ok(Json(serde_json::json!({ "removed": removed.url })))
}

async fn settings_handler(State(state): State<AppState>) -> Json<Vec<SettingEntry>> {
    Json(state.store.settings().entries().to_vec())
}
