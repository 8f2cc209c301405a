use crate::{
    app::App,
    catalog::SearchFilters,
    eid::Eid,
    errors::AppError,
    lists::{ItemUpdate, ListCreate, ListUpdate, ShareCode, UserList},
    search::{Facets, SearchPage, Suggestion},
    task_runner::{JobHandle, QueueDump, TaskDump},
};
use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tokio::signal;

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

pub fn router(app: Arc<App>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/search/suggestions", get(suggestions))
        .route("/api/search/filters", get(filters))
        .route("/api/admin/sync", post(admin_sync))
        .route("/api/admin/embeddings", post(admin_embeddings))
        .route("/api/admin/reconcile", post(admin_reconcile))
        .route("/api/task_queue", get(task_queue))
        .route("/api/task_queue/:id", get(task_status))
        .route("/api/lists", post(create_list).get(session_lists))
        .route("/api/lists/sync/:code", post(sync_list))
        .route(
            "/api/lists/:id",
            get(get_list).patch(update_list).delete(delete_list),
        )
        .route("/api/lists/:id/items", post(add_item))
        .route("/api/lists/:id/items/:sku", patch(update_item).delete(remove_item))
        .route("/api/lists/:id/share", post(share_list))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(app: Arc<App>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("waiting for queues to stop");
    if let Err(err) = tokio::task::spawn_blocking(move || app.shutdown()).await {
        log::error!("shutdown failed: {err}");
    }
}

async fn start_app(app: Arc<App>, addr: &str) -> anyhow::Result<()> {
    let signal = shutdown_signal(app.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

pub fn start_daemon(app: App, addr: &str) -> anyhow::Result<()> {
    let app = Arc::new(app);
    app.run_queue()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app, addr))
}

#[derive(Debug)]
struct HttpError(AppError);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) | AppError::ShareCodeNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ShareCodeExpired { .. } => StatusCode::GONE,
            AppError::SearchUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Session from the `X-Session-Id` header, or the request body as a fallback.
fn session_id(headers: &HeaderMap, body: Option<&str>) -> Result<String, AppError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(body)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("session id is required".to_string()))
}

fn parse_eid(id: &str) -> Result<Eid, AppError> {
    let id: Eid = id.parse().unwrap_or_default();
    if id.is_empty() {
        return Err(AppError::Validation("id must not be empty".to_string()));
    }
    Ok(id)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default, flatten)]
    pub filters: SearchFilters,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchPage>, HttpError> {
    let app = state.app.clone();
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        app.search(&payload.query, &payload.filters, payload.page, payload.page_size)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
pub struct SuggestionsQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_suggestion_limit")]
    pub limit: usize,
}

fn default_suggestion_limit() -> usize {
    10
}

async fn suggestions(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<SuggestionsQuery>,
) -> Result<Json<Vec<Suggestion>>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.suggestions(&query.q, query.limit.min(50))
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
pub struct FiltersQuery {
    pub category_id: Option<u64>,
}

async fn filters(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<FiltersQuery>,
) -> Result<Json<Facets>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.facets(query.category_id)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub feed_path: PathBuf,
}

async fn admin_sync(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SyncRequest>,
) -> Result<(StatusCode, Json<JobHandle>), HttpError> {
    let app = state.app.clone();
    let handle = tokio::task::block_in_place(move || app.trigger_sync(&payload.feed_path))?;
    Ok((StatusCode::ACCEPTED, handle.into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct EmbeddingsRequest {
    pub sku: Option<String>,
}

async fn admin_embeddings(
    State(state): State<Arc<SharedState>>,
    payload: Option<Json<EmbeddingsRequest>>,
) -> Result<(StatusCode, Json<JobHandle>), HttpError> {
    let app = state.app.clone();
    let sku = payload.and_then(|Json(p)| p.sku);
    let handle = tokio::task::block_in_place(move || app.trigger_embedding_update(sku))?;
    Ok((StatusCode::ACCEPTED, handle.into()))
}

async fn admin_reconcile(
    State(state): State<Arc<SharedState>>,
) -> Result<(StatusCode, Json<JobHandle>), HttpError> {
    let app = state.app.clone();
    let handle = tokio::task::block_in_place(move || app.trigger_reconciliation())?;
    Ok((StatusCode::ACCEPTED, handle.into()))
}

async fn task_queue(State(state): State<Arc<SharedState>>) -> Result<Json<QueueDump>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || Ok(app.task_queue().into()))
}

async fn task_status(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDump>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.job_status(&parse_eid(&id)?)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateListRequest {
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub list: ListCreate,
}

async fn create_list(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateListRequest>,
) -> Result<(StatusCode, Json<UserList>), HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, payload.session_id.as_deref())?;
    let list = tokio::task::block_in_place(move || app.lists.create(&session, payload.list))?;
    Ok((StatusCode::CREATED, list.into()))
}

async fn session_lists(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserList>>, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, None)?;
    tokio::task::block_in_place(move || {
        app.lists
            .by_session(&session)
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn get_list(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<UserList>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.lists
            .get(&parse_eid(&id)?)
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn update_list(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ListUpdate>,
) -> Result<Json<UserList>, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, None)?;
    tokio::task::block_in_place(move || {
        app.lists
            .update_list(&parse_eid(&id)?, &session, payload)
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn delete_list(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, None)?;
    tokio::task::block_in_place(move || app.lists.delete(&parse_eid(&id)?, &session))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub session_id: Option<String>,
    pub sku: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub notes: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

async fn add_item(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<AddItemRequest>,
) -> Result<Json<UserList>, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, payload.session_id.as_deref())?;
    tokio::task::block_in_place(move || {
        app.lists
            .add_item(
                &parse_eid(&id)?,
                &session,
                &payload.sku,
                payload.quantity,
                payload.notes,
            )
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn update_item(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path((id, sku)): Path<(String, String)>,
    Json(payload): Json<ItemUpdate>,
) -> Result<Json<UserList>, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, None)?;
    tokio::task::block_in_place(move || {
        app.lists
            .update_item(&parse_eid(&id)?, &session, &sku, payload)
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn remove_item(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path((id, sku)): Path<(String, String)>,
) -> Result<Json<UserList>, HttpError> {
    let app = state.app.clone();
    let session = session_id(&headers, None)?;
    tokio::task::block_in_place(move || {
        app.lists
            .remove_item(&parse_eid(&id)?, &session, &sku)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionBody {
    pub session_id: Option<String>,
}

async fn share_list(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Option<Json<SessionBody>>,
) -> Result<Json<ShareCode>, HttpError> {
    let app = state.app.clone();
    let body = payload.and_then(|Json(p)| p.session_id);
    let session = session_id(&headers, body.as_deref())?;
    tokio::task::block_in_place(move || {
        app.generate_share_code(&parse_eid(&id)?, &session)
            .map(Into::into)
            .map_err(Into::into)
    })
}

async fn sync_list(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(code): Path<String>,
    payload: Option<Json<SessionBody>>,
) -> Result<(StatusCode, Json<UserList>), HttpError> {
    let app = state.app.clone();
    let body = payload.and_then(|Json(p)| p.session_id);
    let session = session_id(&headers, body.as_deref())?;
    let list = tokio::task::block_in_place(move || app.sync_from_code(&code, &session))?;
    Ok((StatusCode::CREATED, list.into()))
}
