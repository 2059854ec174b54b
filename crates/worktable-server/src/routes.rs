//! HTTP routes under [`API_PREFIX`].
//!
//! Every JSON response is an [`ApiResponse`] envelope whose `status` agrees
//! with the HTTP status: 200 with `true`, 4xx/5xx with `false`.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::Instrument;

use worktable_client::{CollectionView, Interest, MutationRejected, SubscriptionError, SyncEvent};
use worktable_store::StoreError;
use worktable_telemetry::{TRACEPARENT_HEADER, TRACESTATE_HEADER, extract_trace_context};
use worktable_types::{
    API_PREFIX, ApiResponse, Board, Entity, EntityKind, FieldBag, MutationData, MutationOp,
    QueryShape, Workspace,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/:kind", get(list_entities).post(create_entity))
        .route("/:kind/update", post(update_entity))
        .route("/:kind/delete", post(delete_entity))
        .route("/:kind/watch", get(watch_entities));

    Router::new()
        .route("/healthz", get(health_check))
        .nest(API_PREFIX, api)
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        } else {
            tracing::info!(%status, error = %self, "request refused");
        }
        (status, Json(ApiResponse::<()>::fail(self.to_string()))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let detail = err.to_string();
        match err {
            StoreError::UnknownCollection(_) | StoreError::NotFound { .. } => ApiError::NotFound(detail),
            StoreError::PermissionDenied(_) => ApiError::Forbidden(detail),
            StoreError::InvalidQuery(_) => ApiError::BadRequest(detail),
            StoreError::Closed => ApiError::Unavailable(detail),
        }
    }
}

impl From<MutationRejected> for ApiError {
    fn from(err: MutationRejected) -> Self {
        match err {
            MutationRejected::Invalid(e) => ApiError::BadRequest(e.to_string()),
            MutationRejected::Store(e) => e.into(),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Rejected(e) => e.into(),
            SubscriptionError::KindMismatch { .. } => ApiError::Internal(err.to_string()),
            SubscriptionError::Unavailable(_) | SubscriptionError::Shutdown => {
                ApiError::Unavailable(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_kind(kind: &str) -> Result<EntityKind, ApiError> {
    EntityKind::from_str(kind).ok_or_else(|| ApiError::NotFound(format!("unknown entity kind {kind:?}")))
}

fn shape_of(params: BTreeMap<String, String>) -> QueryShape {
    params.into_iter().collect()
}

/// Span continuing the caller's trace when it sent `traceparent`.
fn request_span(headers: &HeaderMap) -> tracing::Span {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    extract_trace_context(&header(TRACEPARENT_HEADER), &header(TRACESTATE_HEADER))
}

// ============================================================================
// Mutations
// ============================================================================

async fn create_entity(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Result<Json<FieldBag>, JsonRejection>,
) -> Result<Json<ApiResponse<MutationData>>, ApiError> {
    mutate(state, &kind, MutationOp::Create, &headers, body).await
}

async fn update_entity(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Result<Json<FieldBag>, JsonRejection>,
) -> Result<Json<ApiResponse<MutationData>>, ApiError> {
    mutate(state, &kind, MutationOp::Update, &headers, body).await
}

async fn delete_entity(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Result<Json<FieldBag>, JsonRejection>,
) -> Result<Json<ApiResponse<MutationData>>, ApiError> {
    mutate(state, &kind, MutationOp::Delete, &headers, body).await
}

async fn mutate(
    state: AppState,
    kind: &str,
    op: MutationOp,
    headers: &HeaderMap,
    body: Result<Json<FieldBag>, JsonRejection>,
) -> Result<Json<ApiResponse<MutationData>>, ApiError> {
    let kind = parse_kind(kind)?;
    let Json(payload) = body?;
    async move {
        let id = state.gateway.try_submit(kind, op, payload).await?;
        tracing::info!(%kind, %op, id = ?id, "mutation applied");
        Ok::<_, ApiError>(Json(ApiResponse::ok(MutationData { id })))
    }
    .instrument(request_span(headers))
    .await
}

// ============================================================================
// Reads
// ============================================================================

/// One-shot list, served from a registry view of the query.
async fn list_entities(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let shape = shape_of(params);
    let span = request_span(&headers);
    match kind {
        EntityKind::Workspace => list_view::<Workspace>(&state, shape).instrument(span).await,
        EntityKind::Board => list_view::<Board>(&state, shape).instrument(span).await,
    }
}

async fn list_view<E: Entity + Serialize>(state: &AppState, shape: QueryShape) -> Result<Response, ApiError> {
    let mut interest = state.registry.acquire::<E>(shape).await?;
    let mut view = CollectionView::<E>::new();
    match tokio::time::timeout(state.config.list_timeout(), view.sync(&mut interest)).await {
        Ok(Ok(generation)) => {
            tracing::debug!(key = %interest.key(), generation = generation.0, len = view.len(), "list served");
            Ok(Json(ApiResponse::ok(view.to_vec())).into_response())
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(ApiError::Unavailable(format!(
            "no snapshot for {} within {:?}",
            interest.key(),
            state.config.list_timeout()
        ))),
    }
}

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// Live watch as Server-Sent Events.
///
/// Each push arrives as one `entity` event per document followed by a
/// `snapshot` event carrying the generation. Termination sends one `error`
/// event and closes the stream.
async fn watch_entities(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Result<Sse<EventStream>, ApiError> {
    let kind = parse_kind(&kind)?;
    let shape = shape_of(params);
    let span = request_span(&headers);
    let stream = match kind {
        EntityKind::Workspace => {
            event_stream(state.registry.acquire::<Workspace>(shape).instrument(span).await?)
        }
        EntityKind::Board => event_stream(state.registry.acquire::<Board>(shape).instrument(span).await?),
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_stream<E: Entity + Serialize>(interest: Interest<E>) -> EventStream {
    tracing::info!(key = %interest.key(), "sse watch opened");
    futures::stream::unfold(Some(interest), |slot| async move {
        let mut interest = slot?;
        loop {
            let frame = match interest.recv().await? {
                SyncEvent::Entity(entity) => match Event::default().event("entity").json_data(&entity) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(id = %entity.id(), error = %err, "failed to encode entity");
                        continue;
                    }
                },
                SyncEvent::Malformed(_) => continue,
                SyncEvent::SnapshotComplete(generation) => {
                    Event::default().event("snapshot").data(generation.0.to_string())
                }
                SyncEvent::Terminated(err) => {
                    tracing::info!(key = %interest.key(), error = %err, "sse watch terminated");
                    let frame = Event::default().event("error").data(err.to_string());
                    return Some((Ok::<_, Infallible>(frame), None));
                }
            };
            return Some((Ok::<_, Infallible>(frame), Some(interest)));
        }
    })
    .boxed()
}
