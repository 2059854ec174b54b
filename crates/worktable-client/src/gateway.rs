//! Mutation gateway: submit create/update/delete and report the verdict.
//!
//! The gateway never touches local state and never retries. The effect of an
//! accepted mutation is only ever observed through the next push of a watch
//! covering the document.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::Instrument;

use worktable_store::SharedStore;
use worktable_telemetry::{TRACEPARENT_HEADER, TRACESTATE_HEADER, inject_trace_context};
use worktable_types::{
    ApiResponse, DocumentId, EntityKind, FieldBag, MutationData, MutationOp, ValidatedMutation,
    validate,
};

use crate::config::ClientConfig;
use crate::error::MutationRejected;

/// Verdict of one submitted mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub accepted: bool,
    /// Id of the affected document (assigned by the store on create).
    pub id: Option<DocumentId>,
    /// Why the mutation was rejected. Set iff `accepted` is false.
    pub error_detail: Option<String>,
}

impl MutationOutcome {
    pub fn accepted(id: Option<DocumentId>) -> Self {
        Self {
            accepted: true,
            id,
            error_detail: None,
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            id: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// How mutations reach the store.
#[async_trait]
pub trait MutationTransport: Send + Sync + 'static {
    async fn send(
        &self,
        kind: EntityKind,
        op: MutationOp,
        payload: FieldBag,
    ) -> Result<Option<DocumentId>, MutationRejected>;
}

// ============================================================================
// Store transport
// ============================================================================

/// Validates and calls the store's mutation primitive in-process.
#[derive(Clone)]
pub struct StoreTransport {
    store: SharedStore,
}

impl StoreTransport {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MutationTransport for StoreTransport {
    async fn send(
        &self,
        kind: EntityKind,
        op: MutationOp,
        payload: FieldBag,
    ) -> Result<Option<DocumentId>, MutationRejected> {
        let collection = kind.collection();
        match validate(kind, op, &payload)? {
            ValidatedMutation::Create { fields } => {
                Ok(Some(self.store.create(collection, fields).await?))
            }
            ValidatedMutation::Update { id, fields } => {
                self.store.update(collection, &id, fields).await?;
                Ok(Some(id))
            }
            ValidatedMutation::Delete { id } => {
                self.store.delete(collection, &id).await?;
                Ok(Some(id))
            }
        }
    }
}

// ============================================================================
// HTTP transport
// ============================================================================

/// Posts mutations to a worktable server.
///
/// Accepted only when the HTTP status is a success **and** the envelope's
/// `status` is true. Payloads are checked locally first so an invalid one
/// never hits the network.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, MutationRejected> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MutationRejected::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MutationTransport for HttpTransport {
    async fn send(
        &self,
        kind: EntityKind,
        op: MutationOp,
        payload: FieldBag,
    ) -> Result<Option<DocumentId>, MutationRejected> {
        validate(kind, op, &payload)?;

        let url = format!("{}{}", self.base_url, op.path(kind));
        let mut request = self.client.post(&url).json(&payload);

        let (traceparent, tracestate) = inject_trace_context();
        if !traceparent.is_empty() {
            request = request.header(TRACEPARENT_HEADER, traceparent);
            if !tracestate.is_empty() {
                request = request.header(TRACESTATE_HEADER, tracestate);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| MutationRejected::Transport(e.to_string()))?;
        let status = response.status();
        let body: ApiResponse<MutationData> =
            response
                .json()
                .await
                .map_err(|e| MutationRejected::Inconsistent {
                    status: status.as_u16(),
                    detail: format!("unreadable response body: {e}"),
                })?;

        match (status.is_success(), body.status) {
            (true, true) => Ok(body.data.and_then(|d| d.id)),
            (false, false) => Err(MutationRejected::Http {
                status: status.as_u16(),
                detail: body.error.unwrap_or_else(|| status.to_string()),
            }),
            (http_ok, envelope_ok) => Err(MutationRejected::Inconsistent {
                status: status.as_u16(),
                detail: format!(
                    "http success {http_ok} but envelope status {envelope_ok}: {}",
                    body.error.unwrap_or_default()
                ),
            }),
        }
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Front door for mutations.
#[derive(Clone)]
pub struct MutationGateway {
    transport: Arc<dyn MutationTransport>,
}

impl MutationGateway {
    pub fn new(transport: impl MutationTransport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Gateway calling `store` directly.
    pub fn over_store(store: SharedStore) -> Self {
        Self::new(StoreTransport::new(store))
    }

    /// Gateway posting to a server.
    pub fn over_http(config: &ClientConfig) -> Result<Self, MutationRejected> {
        Ok(Self::new(HttpTransport::new(config)?))
    }

    /// Submit one mutation. Never retried.
    pub async fn submit(&self, kind: EntityKind, op: MutationOp, payload: FieldBag) -> MutationOutcome {
        let span = tracing::info_span!("mutation.submit", %kind, %op);
        async move {
            match self.transport.send(kind, op, payload).await {
                Ok(id) => {
                    tracing::info!(id = ?id, "mutation accepted");
                    MutationOutcome::accepted(id)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "mutation rejected");
                    MutationOutcome::rejected(err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Submit and keep the typed rejection.
    pub async fn try_submit(
        &self,
        kind: EntityKind,
        op: MutationOp,
        payload: FieldBag,
    ) -> Result<Option<DocumentId>, MutationRejected> {
        self.transport.send(kind, op, payload).await
    }
}

impl std::fmt::Debug for MutationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationGateway").finish_non_exhaustive()
    }
}
