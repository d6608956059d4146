use crate::error::ApiError;
use crate::middleware::{auth_middleware, AuthConfig};
use assay_core::Priority;
use assay_orchestrator::{
    AgentDefinition, Callback, Orchestrator, Requirement, Submission, SubmissionReceipt,
    TaskRecord,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware as axum_mw,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Body of `POST /tasks`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_capabilities: Vec<String>,
    pub priority: Priority,
    #[serde(default)]
    pub business_goals: Vec<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub callback_secret: Option<String>,
}

impl CreateTaskRequest {
    /// Validate and convert into a [`Submission`].
    pub fn into_submission(self) -> Result<Submission, ApiError> {
        if self.title.trim().is_empty() && self.description.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "a title or description is required".into(),
            ));
        }
        let callback = match (self.callback_url, self.callback_secret) {
            (Some(url), secret) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ApiError::BadRequest(format!(
                        "callbackUrl must be an http(s) URL, got '{url}'"
                    )));
                }
                Some(Callback { url, secret })
            }
            (None, Some(_)) => {
                return Err(ApiError::BadRequest(
                    "callbackSecret given without callbackUrl".into(),
                ))
            }
            (None, None) => None,
        };
        Ok(Submission {
            requirement: Requirement {
                title: self.title,
                description: self.description,
                target_capabilities: self.target_capabilities,
                priority: self.priority,
                business_goals: self.business_goals,
            },
            callback,
        })
    }
}

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without authentication.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        Self::build_with_auth(orchestrator, AuthConfig::default())
    }

    /// Build the gateway; every route except `/health` requires an API key
    /// when `auth` has keys configured.
    pub fn build_with_auth(orchestrator: Arc<Orchestrator>, auth: AuthConfig) -> Router {
        let state = Arc::new(AppState { orchestrator });

        let api = Router::new()
            .route("/tasks", post(create_task))
            .route("/tasks/{task_id}", get(get_task))
            .route("/workers/{capability}/heartbeat", post(record_heartbeat))
            .route("/agents", get(list_agents));
        let api = if auth.is_enabled() {
            api.route_layer(axum_mw::from_fn_with_state(
                Arc::new(auth),
                auth_middleware,
            ))
        } else {
            api
        };

        Router::new()
            .route("/health", get(health))
            .merge(api)
            .with_state(state)
    }
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<SubmissionReceipt>), ApiError> {
    let submission = body.into_submission()?;
    let receipt = state.orchestrator.submit(submission)?;
    info!(task_id = %receipt.task_id, "Task accepted");
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(state.orchestrator.get_task(task_id)?))
}

async fn record_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(capability): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let received_at = state.orchestrator.record_heartbeat(&capability)?;
    debug!(%capability, "Heartbeat recorded");
    Ok(Json(serde_json::json!({
        "capability": capability,
        "receivedAt": received_at,
    })))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentDefinition>> {
    Json(state.orchestrator.registry().list_all().to_vec())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.orchestrator.health();
    let status = if state.orchestrator.shutdown().is_shutting_down() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}
