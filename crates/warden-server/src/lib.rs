mod collab;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use warden_config::Config;
use warden_contracts::{Medium, Request, Response};
use warden_engine::{
    Collaborators, Engine, EngineError, EngineSettings, JsonlAuditLog, SessionRegistry,
    SystemClock,
};

pub use collab::{
    ConfigPolicy, EnvSecretStore, HttpTransport, MemoryKnownHosts, MemorySessionRegistry,
    PendingAuthorization, SoftwareSigner, TracingTelemetry,
};
pub use warden_engine::verify_audit_chain;

type ApiError = (StatusCode, Json<Value>);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await
        }
    }
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/requests", post(requests))
        .route(
            "/v1/sessions/{session_id}/responses/{request_id}",
            get(cached_response),
        )
        .route("/v1/approvals", get(list_approvals))
        .route(
            "/v1/approvals/{session_id}/{request_id}",
            post(resolve_approval).delete(cancel_approval),
        )
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    sessions: Arc<MemorySessionRegistry>,
    policy: Arc<ConfigPolicy>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let sessions = Arc::new(MemorySessionRegistry::from_config(&cfg.sessions));
        let policy = Arc::new(ConfigPolicy::new(cfg.policy.auto_approve.clone()));
        let audit =
            JsonlAuditLog::open(&cfg.audit.jsonl_path, cfg.audit.sqlite_path.as_deref()).await?;

        let collab = Collaborators {
            sessions: sessions.clone(),
            transport: Arc::new(HttpTransport::new(&cfg.sessions)?),
            policy: policy.clone(),
            signer: Arc::new(SoftwareSigner::from_config(&cfg.identity)?),
            known_hosts: Arc::new(MemoryKnownHosts::default()),
            audit: Arc::new(audit),
            telemetry: Arc::new(TracingTelemetry::new()),
            secrets: Arc::new(EnvSecretStore),
            clock: Arc::new(SystemClock),
        };
        let engine = Engine::new(
            collab,
            EngineSettings {
                request_time_tolerance_secs: cfg.engine.request_time_tolerance_secs,
                endpoint_secret_key: cfg.routing.endpoint_secret.clone(),
            },
        );
        info!(
            sessions = cfg.sessions.len(),
            tolerance_secs = cfg.engine.request_time_tolerance_secs,
            "engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            sessions,
            policy,
        })
    }

    /// Keeps the prompt listing in step with the engine's pending table.
    fn prune_prompts(&self) {
        self.policy
            .retain_live(|session_id, request_id| self.engine.is_pending(session_id, request_id));
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitRequest {
    session_id: String,
    request: Request,
}

async fn requests(
    State(state): State<AppState>,
    Json(input): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let session = state
        .sessions
        .get(&input.session_id)
        .ok_or_else(|| engine_error(EngineError::SessionRemoved))?;
    state
        .engine
        .handle(&input.request, &session, Medium::Http, None)
        .await
        .map_err(engine_error)?;
    state.prune_prompts();

    let status = if state.engine.is_pending(&session.id, &input.request.id) {
        "awaiting_approval"
    } else {
        "answered"
    };
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": status }))))
}

async fn cached_response(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<Json<Response>, ApiError> {
    state
        .engine
        .cached_response(&session_id, &request_id)
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "response_not_found",
                "no cached response for this request",
            )
        })
}

async fn list_approvals(State(state): State<AppState>) -> Json<Vec<PendingAuthorization>> {
    state.prune_prompts();
    Json(state.policy.pending())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Decision {
    allowed: bool,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
    Json(decision): Json<Decision>,
) -> Result<Json<Value>, ApiError> {
    let pending = state
        .policy
        .pending_request(&session_id, &request_id)
        .ok_or_else(|| engine_error(EngineError::NotPending))?;

    let result = state
        .engine
        .resolve_approval(
            &pending.request,
            &pending.session,
            decision.allowed,
            Medium::Http,
        )
        .await;
    // The prompt is answered either way; a failed build is not retried from here.
    state.policy.forget(&session_id, &request_id);
    result.map_err(engine_error)?;

    let status = if decision.allowed {
        "approved"
    } else {
        "rejected"
    };
    Ok(Json(json!({ "status": status })))
}

async fn cancel_approval(
    State(state): State<AppState>,
    Path((session_id, request_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if !state.policy.forget(&session_id, &request_id) {
        return Err(engine_error(EngineError::NotPending));
    }
    state.engine.remove_pending(&session_id, &request_id).await;
    Ok(StatusCode::NO_CONTENT)
}

fn engine_error(err: EngineError) -> ApiError {
    let status = match err {
        EngineError::SessionRemoved => StatusCode::GONE,
        EngineError::InvalidRequestTime => StatusCode::BAD_REQUEST,
        EngineError::RequestPending => StatusCode::CONFLICT,
        EngineError::KeyDoesNotExist | EngineError::NotPending => StatusCode::NOT_FOUND,
        EngineError::ResponseNotNeeded | EngineError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, err.code(), &err.to_string())
}

fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
}
