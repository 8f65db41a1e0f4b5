pub mod audit;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod http;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rolegate_config::Config;
use rolegate_contracts::{Conversation, InboundMail, ReplyEvent, ReplyReceipt, RoleRequest};
use rolegate_kernel::parse_role_request;
use serde_json::{json, Value};

pub use audit::verify_audit_chain;
pub use engine::{Clock, Collaborators, ConversationEngine, EngineSettings, SystemClock};
pub use error::ConversationError;

use crate::audit::AuditJsonl;
use crate::fetcher::PolicyFetcher;
use crate::http::{HttpDocumentLoader, HttpMailRelay, HttpMembershipService, MailOwnerNotifier};
use crate::store::StoreBackend;

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
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let collaborators = http_collaborators(&cfg)?;
    build_app_with(cfg, collaborators).await
}

pub async fn build_app_with(cfg: Config, collaborators: Collaborators) -> Result<Router, String> {
    let engine = build_engine(&cfg, collaborators).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/role-requests", post(role_requests))
        .route("/v1/inbound-mail", post(inbound_mail))
        .route("/v1/replies", post(replies))
        .route("/v1/conversations/{id}", get(conversation))
        .with_state(AppState { engine }))
}

pub async fn build_engine(
    cfg: &Config,
    collaborators: Collaborators,
) -> Result<ConversationEngine, String> {
    let store = if cfg.store.kind == "sqlite" {
        let sqlite_path = cfg
            .store
            .sqlite_path
            .as_deref()
            .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
        StoreBackend::sqlite(sqlite_path)?
    } else {
        StoreBackend::memory()
    };
    let audit = Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path).await?);

    let engine = ConversationEngine::new(
        EngineSettings::from_config(cfg)?,
        store,
        audit,
        collaborators,
    );
    let resumed = engine.recover().await.map_err(|e| e.to_string())?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed conversations awaiting a reply");
    }
    Ok(engine)
}

fn http_collaborators(cfg: &Config) -> Result<Collaborators, String> {
    let loader = Arc::new(HttpDocumentLoader::new(cfg.policy.timeout_ms)?);
    let mail = Arc::new(HttpMailRelay::new(
        &cfg.mail.relay_endpoint,
        cfg.mail.timeout_ms,
    )?);
    Ok(Collaborators {
        policy: Arc::new(PolicyFetcher::new(
            loader,
            &cfg.policy.url_template,
            cfg.policy.max_redirects,
        )),
        notifier: Arc::new(MailOwnerNotifier::new(
            mail.clone(),
            &cfg.mail.owner_address,
        )),
        mail,
        membership: Arc::new(HttpMembershipService::new(
            &cfg.membership.endpoint,
            cfg.membership.timeout_ms,
        )?),
        clock: Arc::new(SystemClock),
    })
}

#[derive(Clone)]
struct AppState {
    engine: ConversationEngine,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({"error": {"code": code, "message": message.into()}})),
    )
}

fn engine_error(err: ConversationError) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), err.detail())
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn role_requests(
    State(state): State<AppState>,
    Json(request): Json<RoleRequest>,
) -> Result<Json<Conversation>, ApiError> {
    validate_request(&request)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "validation_error", e))?;
    state.engine.start(request).await.map(Json).map_err(engine_error)
}

async fn inbound_mail(
    State(state): State<AppState>,
    Json(mail): Json<InboundMail>,
) -> Result<Json<Conversation>, ApiError> {
    let request = parse_role_request(&mail.message_id, &mail.body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()))?;
    state.engine.start(request).await.map(Json).map_err(engine_error)
}

async fn replies(
    State(state): State<AppState>,
    Json(reply): Json<ReplyEvent>,
) -> Result<Json<ReplyReceipt>, ApiError> {
    if reply.reply_message_id.trim().is_empty() || reply.in_reply_to.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "reply_message_id and in_reply_to are required",
        ));
    }
    state
        .engine
        .deliver_reply(reply)
        .await
        .map(Json)
        .map_err(engine_error)
}

async fn conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    match state.engine.conversation(&id).await.map_err(engine_error)? {
        Some(conv) => Ok(Json(conv)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("conversation {id} not found"),
        )),
    }
}

fn validate_request(r: &RoleRequest) -> Result<(), String> {
    if r.project_name.trim().is_empty()
        || r.role_name.trim().is_empty()
        || r.user_name.trim().is_empty()
        || r.source_message_id.trim().is_empty()
    {
        return Err(
            "project_name, role_name, user_name and source_message_id are required".to_string(),
        );
    }
    Ok(())
}
