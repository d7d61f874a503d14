//! Loopback HTTP surface. Every handler is a thin shim over [`EngineHandle`];
//! responses use the `{ ok, data }` / `{ ok: false, error }` envelopes.

use crate::engine::EngineHandle;
use crate::error::PolicyError;
use crate::model::{PolicyExport, Rule, RuleDraft};
use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

#[derive(Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct SaveSettingsRequest {
    settings: Value,
    #[serde(default)]
    pin: Option<String>,
}

#[derive(Deserialize)]
struct UrlRequest {
    url: String,
}

#[derive(Deserialize)]
struct TemporaryAllowRequest {
    rid: String,
    #[serde(default = "blank_page")]
    url: String,
}

fn blank_page() -> String {
    "about:blank".to_string()
}

#[derive(Deserialize)]
struct OverrideRequest {
    hostname: String,
    minutes: i64,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPinRequest {
    pin: String,
    #[serde(default)]
    current_pin: Option<String>,
}

#[derive(Deserialize)]
struct ImportRequest {
    policy: PolicyExport,
    #[serde(default)]
    pin: Option<String>,
}

#[derive(Serialize)]
struct MatchResult {
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule: Option<Rule>,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

pub fn build_router(engine: EngineHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route(
            "/settings",
            get(get_settings).post(post_settings).options(options_ok),
        )
        .route("/settings/enabled", post(post_enabled).options(options_ok))
        .route("/rules", post(post_rule).options(options_ok))
        .route("/rules/update", post(post_rule_update).options(options_ok))
        .route("/rules/test", post(post_rule_test).options(options_ok))
        .route(
            "/rules/temporary_allow",
            post(post_temporary_allow).options(options_ok),
        )
        .route(
            "/rules/current_site",
            post(post_current_site).options(options_ok),
        )
        .route("/rules/:id", delete(delete_rule).options(options_ok))
        .route("/overrides", post(post_override).options(options_ok))
        .route("/pin", post(post_pin).options(options_ok))
        .route("/policy/export", get(get_policy_export))
        .route("/policy/import", post(post_policy_import).options(options_ok))
        .route("/directives", get(get_directives))
        .route("/navigate", post(post_navigate).options(options_ok))
        .route("/reconcile", post(post_reconcile).options(options_ok))
        .with_state(AppState { engine })
        .layer(cors)
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(OkResponse::<Value> { ok: true, data: None }).into_response()
}

fn fail(op: &str, err: PolicyError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!("{op} failed: {err}");
    } else {
        warn!("{op} rejected: {err}");
    }
    (
        status,
        Json(ErrResponse {
            ok: false,
            error: err.code(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(op: &str, result: crate::error::Result<T>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(err) => fail(op, err),
    }
}

fn respond_empty(op: &str, result: crate::error::Result<()>) -> Response {
    match result {
        Ok(()) => ok_empty(),
        Err(err) => fail(op, err),
    }
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "policy_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn get_settings(State(state): State<AppState>) -> Response {
    respond("get_settings", state.engine.get_settings().await)
}

async fn post_settings(
    State(state): State<AppState>,
    Json(req): Json<SaveSettingsRequest>,
) -> Response {
    respond_empty(
        "save_settings",
        state.engine.save_settings(req.settings, req.pin).await,
    )
}

async fn post_enabled(State(state): State<AppState>, Json(req): Json<SetEnabledRequest>) -> Response {
    respond_empty("set_enabled", state.engine.set_enabled(req.enabled).await)
}

async fn post_rule(State(state): State<AppState>, Json(rule): Json<RuleDraft>) -> Response {
    respond("add_rule", state.engine.add_rule(rule).await)
}

async fn post_rule_update(State(state): State<AppState>, Json(rule): Json<Value>) -> Response {
    respond("update_rule", state.engine.update_rule(rule).await)
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond_empty("remove_rule", state.engine.remove_rule(id).await)
}

async fn post_rule_test(State(state): State<AppState>, Json(req): Json<UrlRequest>) -> Response {
    let result = state.engine.test_match(req.url).await.map(|rule| MatchResult {
        matched: rule.is_some(),
        rule,
    });
    respond("test_match", result)
}

async fn post_temporary_allow(
    State(state): State<AppState>,
    Json(req): Json<TemporaryAllowRequest>,
) -> Response {
    respond(
        "temporary_allow",
        state.engine.temporary_allow(req.rid, req.url).await,
    )
}

async fn post_current_site(State(state): State<AppState>, Json(req): Json<UrlRequest>) -> Response {
    respond("add_current_site", state.engine.add_current_site(req.url).await)
}

async fn post_override(State(state): State<AppState>, Json(req): Json<OverrideRequest>) -> Response {
    respond(
        "override_hostname",
        state
            .engine
            .override_hostname(req.hostname, req.minutes, req.url)
            .await,
    )
}

async fn post_pin(State(state): State<AppState>, Json(req): Json<SetPinRequest>) -> Response {
    respond_empty("set_pin", state.engine.set_pin(req.pin, req.current_pin).await)
}

async fn get_policy_export(State(state): State<AppState>) -> Response {
    respond("export_policy", state.engine.export_policy().await)
}

async fn post_policy_import(State(state): State<AppState>, Json(req): Json<ImportRequest>) -> Response {
    respond_empty(
        "import_policy",
        state.engine.import_policy(req.policy, req.pin).await,
    )
}

async fn get_directives(State(state): State<AppState>) -> Response {
    respond("directives", state.engine.directives().await)
}

async fn post_navigate(State(state): State<AppState>, Json(req): Json<UrlRequest>) -> Response {
    respond("navigate", state.engine.navigate(req.url).await)
}

async fn post_reconcile(State(state): State<AppState>) -> Response {
    respond("reconcile", state.engine.reconcile("manual").await)
}
