#![allow(clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portal_api_client::{PortalHttpClient, PortalHttpClientConfig};
use portal_client_core::api::PortalApi;
use portal_client_core::auth::Credential;
use portal_client_core::error::ApiErrorKind;
use portal_client_core::gate::{AI_UPGRADE_MESSAGE, Feature, GateDecision};
use portal_client_core::profile::CanonicalProfile;
use portal_client_core::session::{Session, SessionConfig, SessionState};
use portal_client_core::store::{CredentialStore, MemoryCredentialStore};
use portal_client_core::{Gated, PaymentDetails};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinSet;

const PASSWORD: &str = "correct-horse";
const REFRESH_TOKEN: &str = "refresh-alice";

#[derive(Default)]
struct Backend {
    valid_tokens: HashSet<String>,
    issued: usize,
    plan: Option<&'static str>,
    /// Makes the AI proxy refuse regardless of plan.
    ai_blocked: bool,
    profile_delay: Option<Duration>,
}

#[derive(Clone, Default)]
struct StubState {
    backend: Arc<Mutex<Backend>>,
    refreshes: Arc<AtomicUsize>,
    chats: Arc<AtomicUsize>,
}

struct StubHandle {
    base_url: String,
    state: StubState,
    shutdown: oneshot::Sender<()>,
}

async fn start_stub_backend(state: StubState) -> Result<StubHandle> {
    let router = Router::new()
        .route("/api/auth/login/", post(login))
        .route("/api/auth/token/refresh/", post(refresh))
        .route("/api/auth/logout/", post(logout))
        .route("/api/auth/profile/", get(profile))
        .route("/api/addresses/check/", get(address_check))
        .route("/api/plans/", get(plans))
        .route("/api/subscribe/", post(subscribe))
        .route("/api/ai/free-chat/", post(free_chat))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind stub listener")?;
    let addr = listener.local_addr().context("stub local_addr")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = server.await {
            tracing::error!(error = %err, "stub backend failed");
        }
    });

    Ok(StubHandle {
        base_url: format!("http://{addr}"),
        state,
        shutdown: shutdown_tx,
    })
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.trim().to_string())
}

async fn authorized(state: &StubState, headers: &HeaderMap) -> bool {
    let backend = state.backend.lock().await;
    bearer(headers).is_some_and(|token| backend.valid_tokens.contains(&token))
}

fn token_rejected() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "code": "token_not_valid",
            "detail": "Given token not valid for any token type"
        })),
    )
        .into_response()
}

fn subscription_row(plan: Option<&str>) -> Value {
    match plan {
        Some("enterprise") => json!({
            "plan": {"slug": "enterprise", "name": "Enterprise", "can_use_ai": true},
            "status": "active",
            "features": {"can_edit_profile": "true", "can_change_password": "true"}
        }),
        _ => json!({
            "plan": {"slug": "free", "name": "Free", "can_use_ai": false},
            "status": "active",
            "features": {"can_edit_profile": "false", "can_change_password": "true"}
        }),
    }
}

async fn login(State(state): State<StubState>, Json(body): Json<Value>) -> Response {
    if body.get("password").and_then(Value::as_str) != Some(PASSWORD) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
            .into_response();
    }
    let mut backend = state.backend.lock().await;
    backend.issued += 1;
    let access = format!("access-{}", backend.issued);
    backend.valid_tokens.insert(access.clone());
    Json(json!({
        "access": access,
        "refresh": REFRESH_TOKEN,
        "username": body.get("username").cloned().unwrap_or(Value::Null),
        "role_id": 2,
        "is_admin": false,
        "permissions": []
    }))
    .into_response()
}

async fn refresh(State(state): State<StubState>, Json(body): Json<Value>) -> Response {
    state.refreshes.fetch_add(1, Ordering::SeqCst);
    // Long enough for concurrent callers to pile up behind the renewal.
    tokio::time::sleep(Duration::from_millis(50)).await;
    if body.get("refresh").and_then(Value::as_str) != Some(REFRESH_TOKEN) {
        return token_rejected();
    }
    let mut backend = state.backend.lock().await;
    backend.issued += 1;
    let access = format!("access-{}", backend.issued);
    backend.valid_tokens.insert(access.clone());
    Json(json!({"access": access})).into_response()
}

async fn logout(State(state): State<StubState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers).await {
        return token_rejected();
    }
    Json(json!({"code": "IG002"})).into_response()
}

async fn profile(State(state): State<StubState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers).await {
        return token_rejected();
    }
    let (delay, plan) = {
        let backend = state.backend.lock().await;
        (backend.profile_delay, backend.plan)
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    Json(json!({
        "username": "alice",
        "email": "alice@example.com",
        "role_id": 2,
        "is_admin": false,
        "permissions": [],
        "subscription": subscription_row(plan)
    }))
    .into_response()
}

async fn address_check(State(state): State<StubState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers).await {
        return token_rejected();
    }
    Json(json!({"has_address": true})).into_response()
}

async fn plans() -> Response {
    Json(json!({
        "count": 2,
        "results": [
            {"slug": "free", "name": "Free", "price_cents": 0, "can_use_ai": false},
            {"slug": "enterprise", "name": "Enterprise", "price_cents": 299_900, "can_use_ai": true}
        ]
    }))
    .into_response()
}

async fn subscribe(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers).await {
        return token_rejected();
    }
    if body.get("plan_slug").and_then(Value::as_str) != Some("enterprise") {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Plan not found"}))).into_response();
    }
    state.backend.lock().await.plan = Some("enterprise");
    (StatusCode::CREATED, Json(subscription_row(Some("enterprise")))).into_response()
}

async fn free_chat(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers).await {
        return token_rejected();
    }
    state.chats.fetch_add(1, Ordering::SeqCst);
    let backend = state.backend.lock().await;
    if backend.ai_blocked || backend.plan != Some("enterprise") {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "code": "NO_AI_ACCESS",
                "detail": "Your plan does not include AI chat."
            })),
        )
            .into_response();
    }
    let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or_default();
    Json(json!({"response": format!("echo: {prompt}")})).into_response()
}

fn http_client(base_url: &str) -> Arc<PortalHttpClient> {
    Arc::new(PortalHttpClient::from_base_url(base_url).expect("http client"))
}

#[tokio::test]
async fn enterprise_subscription_unlocks_ai_end_to_end() -> Result<()> {
    let stub = start_stub_backend(StubState::default()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = Session::new(http_client(&stub.base_url), store.clone());

    assert_eq!(session.start().await.state, SessionState::Guest);

    let snapshot = session.login("alice", PASSWORD).await?;
    assert_eq!(snapshot.state, SessionState::Authenticated);
    assert_eq!(snapshot.current_plan_slug(), "free");
    assert!(!snapshot.entitlements.can_use_ai);

    let denied = session.send_ai_prompt("hello").await?;
    assert_eq!(
        denied,
        Gated::Denied(GateDecision::UpgradeRequired {
            capability: portal_client_core::entitlements::Capability::UseAi,
            message: AI_UPGRADE_MESSAGE.to_string(),
        })
    );
    assert_eq!(stub.state.chats.load(Ordering::SeqCst), 0);

    let plans = session.list_plans().await?;
    let enterprise = plans
        .iter()
        .find(|plan| plan.slug == "enterprise")
        .context("enterprise plan listed")?;
    assert!(enterprise.capabilities().can_use_ai);

    let mut gate = session.feature_gate();
    let upgraded = session
        .subscribe_to_plan("Enterprise", PaymentDetails::default())
        .await?;
    assert_eq!(upgraded.state, SessionState::Authenticated);
    assert_eq!(upgraded.current_plan_slug(), "enterprise");
    assert!(upgraded.entitlements.can_use_ai);
    assert!(upgraded.entitlements.can_edit_profile);
    assert_eq!(gate.changed(&Feature::AiChat).await, Some(GateDecision::Allow));

    let reply = session
        .send_ai_prompt("hello")
        .await?
        .allowed()
        .context("ai reply")?;
    assert_eq!(reply.text, "echo: hello");

    let logged_out = session.logout().await;
    assert_eq!(logged_out.state, SessionState::Guest);
    assert!(store.get().is_empty());

    let _ = stub.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn concurrent_unauthorized_calls_share_one_refresh() -> Result<()> {
    let stub = start_stub_backend(StubState::default()).await?;
    let api = http_client(&stub.base_url);
    let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new(
        "expired-access",
        Some(REFRESH_TOKEN.to_string()),
    )));
    let session = Session::new(api.clone(), store.clone());
    let interceptor = session.interceptor().clone();

    let mut calls = JoinSet::new();
    for _ in 0..8 {
        let interceptor = interceptor.clone();
        let api = api.clone();
        calls.spawn(async move {
            interceptor
                .call(|token| {
                    let api = api.clone();
                    async move { api.check_address(&token).await }
                })
                .await
        });
    }
    while let Some(outcome) = calls.join_next().await {
        let check = outcome.context("join call")??;
        assert!(check.has_address);
    }

    assert_eq!(stub.state.refreshes.load(Ordering::SeqCst), 1);
    let stored = store.get();
    assert_eq!(stored.access_token(), Some("access-1"));
    assert_eq!(stored.refresh_token(), Some(REFRESH_TOKEN));

    let _ = stub.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn backend_ai_refusal_becomes_upgrade_denial() -> Result<()> {
    let state = StubState::default();
    state.backend.lock().await.ai_blocked = true;
    let stub = start_stub_backend(state).await?;
    let session = Session::new(
        http_client(&stub.base_url),
        Arc::new(MemoryCredentialStore::new()),
    );

    session.login("alice", PASSWORD).await?;
    session
        .subscribe_to_plan("enterprise", PaymentDetails::default())
        .await?;
    assert!(session.snapshot().entitlements.can_use_ai);

    let outcome = session.send_ai_prompt("summarize my week").await?;
    assert_eq!(
        outcome,
        Gated::Denied(GateDecision::UpgradeRequired {
            capability: portal_client_core::entitlements::Capability::UseAi,
            message: "Your plan does not include AI chat.".to_string(),
        })
    );
    // One refusal, one re-fetch, one retry.
    assert_eq!(stub.state.chats.load(Ordering::SeqCst), 2);
    assert_eq!(session.snapshot().state, SessionState::Authenticated);

    let _ = stub.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn slow_profile_degrades_to_cached_snapshot() -> Result<()> {
    let state = StubState::default();
    {
        let mut backend = state.backend.lock().await;
        backend.valid_tokens.insert("access-cached".to_string());
        backend.profile_delay = Some(Duration::from_secs(2));
    }
    let stub = start_stub_backend(state).await?;

    let mut config = PortalHttpClientConfig::new(stub.base_url.as_str());
    config.profile_timeout_ms = 300;
    let api = Arc::new(PortalHttpClient::new(config)?);

    let cached = CanonicalProfile::from_json(json!({
        "username": "alice",
        "role_id": 2,
        "subscription": {"slug": "enterprise"}
    }))?;
    let store = Arc::new(
        MemoryCredentialStore::with_credential(Credential::new(
            "access-cached",
            Some(REFRESH_TOKEN.to_string()),
        ))
        .with_cached_profile(cached.clone()),
    );
    let session = Session::with_config(
        api,
        store.clone(),
        SessionConfig {
            profile_timeout: Duration::from_secs(5),
        },
    );

    let snapshot = session.start().await;
    assert_eq!(snapshot.state, SessionState::Degraded);
    assert_eq!(snapshot.profile, Some(cached));
    assert!(snapshot.entitlements.can_use_ai);
    let error = snapshot.last_error.context("degraded error")?;
    assert_eq!(error.kind, ApiErrorKind::Timeout);
    assert_eq!(store.get().access_token(), Some("access-cached"));

    let _ = stub.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn rejected_refresh_token_ends_the_session() -> Result<()> {
    let stub = start_stub_backend(StubState::default()).await?;
    let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new(
        "expired-access",
        Some("revoked-refresh".to_string()),
    )));
    let session = Session::new(http_client(&stub.base_url), store.clone());

    let snapshot = session.start().await;
    assert_eq!(snapshot.state, SessionState::Guest);
    assert!(store.get().is_empty());
    assert_eq!(stub.state.refreshes.load(Ordering::SeqCst), 1);

    let _ = stub.shutdown.send(());
    Ok(())
}
