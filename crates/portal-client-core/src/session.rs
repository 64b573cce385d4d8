//! Session bootstrapper and owned session store.
//!
//! A [`Session`] is the only writer of session state. Readers subscribe to a
//! `watch` channel of [`SessionSnapshot`]s instead of re-reading persisted
//! storage. Profile fetches are single-flight: callers that arrive while a
//! fetch is running wait for it and receive its outcome.
//!
//! Every fetch and every authenticated action captures the session epoch
//! before suspending. Logout and login bump the epoch, and a completion whose
//! epoch no longer matches is dropped without touching the store or the
//! published snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::api::{LoginRequest, PortalApi, SubscribeEcho};
use crate::auth::{AuthInputError, Credential, normalize_username, require_password};
use crate::entitlements::{EntitlementSet, resolve};
use crate::error::ApiError;
use crate::gate::FeatureGate;
use crate::interceptor::TokenRefreshInterceptor;
use crate::profile::CanonicalProfile;
use crate::store::{CredentialStore, StoreError};

pub const DEFAULT_PROFILE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Loading,
    Authenticated,
    Guest,
    /// Credentials kept, profile served from cache after a transient failure.
    Degraded,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Authenticated => "authenticated",
            Self::Guest => "guest",
            Self::Degraded => "degraded",
        }
    }

    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Authenticated | Self::Guest | Self::Degraded)
    }

    #[must_use]
    pub fn has_identity(self) -> bool {
        matches!(self, Self::Authenticated | Self::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub profile: Option<CanonicalProfile>,
    pub entitlements: EntitlementSet,
    /// Failure behind a DEGRADED state, kept so callers can offer a retry.
    pub last_error: Option<ApiError>,
    pub epoch: u64,
}

impl SessionSnapshot {
    fn uninitialized() -> Self {
        Self {
            state: SessionState::Uninitialized,
            profile: None,
            entitlements: resolve(None),
            last_error: None,
            epoch: 0,
        }
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.entitlements.is_admin
    }

    #[must_use]
    pub fn current_plan_slug(&self) -> &str {
        &self.entitlements.subscription.slug
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub profile_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile_timeout: DEFAULT_PROFILE_TIMEOUT,
        }
    }
}

/// Last profile fetch that ran to completion.
#[derive(Debug, Clone, Copy)]
struct CompletedFetch {
    seq: u64,
    epoch: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Input(#[from] AuthInputError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    #[must_use]
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(error) => Some(error),
            Self::Input(_) | Self::Store(_) => None,
        }
    }
}

pub struct Session {
    interceptor: Arc<TokenRefreshInterceptor>,
    store: Arc<dyn CredentialStore>,
    config: SessionConfig,
    snapshot: watch::Sender<SessionSnapshot>,
    fetch_lock: tokio::sync::Mutex<Option<CompletedFetch>>,
    fetch_starts: AtomicU64,
    fetch_completions: AtomicU64,
    /// Session epoch. Held while checking liveness and writing results.
    epoch: Mutex<u64>,
}

impl Session {
    pub fn new(api: Arc<dyn PortalApi>, store: Arc<dyn CredentialStore>) -> Self {
        Self::with_config(api, store, SessionConfig::default())
    }

    pub fn with_config(
        api: Arc<dyn PortalApi>,
        store: Arc<dyn CredentialStore>,
        config: SessionConfig,
    ) -> Self {
        let interceptor = Arc::new(TokenRefreshInterceptor::new(api, store.clone()));
        Self::from_interceptor(interceptor, config)
    }

    pub fn from_interceptor(
        interceptor: Arc<TokenRefreshInterceptor>,
        config: SessionConfig,
    ) -> Self {
        let store = interceptor.store().clone();
        let (snapshot, _) = watch::channel(SessionSnapshot::uninitialized());
        Self {
            interceptor,
            store,
            config,
            snapshot,
            fetch_lock: tokio::sync::Mutex::new(None),
            fetch_starts: AtomicU64::new(0),
            fetch_completions: AtomicU64::new(0),
            epoch: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn interceptor(&self) -> &Arc<TokenRefreshInterceptor> {
        &self.interceptor
    }

    #[must_use]
    pub fn api(&self) -> &Arc<dyn PortalApi> {
        self.interceptor.api()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn feature_gate(&self) -> FeatureGate {
        FeatureGate::new(self.subscribe())
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn current_plan_slug(&self) -> String {
        self.snapshot.borrow().current_plan_slug().to_string()
    }

    /// First bootstrap. Later calls return the resolved snapshot without
    /// fetching again.
    pub async fn start(&self) -> SessionSnapshot {
        self.refresh(false).await
    }

    /// Re-bootstraps from the stored credential.
    ///
    /// Without `force`, an already resolved session is returned as-is. A call
    /// that has to wait for an in-flight fetch returns that fetch's outcome
    /// instead of issuing another request.
    pub async fn refresh(&self, force: bool) -> SessionSnapshot {
        let floor = self.fetch_completions.load(Ordering::Acquire);
        if !force && self.snapshot.borrow().state.is_resolved() {
            return self.snapshot();
        }
        self.fetch_after(floor).await
    }

    /// Re-bootstraps after a write the profile must reflect. Only a fetch
    /// that started after this call is shared.
    pub async fn refresh_after_write(&self) -> SessionSnapshot {
        let floor = self.fetch_starts.load(Ordering::Acquire);
        self.fetch_after(floor).await
    }

    /// Fetches the profile unless a fetch numbered above `floor` already
    /// completed in the current epoch.
    async fn fetch_after(&self, floor: u64) -> SessionSnapshot {
        let mut last = self.fetch_lock.lock().await;
        let epoch = self.epoch();
        if let Some(done) = *last
            && done.seq > floor
            && done.epoch == epoch
        {
            tracing::debug!(target: "portal.session", seq = done.seq, "joined profile fetch");
            return self.snapshot();
        }

        let seq = self.fetch_starts.fetch_add(1, Ordering::AcqRel) + 1;
        self.fetch_profile(epoch).await;
        *last = Some(CompletedFetch { seq, epoch });
        self.fetch_completions.store(seq, Ordering::Release);
        self.snapshot()
    }

    async fn fetch_profile(&self, epoch: u64) {
        if self.store.get().access_token().is_none() {
            let guard = self.lock_epoch();
            if *guard == epoch {
                tracing::info!(target: "portal.session", "no stored access token; session is guest");
                self.publish(&guard, SessionState::Guest, None, None);
            }
            return;
        }

        {
            let guard = self.lock_epoch();
            let state = self.snapshot.borrow().state;
            if *guard == epoch && !state.has_identity() {
                let profile = self.snapshot.borrow().profile.clone();
                self.publish(&guard, SessionState::Loading, profile, None);
            }
        }

        let api = self.api().clone();
        let fetch = self.interceptor.call(|token| {
            let api = api.clone();
            async move { api.fetch_profile(&token).await }
        });
        let result = match tokio::time::timeout(self.config.profile_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::timeout(format!(
                "profile fetch exceeded {} ms",
                self.config.profile_timeout.as_millis()
            ))),
        };

        let guard = self.lock_epoch();
        if *guard != epoch {
            tracing::debug!(
                target: "portal.session",
                started_epoch = epoch,
                current_epoch = *guard,
                "discarding stale profile fetch completion",
            );
            return;
        }

        match result {
            Ok(profile) => {
                if let Err(error) = self.store.set_cached_profile(Some(profile.clone())) {
                    tracing::warn!(
                        target: "portal.session",
                        error = %error,
                        "failed to cache profile snapshot",
                    );
                }
                tracing::info!(
                    target: "portal.session",
                    username = profile.username.as_deref().unwrap_or(""),
                    "profile fetched; session authenticated",
                );
                self.publish(&guard, SessionState::Authenticated, Some(profile), None);
            }
            Err(error) if error.is_session_fatal() => {
                tracing::info!(
                    target: "portal.session",
                    error = %error,
                    "credential rejected; session is guest",
                );
                self.wipe(&guard);
            }
            Err(error) => {
                let cached = self
                    .store
                    .cached_profile()
                    .or_else(|| self.snapshot.borrow().profile.clone());
                tracing::warn!(
                    target: "portal.session",
                    status = error.status_code,
                    code = error.code.as_deref().unwrap_or(""),
                    error = %error,
                    has_cached_profile = cached.is_some(),
                    "profile fetch failed; serving cached profile",
                );
                self.publish(&guard, SessionState::Degraded, cached, Some(error));
            }
        }
    }

    /// Logs in, stores the credential and basic user snapshot, then
    /// re-bootstraps from the backend.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SessionSnapshot, SessionError> {
        let request = LoginRequest {
            username: normalize_username(username)?,
            password: require_password(password)?.to_string(),
        };
        let response = self.api().login(&request).await.map_err(|error| {
            tracing::info!(
                target: "portal.session",
                status = error.status_code,
                error = %error,
                "login rejected",
            );
            error
        })?;

        {
            let mut guard = self.lock_epoch();
            *guard += 1;
            self.store
                .set(Credential::new(response.access.as_str(), response.refresh.clone()))?;
            self.store.set_cached_profile(Some(response.user.clone()))?;
        }
        tracing::info!(target: "portal.session", username = %request.username, "login accepted");

        Ok(self.refresh(true).await)
    }

    /// Ends the session locally, then tells the backend on a best-effort basis.
    pub async fn logout(&self) -> SessionSnapshot {
        let access_token = self.store.get().access_token().map(ToString::to_string);
        {
            let mut guard = self.lock_epoch();
            *guard += 1;
            self.wipe(&guard);
        }
        if let Some(access_token) = access_token
            && let Err(error) = self.api().logout(&access_token).await
        {
            tracing::debug!(
                target: "portal.session",
                error = %error,
                "backend logout failed; local session already cleared",
            );
        }
        tracing::info!(target: "portal.session", "logged out");
        self.snapshot()
    }

    /// Applies an error returned by an authenticated call started in `epoch`.
    /// Session-fatal errors end that session; everything else, and any error
    /// from an earlier epoch, leaves state untouched.
    pub fn observe_api_error(&self, epoch: u64, error: &ApiError) {
        if !error.is_session_fatal() {
            return;
        }
        let mut guard = self.lock_epoch();
        if *guard != epoch {
            tracing::debug!(
                target: "portal.session",
                started_epoch = epoch,
                current_epoch = *guard,
                error = %error,
                "ignoring rejection from an earlier session",
            );
            return;
        }
        *guard += 1;
        tracing::info!(
            target: "portal.session",
            error = %error,
            "authenticated call rejected; session is guest",
        );
        self.wipe(&guard);
    }

    /// Folds a subscribe echo into the current profile: an echoed user
    /// replaces it, an echoed subscription is merged into it.
    pub fn apply_subscribe_echo(&self, echo: &SubscribeEcho) {
        let guard = self.lock_epoch();
        let snapshot = self.snapshot.borrow().clone();
        if !snapshot.state.has_identity() {
            return;
        }
        let profile = match (&echo.user, &echo.subscription) {
            (Some(user), _) => user.clone(),
            (None, Some(subscription)) => {
                let mut profile = snapshot.profile.clone().unwrap_or_default();
                profile.merge_subscription(subscription.clone());
                profile
            }
            (None, None) => return,
        };
        if let Err(error) = self.store.set_cached_profile(Some(profile.clone())) {
            tracing::warn!(
                target: "portal.session",
                error = %error,
                "failed to cache echoed profile",
            );
        }
        self.publish(&guard, snapshot.state, Some(profile), snapshot.last_error);
    }

    /// Current session epoch. Capture it before an authenticated call and
    /// hand it back to [`Session::observe_api_error`].
    #[must_use]
    pub fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wipe(&self, epoch: &MutexGuard<'_, u64>) {
        if let Err(error) = self.store.clear() {
            tracing::warn!(
                target: "portal.session",
                error = %error,
                "failed to clear credential store",
            );
        }
        self.publish(epoch, SessionState::Guest, None, None);
    }

    fn publish(
        &self,
        epoch: &MutexGuard<'_, u64>,
        state: SessionState,
        profile: Option<CanonicalProfile>,
        last_error: Option<ApiError>,
    ) {
        let entitlements = resolve(profile.as_ref());
        let previous = self.snapshot.send_replace(SessionSnapshot {
            state,
            profile,
            entitlements,
            last_error,
            epoch: **epoch,
        });
        if previous.state != state {
            tracing::debug!(
                target: "portal.session",
                from = previous.state.as_str(),
                to = state.as_str(),
                "session state changed",
            );
        }
    }
}
