//! Shared bearer-token interceptor.
//!
//! Every authenticated call runs through [`TokenRefreshInterceptor::call`].
//! An unauthorized answer triggers at most one silent renewal followed by at
//! most one replay. Concurrent callers rejected with the same token share a
//! single renewal: whoever takes the renewal lock first talks to the backend,
//! the rest pick up the token it stored.
//!
//! A call whose credential was replaced by a logout or a new login while it
//! was in flight is never replayed, and never wipes the newer credential.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::api::PortalApi;
use crate::error::{ApiError, ApiErrorKind};
use crate::store::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForcedLogoutReason {
    MissingRefreshToken,
    RefreshFailed,
    ReplayRejected,
}

impl ForcedLogoutReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::MissingRefreshToken => "missing_refresh_token",
            Self::RefreshFailed => "refresh_failed",
            Self::ReplayRejected => "replay_rejected",
        }
    }
}

/// Renewals performed since the last login. `current` is the access token the
/// latest renewal stored; `superseded` holds every token renewed away on the
/// way there.
#[derive(Debug, Default)]
struct RenewalLineage {
    current: Option<String>,
    superseded: HashSet<String>,
}

impl RenewalLineage {
    fn leads_to(&self, rejected: &str, stored: &str) -> bool {
        self.current.as_deref() == Some(stored) && self.superseded.contains(rejected)
    }

    fn record(&mut self, rejected: &str, renewed: &str) {
        if self.current.as_deref() != Some(rejected) {
            self.superseded.clear();
        }
        self.superseded.insert(rejected.to_string());
        self.current = Some(renewed.to_string());
    }
}

pub struct TokenRefreshInterceptor {
    api: Arc<dyn PortalApi>,
    store: Arc<dyn CredentialStore>,
    renewals: Mutex<RenewalLineage>,
}

impl TokenRefreshInterceptor {
    pub fn new(api: Arc<dyn PortalApi>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            api,
            store,
            renewals: Mutex::new(RenewalLineage::default()),
        }
    }

    #[must_use]
    pub fn api(&self) -> &Arc<dyn PortalApi> {
        &self.api
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Runs `request` with the stored access token attached.
    ///
    /// Only [`ApiErrorKind::Unauthorized`] triggers renewal; every
    /// other error is returned untouched.
    pub async fn call<T, F, Fut>(&self, request: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let Some(access_token) = self.store.get().access_token().map(ToString::to_string) else {
            return Err(ApiError::missing_credential());
        };

        let error = match request(access_token.clone()).await {
            Err(error) if error.kind == ApiErrorKind::Unauthorized => error,
            other => return other,
        };

        tracing::debug!(
            target: "portal.interceptor",
            status = error.status_code,
            "request rejected as unauthorized; attempting renewal",
        );
        let renewed = self.renew(&access_token, error).await?;

        match request(renewed.clone()).await {
            Err(error) if error.kind == ApiErrorKind::Unauthorized => {
                tracing::warn!(
                    target: "portal.interceptor",
                    "replay rejected after renewal; forcing logout",
                );
                self.force_logout(&renewed, ForcedLogoutReason::ReplayRejected);
                Err(error)
            }
            other => other,
        }
    }

    /// Returns a usable access token after `rejected` was refused.
    async fn renew(&self, rejected: &str, cause: ApiError) -> Result<String, ApiError> {
        let mut lineage = self.renewals.lock().await;

        let current = self.store.get();
        match current.access_token() {
            Some(stored) if stored == rejected => {}
            Some(stored) if lineage.leads_to(rejected, stored) => {
                tracing::debug!(
                    target: "portal.interceptor",
                    "joining renewal completed by a concurrent caller",
                );
                return Ok(stored.to_string());
            }
            _ => {
                tracing::debug!(
                    target: "portal.interceptor",
                    "credential replaced while the call was in flight; not replaying",
                );
                return Err(cause);
            }
        }

        let Some(refresh_token) = current.refresh_token().map(ToString::to_string) else {
            tracing::info!(
                target: "portal.interceptor",
                "no refresh token stored; forcing logout",
            );
            self.force_logout(rejected, ForcedLogoutReason::MissingRefreshToken);
            return Err(cause);
        };

        match self.api.refresh_access(&refresh_token).await {
            Ok(response) => {
                let swapped = self
                    .store
                    .swap_access_token(rejected, &response.access, response.refresh)
                    .map_err(|error| {
                        tracing::warn!(
                            target: "portal.interceptor",
                            error = %error,
                            "failed to persist renewed access token",
                        );
                        ApiError::network(format!("failed to persist renewed token: {error}"))
                    })?;
                let Some(next) = swapped else {
                    tracing::debug!(
                        target: "portal.interceptor",
                        "credentials changed during renewal; discarding renewed token",
                    );
                    return Err(cause);
                };
                let renewed = next.access_token().map(ToString::to_string).ok_or_else(|| {
                    ApiError::unauthorized("renewal returned an empty access token")
                })?;
                lineage.record(rejected, &renewed);
                tracing::info!(target: "portal.interceptor", "access token renewed");
                Ok(renewed)
            }
            Err(error) => {
                tracing::warn!(
                    target: "portal.interceptor",
                    status = error.status_code,
                    code = error.code.as_deref().unwrap_or(""),
                    error = %error,
                    "token renewal failed; forcing logout",
                );
                self.force_logout(rejected, ForcedLogoutReason::RefreshFailed);
                Err(ApiError::unauthorized(format!(
                    "session expired: {}",
                    error.message
                )))
            }
        }
    }

    /// Wipes the store unless `expected` was already replaced.
    fn force_logout(&self, expected: &str, reason: ForcedLogoutReason) {
        match self.store.clear_if_current(Some(expected)) {
            Ok(true) => tracing::info!(
                target: "portal.interceptor",
                reason = reason.as_str(),
                "credentials wiped",
            ),
            Ok(false) => tracing::debug!(
                target: "portal.interceptor",
                reason = reason.as_str(),
                "credential already replaced; nothing to wipe",
            ),
            Err(error) => tracing::warn!(
                target: "portal.interceptor",
                error = %error,
                "failed to clear credential store during forced logout",
            ),
        }
    }
}
