#![cfg_attr(test, allow(clippy::expect_used))]

use std::time::Duration;

use async_trait::async_trait;
use portal_client_core::api::{
    AddressCheck, AiChatRequest, ChangePasswordRequest, LoginRequest, LoginResponse,
    PasswordResetRequest, PermissionCheck, PlanRecord, PortalApi, RAW_REPLY_LIMIT,
    SubscribeEcho, SubscribeRequest, TokenRefreshResponse, VerifyOtpRequest, message_from_body,
};
use portal_client_core::auth::{AuthInputError, normalize_base_url, resolve_api_base_url};
use portal_client_core::error::ApiError;
use portal_client_core::profile::CanonicalProfile;
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 7_000;
pub const DEFAULT_PROFILE_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_CHAT_TIMEOUT_MS: u64 = 30_000;
const MIN_TIMEOUT_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("portal base url rejected: {0}")]
    BaseUrl(#[from] AuthInputError),
    #[error("failed to build http client: {message}")]
    Build { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalHttpClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub profile_timeout_ms: u64,
    /// The AI proxy waits on an upstream model, so it gets its own budget.
    pub chat_timeout_ms: u64,
    /// Attempts for idempotent reads. Writes are sent once.
    pub request_attempts: u32,
}

impl PortalHttpClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            profile_timeout_ms: DEFAULT_PROFILE_TIMEOUT_MS,
            chat_timeout_ms: DEFAULT_CHAT_TIMEOUT_MS,
            request_attempts: 1,
        }
    }

    /// Base URL from `PORTAL_API_BASE_URL`, then `VITE_API_BASE_URL`, then
    /// the local default.
    pub fn from_env() -> Result<Self, HttpClientError> {
        let (base_url, source) = resolve_api_base_url()?;
        tracing::debug!(target: "portal.http", %base_url, source, "resolved api base url");
        Ok(Self::new(base_url))
    }
}

#[derive(Debug, Clone)]
pub struct PortalHttpClient {
    base_url: String,
    timeout: Duration,
    profile_timeout: Duration,
    chat_timeout: Duration,
    request_attempts: u32,
    http: reqwest::Client,
}

impl PortalHttpClient {
    pub fn new(config: PortalHttpClientConfig) -> Result<Self, HttpClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| HttpClientError::Build {
                message: error.to_string(),
            })?;
        Ok(Self {
            base_url,
            timeout: clamp_timeout(config.timeout_ms),
            profile_timeout: clamp_timeout(config.profile_timeout_ms),
            chat_timeout: clamp_timeout(config.chat_timeout_ms),
            request_attempts: config.request_attempts.max(1),
            http,
        })
    }

    pub fn from_base_url(base_url: &str) -> Result<Self, HttpClientError> {
        Self::new(PortalHttpClientConfig::new(base_url))
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn login_path() -> &'static str {
        "/api/auth/login/"
    }

    #[must_use]
    pub fn token_refresh_path() -> &'static str {
        "/api/auth/token/refresh/"
    }

    #[must_use]
    pub fn logout_path() -> &'static str {
        "/api/auth/logout/"
    }

    #[must_use]
    pub fn profile_path() -> &'static str {
        "/api/auth/profile/"
    }

    #[must_use]
    pub fn address_check_path() -> &'static str {
        "/api/addresses/check/"
    }

    #[must_use]
    pub fn plans_path() -> &'static str {
        "/api/plans/"
    }

    #[must_use]
    pub fn subscribe_path() -> &'static str {
        "/api/subscribe/"
    }

    #[must_use]
    pub fn ai_chat_path() -> &'static str {
        "/api/ai/free-chat/"
    }

    #[must_use]
    pub fn has_permission_path() -> &'static str {
        "/api/permissions/has_permission/"
    }

    #[must_use]
    pub fn change_password_path() -> &'static str {
        "/api/change-password/change-password/"
    }

    #[must_use]
    pub fn send_otp_path() -> &'static str {
        "/api/password-reset/send-otp/"
    }

    #[must_use]
    pub fn verify_otp_path() -> &'static str {
        "/api/password-reset/verify-otp/"
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
        timeout: Duration,
    ) -> Result<RequestBuilder, ApiError> {
        let url = self
            .endpoint(path)
            .ok_or_else(|| ApiError::validation(format!("invalid request path `{path}`")))?;
        let mut request = self
            .http
            .request(method, url)
            .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
            .header(ACCEPT, "application/json")
            .timeout(timeout);
        if let Some(access_token) = access_token {
            request = request.bearer_auth(access_token);
        }
        Ok(request)
    }

    async fn get_json<T>(
        &self,
        path: &str,
        access_token: Option<&str>,
        timeout: Duration,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let request = self.request(Method::GET, path, access_token, timeout)?;
        let response = self.send(request, self.request_attempts).await?;
        decode_json_response(response).await
    }

    async fn write_json<Req, Res>(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
        payload: &Req,
        timeout: Duration,
    ) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let request = self
            .request(method, path, access_token, timeout)?
            .json(payload);
        let response = self.send(request, 1).await?;
        decode_json_response(response).await
    }

    async fn send(
        &self,
        request: RequestBuilder,
        attempts: u32,
    ) -> Result<reqwest::Response, ApiError> {
        let mut last_error: Option<reqwest::Error> = None;

        for attempt in 0..attempts {
            let Some(attempt_request) = request.try_clone() else {
                return request.send().await.map_err(|error| transport_error(&error));
            };
            match attempt_request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!(
                        target: "portal.http",
                        attempt,
                        error = %error,
                        "request failed before a response",
                    );
                    last_error = Some(error);
                    if attempt + 1 >= attempts {
                        break;
                    }
                }
            }
        }

        Err(last_error.map_or_else(
            || ApiError::network("request was not sent"),
            |error| transport_error(&error),
        ))
    }
}

#[async_trait]
impl PortalApi for PortalHttpClient {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        self.write_json(Method::POST, Self::login_path(), None, request, self.timeout)
            .await
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<TokenRefreshResponse, ApiError> {
        self.write_json(
            Method::POST,
            Self::token_refresh_path(),
            None,
            &json!({ "refresh": refresh_token }),
            self.timeout,
        )
        .await
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        let _: Value = self
            .write_json(
                Method::POST,
                Self::logout_path(),
                Some(access_token),
                &json!({}),
                self.timeout,
            )
            .await?;
        Ok(())
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<CanonicalProfile, ApiError> {
        self.get_json(Self::profile_path(), Some(access_token), self.profile_timeout)
            .await
    }

    async fn update_profile(
        &self,
        access_token: &str,
        patch: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        self.write_json(
            Method::PUT,
            Self::profile_path(),
            Some(access_token),
            patch,
            self.timeout,
        )
        .await
    }

    async fn check_address(&self, access_token: &str) -> Result<AddressCheck, ApiError> {
        self.get_json(Self::address_check_path(), Some(access_token), self.timeout)
            .await
    }

    async fn list_plans(&self) -> Result<Vec<PlanRecord>, ApiError> {
        let body: Value = self.get_json(Self::plans_path(), None, self.timeout).await?;
        plans_from_body(body)
            .map_err(|error| ApiError::decode(StatusCode::OK.as_u16(), error.to_string()))
    }

    async fn subscribe(
        &self,
        access_token: &str,
        request: &SubscribeRequest,
    ) -> Result<SubscribeEcho, ApiError> {
        let body: Value = self
            .write_json(
                Method::POST,
                Self::subscribe_path(),
                Some(access_token),
                request,
                self.timeout,
            )
            .await?;
        Ok(SubscribeEcho::from_response(body))
    }

    async fn ai_chat(&self, access_token: &str, request: &AiChatRequest) -> Result<Value, ApiError> {
        self.write_json(
            Method::POST,
            Self::ai_chat_path(),
            Some(access_token),
            request,
            self.chat_timeout,
        )
        .await
    }

    async fn has_permission(
        &self,
        access_token: &str,
        codename: &str,
    ) -> Result<PermissionCheck, ApiError> {
        let request = self
            .request(
                Method::GET,
                Self::has_permission_path(),
                Some(access_token),
                self.timeout,
            )?
            .query(&[("codename", codename)]);
        let response = self.send(request, self.request_attempts).await?;
        decode_json_response(response).await
    }

    async fn change_password(
        &self,
        access_token: &str,
        request: &ChangePasswordRequest,
    ) -> Result<Value, ApiError> {
        self.write_json(
            Method::POST,
            Self::change_password_path(),
            Some(access_token),
            request,
            self.timeout,
        )
        .await
    }

    async fn request_password_reset(&self, request: &PasswordResetRequest) -> Result<(), ApiError> {
        let _: Value = self
            .write_json(Method::POST, Self::send_otp_path(), None, request, self.timeout)
            .await?;
        Ok(())
    }

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<(), ApiError> {
        let _: Value = self
            .write_json(Method::POST, Self::verify_otp_path(), None, request, self.timeout)
            .await?;
        Ok(())
    }
}

/// Maps a non-2xx response onto the shared error shape. The backend puts a
/// machine code in `code` and the text in `message`, `detail` or `error`.
pub fn format_http_error(status: StatusCode, body: &[u8]) -> ApiError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|body| body.get("code"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let message = parsed
        .as_ref()
        .and_then(message_from_body)
        .or_else(|| {
            non_empty_string(String::from_utf8_lossy(body).chars().take(RAW_REPLY_LIMIT).collect())
        })
        .or_else(|| status.canonical_reason().map(ToString::to_string))
        .unwrap_or_else(|| "<empty>".to_string());
    ApiError::from_status(status.as_u16(), code, message)
}

fn transport_error(error: &reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::timeout(format!("request timed out: {error}"))
    } else {
        ApiError::network(error.to_string())
    }
}

/// Millisecond timeout with the shared 250 ms floor applied.
#[must_use]
pub fn clamp_timeout(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms.max(MIN_TIMEOUT_MS))
}

/// The plan list arrives bare or wrapped in a paginated `results` envelope.
fn plans_from_body(body: Value) -> Result<Vec<PlanRecord>, serde_json::Error> {
    let rows = match body {
        Value::Object(mut fields) => fields
            .remove("results")
            .unwrap_or_else(|| Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(rows)
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| transport_error(&error))?;

    if !status.is_success() {
        let error = format_http_error(status, &bytes);
        tracing::debug!(
            target: "portal.http",
            status = status.as_u16(),
            code = error.code.as_deref().unwrap_or_default(),
            "backend returned an error status",
        );
        return Err(error);
    }

    let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &bytes
    };
    serde_json::from_slice::<T>(body)
        .map_err(|error| ApiError::decode(status.as_u16(), error.to_string()))
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
