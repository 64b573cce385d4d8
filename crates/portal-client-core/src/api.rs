//! Transport contract for the portal REST backend.
//!
//! Calls that need a bearer token take it explicitly; callers normally go
//! through [`crate::interceptor::TokenRefreshInterceptor`] rather than passing
//! tokens by hand.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entitlements::{Subscription, normalize_subscription};
use crate::error::ApiError;
use crate::profile::CanonicalProfile;

/// Longest chat reply rendered from a response that carries no text field.
pub const RAW_REPLY_LIMIT: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// `POST /auth/login` body: the token pair plus a basic user snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
    #[serde(flatten)]
    pub user: CanonicalProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefreshResponse {
    pub access: String,
    /// Present only when the backend rotates refresh tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressCheck {
    #[serde(default)]
    pub has_address: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    #[serde(default)]
    pub has: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PlanRecord {
    /// Capability flags for this plan, read with the same matchers as a
    /// user's subscription.
    #[must_use]
    pub fn capabilities(&self) -> Subscription {
        let mut raw = self.extra.clone();
        raw.insert("slug".to_string(), Value::String(self.slug.clone()));
        if let Some(name) = self.name.as_ref() {
            raw.insert("name".to_string(), Value::String(name.clone()));
        }
        normalize_subscription(Some(&Value::Object(raw)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub plan_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
}

/// What a subscribe call echoed back. The backend has answered with a full
/// `user`, a wrapped `subscription`, or the bare subscription row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeEcho {
    pub user: Option<CanonicalProfile>,
    pub subscription: Option<Value>,
}

impl SubscribeEcho {
    #[must_use]
    pub fn from_response(body: Value) -> Self {
        let Value::Object(mut fields) = body else {
            return Self::default();
        };
        let user = fields
            .remove("user")
            .filter(Value::is_object)
            .and_then(|user| CanonicalProfile::from_json(user).ok());
        let subscription = match fields.remove("subscription").filter(|value| !value.is_null()) {
            Some(subscription) => Some(subscription),
            None if ["plan", "slug", "plan_slug"]
                .iter()
                .any(|key| fields.contains_key(*key)) =>
            {
                Some(Value::Object(fields))
            }
            None => None,
        };
        Self { user, subscription }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.subscription.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiChatRequest {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOtpRequest {
    pub email: String,
    pub otp: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Picks the human-readable reply out of an AI proxy response.
#[must_use]
pub fn extract_ai_reply(body: &Value) -> String {
    if let Value::String(text) = body {
        return text.clone();
    }
    for key in ["response", "result", "message"] {
        match body.get(key) {
            Some(Value::String(text)) => return text.clone(),
            Some(value) if !value.is_null() => return value.to_string(),
            _ => {}
        }
    }
    body.to_string().chars().take(RAW_REPLY_LIMIT).collect()
}

/// Pulls a display message out of a backend response body.
#[must_use]
pub fn message_from_body(body: &Value) -> Option<String> {
    ["message", "detail", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(ToString::to_string)
}

#[async_trait]
pub trait PortalApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError>;

    async fn refresh_access(&self, refresh_token: &str) -> Result<TokenRefreshResponse, ApiError>;

    async fn logout(&self, access_token: &str) -> Result<(), ApiError>;

    async fn fetch_profile(&self, access_token: &str) -> Result<CanonicalProfile, ApiError>;

    async fn update_profile(
        &self,
        access_token: &str,
        patch: &Map<String, Value>,
    ) -> Result<Value, ApiError>;

    async fn check_address(&self, access_token: &str) -> Result<AddressCheck, ApiError>;

    async fn list_plans(&self) -> Result<Vec<PlanRecord>, ApiError>;

    async fn subscribe(
        &self,
        access_token: &str,
        request: &SubscribeRequest,
    ) -> Result<SubscribeEcho, ApiError>;

    async fn ai_chat(&self, access_token: &str, request: &AiChatRequest) -> Result<Value, ApiError>;

    async fn has_permission(
        &self,
        access_token: &str,
        codename: &str,
    ) -> Result<PermissionCheck, ApiError>;

    async fn change_password(
        &self,
        access_token: &str,
        request: &ChangePasswordRequest,
    ) -> Result<Value, ApiError>;

    async fn request_password_reset(&self, request: &PasswordResetRequest) -> Result<(), ApiError>;

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<(), ApiError>;
}
