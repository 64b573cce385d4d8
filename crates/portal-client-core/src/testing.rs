//! Scripted in-memory backend shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::api::{
    AddressCheck, AiChatRequest, ChangePasswordRequest, LoginRequest, LoginResponse,
    PasswordResetRequest, PermissionCheck, PlanRecord, PortalApi, SubscribeEcho,
    SubscribeRequest, TokenRefreshResponse, VerifyOtpRequest,
};
use crate::error::ApiError;
use crate::profile::CanonicalProfile;

pub(crate) struct FakeState {
    pub accepted_tokens: HashSet<String>,
    pub refresh_grants: HashMap<String, String>,
    pub refresh_error: Option<ApiError>,
    pub refresh_delay: Option<Duration>,
    pub profile: Result<Value, ApiError>,
    pub profile_delay: Option<Duration>,
    pub ai_responses: VecDeque<Result<Value, ApiError>>,
    pub has_address: Result<bool, ApiError>,
    pub remote_permissions: HashSet<String>,
    pub users: HashMap<String, (String, Value)>,
    pub plans: Vec<Value>,
    pub calls: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            accepted_tokens: HashSet::new(),
            refresh_grants: HashMap::new(),
            refresh_error: None,
            refresh_delay: None,
            profile: Ok(json!({"username": "alice", "role_id": 2})),
            profile_delay: None,
            ai_responses: VecDeque::new(),
            has_address: Ok(true),
            remote_permissions: HashSet::new(),
            users: HashMap::new(),
            plans: vec![
                json!({"slug": "free", "name": "Free", "can_use_ai": false, "can_change_password": true}),
                json!({"slug": "enterprise", "name": "Enterprise", "can_use_ai": true, "can_edit_profile": true, "can_change_password": true}),
            ],
            calls: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakePortalApi {
    state: Mutex<FakeState>,
}

impl FakePortalApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accept_token(&self, token: &str) -> &Self {
        self.state().accepted_tokens.insert(token.to_string());
        self
    }

    pub fn revoke_token(&self, token: &str) -> &Self {
        self.state().accepted_tokens.remove(token);
        self
    }

    pub fn grant_refresh(&self, refresh_token: &str, new_access: &str) -> &Self {
        self.state()
            .refresh_grants
            .insert(refresh_token.to_string(), new_access.to_string());
        self
    }

    pub fn set_profile(&self, profile: Value) -> &Self {
        self.state().profile = Ok(profile);
        self
    }

    pub fn set_profile_error(&self, error: ApiError) -> &Self {
        self.state().profile = Err(error);
        self
    }

    pub fn set_profile_delay(&self, delay: Duration) -> &Self {
        self.state().profile_delay = Some(delay);
        self
    }

    pub fn register_user(&self, username: &str, password: &str, profile: Value) -> &Self {
        self.state()
            .users
            .insert(username.to_string(), (password.to_string(), profile));
        self
    }

    pub fn push_ai_response(&self, response: Result<Value, ApiError>) -> &Self {
        self.state().ai_responses.push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn authorize(&self, token: &str, call: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(format!("{call} {token}"));
        if state.accepted_tokens.contains(token) {
            Ok(())
        } else {
            Err(ApiError::unauthorized("token not valid"))
        }
    }
}

#[async_trait]
impl PortalApi for FakePortalApi {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let mut state = self.state();
        state.calls.push(format!("POST /auth/login {}", request.username));
        let Some((password, profile)) = state.users.get(&request.username).cloned() else {
            return Err(ApiError::unauthorized("No active account found"));
        };
        if password != request.password {
            return Err(ApiError::unauthorized("No active account found"));
        }
        let access = format!("access-{}", request.username);
        let refresh = format!("refresh-{}", request.username);
        state.accepted_tokens.insert(access.clone());
        state.profile = Ok(profile.clone());
        let mut body = profile.as_object().cloned().unwrap_or_default();
        body.insert("access".to_string(), Value::String(access));
        body.insert("refresh".to_string(), Value::String(refresh));
        serde_json::from_value(Value::Object(body))
            .map_err(|error| ApiError::decode(200, error.to_string()))
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<TokenRefreshResponse, ApiError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(format!("POST /auth/token/refresh {refresh_token}"));
            state.refresh_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(error) = state.refresh_error.clone() {
            return Err(error);
        }
        let Some(access) = state.refresh_grants.get(refresh_token).cloned() else {
            return Err(ApiError::unauthorized("Token is invalid or expired"));
        };
        state.accepted_tokens.insert(access.clone());
        Ok(TokenRefreshResponse {
            access,
            refresh: None,
        })
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        self.state()
            .calls
            .push(format!("POST /auth/logout {access_token}"));
        Ok(())
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<CanonicalProfile, ApiError> {
        self.authorize(access_token, "GET /auth/profile")?;
        // The row is read when the request arrives, not when the reply is sent.
        let (profile, delay) = {
            let state = self.state();
            (state.profile.clone(), state.profile_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let profile = profile?;
        CanonicalProfile::from_json(profile).map_err(|error| ApiError::decode(200, error.to_string()))
    }

    async fn update_profile(
        &self,
        access_token: &str,
        patch: &Map<String, Value>,
    ) -> Result<Value, ApiError> {
        self.authorize(access_token, "PUT /auth/profile")?;
        let mut state = self.state();
        if let Ok(Value::Object(profile)) = state.profile.as_mut() {
            for (key, value) in patch {
                profile.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(patch.clone()))
    }

    async fn check_address(&self, access_token: &str) -> Result<AddressCheck, ApiError> {
        self.authorize(access_token, "GET /addresses/check")?;
        let has_address = self.state().has_address.clone()?;
        Ok(AddressCheck { has_address })
    }

    async fn list_plans(&self) -> Result<Vec<PlanRecord>, ApiError> {
        let mut state = self.state();
        state.calls.push("GET /plans".to_string());
        state
            .plans
            .iter()
            .map(|plan| {
                serde_json::from_value(plan.clone())
                    .map_err(|error| ApiError::decode(200, error.to_string()))
            })
            .collect()
    }

    async fn subscribe(
        &self,
        access_token: &str,
        request: &SubscribeRequest,
    ) -> Result<SubscribeEcho, ApiError> {
        self.authorize(access_token, "POST /subscribe")?;
        let mut state = self.state();
        let Some(plan) = state
            .plans
            .iter()
            .find(|plan| plan.get("slug").and_then(Value::as_str) == Some(request.plan_slug.as_str()))
            .cloned()
        else {
            return Err(ApiError::from_status(404, None, "No SubscriptionPlan matches the given query."));
        };
        let row = json!({"plan": plan, "status": "active", "active": true});
        if let Ok(Value::Object(profile)) = state.profile.as_mut() {
            profile.insert("subscription".to_string(), row.clone());
        }
        Ok(SubscribeEcho::from_response(row))
    }

    async fn ai_chat(&self, access_token: &str, request: &AiChatRequest) -> Result<Value, ApiError> {
        self.authorize(access_token, "POST /ai/free-chat")?;
        self.state()
            .ai_responses
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"response": format!("echo: {}", request.prompt)})))
    }

    async fn has_permission(
        &self,
        access_token: &str,
        codename: &str,
    ) -> Result<PermissionCheck, ApiError> {
        self.authorize(access_token, "GET /permissions/has_permission")?;
        Ok(PermissionCheck {
            has: self.state().remote_permissions.contains(codename),
        })
    }

    async fn change_password(
        &self,
        access_token: &str,
        _request: &ChangePasswordRequest,
    ) -> Result<Value, ApiError> {
        self.authorize(access_token, "POST /change-password")?;
        Ok(json!({"message": "Password changed successfully"}))
    }

    async fn request_password_reset(&self, request: &PasswordResetRequest) -> Result<(), ApiError> {
        self.state()
            .calls
            .push(format!("POST /password-reset/send-otp {}", request.email));
        Ok(())
    }

    async fn verify_otp(&self, request: &VerifyOtpRequest) -> Result<(), ApiError> {
        self.state()
            .calls
            .push(format!("POST /password-reset/verify-otp {}", request.email));
        if request.otp == "000000" {
            return Err(ApiError::from_status(400, None, "Invalid OTP"));
        }
        Ok(())
    }
}
