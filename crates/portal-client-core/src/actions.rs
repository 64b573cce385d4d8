//! Account actions layered on the session: plans and subscription, AI chat,
//! password and profile changes, password reset.
//!
//! Feature denials come back as [`Gated::Denied`]; only transport and input
//! problems are errors.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{
    AiChatRequest, ChangePasswordRequest, PasswordResetRequest, PlanRecord, PortalApi,
    SubscribeRequest, VerifyOtpRequest, extract_ai_reply, message_from_body,
};
use crate::auth::{
    AuthInputError, normalize_email, normalize_otp, normalize_plan_slug, normalize_prompt,
    require_password, validate_password_change,
};
use crate::error::{ApiError, ApiErrorKind};
use crate::gate::{Feature, GateDecision, evaluate, translate_ai_denial};
use crate::session::{Session, SessionSnapshot, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Input(#[from] AuthInputError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Outcome of a gated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Gated<T> {
    Allowed(T),
    Denied(GateDecision),
}

impl<T> Gated<T> {
    #[must_use]
    pub fn allowed(self) -> Option<T> {
        match self {
            Self::Allowed(value) => Some(value),
            Self::Denied(_) => None,
        }
    }

    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub provider: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiReply {
    pub text: String,
    pub raw: Value,
}

fn is_backend_ai_refusal(error: &ApiError) -> bool {
    matches!(
        error.kind,
        ApiErrorKind::Forbidden | ApiErrorKind::EntitlementDenied | ApiErrorKind::NotFound
    )
}

impl Session {
    /// Runs an authenticated call through the shared interceptor and lets the
    /// session react to credential failures.
    async fn authenticated<T, F, Fut>(&self, request: F) -> Result<T, ApiError>
    where
        F: Fn(Arc<dyn PortalApi>, String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let epoch = self.epoch();
        let api = self.api().clone();
        let result = self
            .interceptor()
            .call(|token| request(api.clone(), token))
            .await;
        if let Err(error) = &result {
            self.observe_api_error(epoch, error);
        }
        result
    }

    pub async fn list_plans(&self) -> Result<Vec<PlanRecord>, ActionError> {
        Ok(self.api().list_plans().await?)
    }

    /// Subscribes to `plan_slug`, then re-bootstraps so entitlements reflect
    /// the new plan. When the re-bootstrap cannot reach the backend the
    /// subscribe echo is applied to the cached profile instead.
    pub async fn subscribe_to_plan(
        &self,
        plan_slug: &str,
        payment: PaymentDetails,
    ) -> Result<SessionSnapshot, ActionError> {
        let request = SubscribeRequest {
            plan_slug: normalize_plan_slug(plan_slug)?,
            payment_provider: payment.provider.filter(|value| !value.trim().is_empty()),
            payment_reference: payment.reference.filter(|value| !value.trim().is_empty()),
        };
        let request = &request;
        let echo = self
            .authenticated(|api, token| async move { api.subscribe(&token, request).await })
            .await?;
        tracing::info!(
            target: "portal.session",
            plan = %request.plan_slug,
            "subscription accepted; refreshing profile",
        );

        let snapshot = self.refresh_after_write().await;
        if snapshot.state == SessionState::Degraded && !echo.is_empty() {
            self.apply_subscribe_echo(&echo);
            return Ok(self.snapshot());
        }
        Ok(snapshot)
    }

    /// Sends a prompt to the AI proxy.
    ///
    /// The local gate is consulted first, so a plan without AI never reaches
    /// the network. When the backend refuses a prompt the local entitlement
    /// allowed, the profile is re-fetched once and, if AI is still granted,
    /// the prompt is retried once.
    pub async fn send_ai_prompt(&self, prompt: &str) -> Result<Gated<AiReply>, ActionError> {
        let request = AiChatRequest {
            prompt: normalize_prompt(prompt)?,
        };
        let decision = evaluate(&self.snapshot().entitlements, &Feature::AiChat);
        if !decision.is_allowed() {
            return Ok(Gated::Denied(decision));
        }

        let request = &request;
        let first = self
            .authenticated(|api, token| async move { api.ai_chat(&token, request).await })
            .await;
        let refusal = match first {
            Ok(body) => return Ok(Gated::Allowed(ai_reply(body))),
            Err(error) if is_backend_ai_refusal(&error) => error,
            Err(error) => return Err(error.into()),
        };

        tracing::info!(
            target: "portal.session",
            status = refusal.status_code,
            code = refusal.code.as_deref().unwrap_or(""),
            "AI proxy refused a locally allowed prompt; re-fetching profile",
        );
        let snapshot = self.refresh_after_write().await;
        let decision = evaluate(&snapshot.entitlements, &Feature::AiChat);
        if !decision.is_allowed() {
            return Ok(Gated::Denied(decision));
        }

        match self
            .authenticated(|api, token| async move { api.ai_chat(&token, request).await })
            .await
        {
            Ok(body) => Ok(Gated::Allowed(ai_reply(body))),
            Err(error) => {
                let denial = translate_ai_denial(&error).or_else(|| {
                    (error.kind == ApiErrorKind::NotFound)
                        .then(|| translate_ai_denial(&refusal))
                        .flatten()
                });
                match denial {
                    Some(denial) => Ok(Gated::Denied(denial)),
                    None => Err(error.into()),
                }
            }
        }
    }

    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<Gated<String>, ActionError> {
        validate_password_change(old_password, new_password, confirm_password)?;
        let decision = evaluate(&self.snapshot().entitlements, &Feature::ChangePassword);
        if !decision.is_allowed() {
            return Ok(Gated::Denied(decision));
        }

        let request = ChangePasswordRequest {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
            confirm_password: confirm_password.to_string(),
        };
        let request = &request;
        let body = self
            .authenticated(|api, token| async move { api.change_password(&token, request).await })
            .await?;
        Ok(Gated::Allowed(
            message_from_body(&body).unwrap_or_else(|| "Password changed".to_string()),
        ))
    }

    /// Applies a partial profile update, then re-bootstraps.
    pub async fn update_profile(
        &self,
        patch: Map<String, Value>,
    ) -> Result<Gated<SessionSnapshot>, ActionError> {
        let decision = evaluate(&self.snapshot().entitlements, &Feature::EditProfile);
        if !decision.is_allowed() {
            return Ok(Gated::Denied(decision));
        }
        let patch = &patch;
        self.authenticated(|api, token| async move { api.update_profile(&token, patch).await })
            .await?;
        Ok(Gated::Allowed(self.refresh_after_write().await))
    }

    /// Server-side permission check for list pages that need a fresh answer.
    pub async fn has_permission_remote(&self, codename: &str) -> Result<bool, ActionError> {
        let check = self
            .authenticated(|api, token| async move { api.has_permission(&token, codename).await })
            .await?;
        Ok(check.has)
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ActionError> {
        let request = PasswordResetRequest {
            email: normalize_email(email)?,
        };
        self.api().request_password_reset(&request).await?;
        Ok(())
    }

    pub async fn verify_otp(
        &self,
        email: &str,
        otp: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<(), ActionError> {
        require_password(new_password)?;
        if new_password != confirm_password {
            return Err(AuthInputError::PasswordConfirmationMismatch.into());
        }
        let request = VerifyOtpRequest {
            email: normalize_email(email)?,
            otp: normalize_otp(otp)?,
            new_password: new_password.to_string(),
            confirm_password: confirm_password.to_string(),
        };
        self.api().verify_otp(&request).await?;
        Ok(())
    }
}

fn ai_reply(body: Value) -> AiReply {
    AiReply {
        text: extract_ai_reply(&body),
        raw: body,
    }
}
