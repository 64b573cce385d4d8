use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const ENV_API_BASE_URL: &str = "PORTAL_API_BASE_URL";
pub const ENV_API_BASE_URL_LEGACY: &str = "VITE_API_BASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthInputError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("one-time code must contain letters or digits")]
    InvalidOtp,
    #[error("new password and confirmation do not match")]
    PasswordConfirmationMismatch,
    #[error("new password must differ from the current password")]
    PasswordUnchanged,
    #[error("plan slug must not be empty")]
    EmptyPlanSlug,
    #[error("prompt must not be empty")]
    EmptyPrompt,
}

/// Access/refresh token pair for one login session.
///
/// Either half may be missing: a cold start with nothing stored yields
/// `Credential::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credential {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: non_empty(access_token.into()),
            refresh_token: refresh_token.and_then(non_empty),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

pub fn resolve_api_base_url() -> Result<(String, &'static str), AuthInputError> {
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, ENV_API_BASE_URL));
    }
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL_LEGACY) {
        return normalize_base_url(&base_url)
            .map(|normalized| (normalized, ENV_API_BASE_URL_LEGACY));
    }
    normalize_base_url(DEFAULT_API_BASE_URL).map(|normalized| (normalized, "default_local"))
}

pub fn normalize_base_url(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(AuthInputError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn normalize_username(raw: &str) -> Result<String, AuthInputError> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(AuthInputError::EmptyUsername);
    }
    Ok(normalized.to_string())
}

/// Passwords are sent as typed; only emptiness is checked locally.
pub fn require_password(raw: &str) -> Result<&str, AuthInputError> {
    if raw.is_empty() {
        return Err(AuthInputError::EmptyPassword);
    }
    Ok(raw)
}

pub fn normalize_email(raw: &str) -> Result<String, AuthInputError> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(AuthInputError::EmptyEmail);
    }
    Ok(normalized)
}

pub fn normalize_otp(raw: &str) -> Result<String, AuthInputError> {
    let alnum = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>();
    if alnum.is_empty() {
        return Err(AuthInputError::InvalidOtp);
    }
    Ok(alnum)
}

pub fn normalize_plan_slug(raw: &str) -> Result<String, AuthInputError> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(AuthInputError::EmptyPlanSlug);
    }
    Ok(normalized)
}

pub fn normalize_prompt(raw: &str) -> Result<String, AuthInputError> {
    let normalized = raw.trim();
    if normalized.is_empty() {
        return Err(AuthInputError::EmptyPrompt);
    }
    Ok(normalized.to_string())
}

pub fn validate_password_change(
    old_password: &str,
    new_password: &str,
    confirm_password: &str,
) -> Result<(), AuthInputError> {
    require_password(old_password)?;
    require_password(new_password)?;
    if new_password != confirm_password {
        return Err(AuthInputError::PasswordConfirmationMismatch);
    }
    if new_password == old_password {
        return Err(AuthInputError::PasswordUnchanged);
    }
    Ok(())
}
