use serde::{Deserialize, Serialize};

/// Backend code that marks a 403 as a subscription-tier denial for AI chat.
pub const CODE_NO_AI_ACCESS: &str = "NO_AI_ACCESS";
pub const CODE_TIMEOUT: &str = "timeout";
pub const CODE_NETWORK_ERROR: &str = "network_error";
pub const CODE_MISSING_CREDENTIAL: &str = "missing_credential";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    MissingCredential,
    Unauthorized,
    Forbidden,
    EntitlementDenied,
    NotFound,
    Validation,
    RateLimited,
    ServiceUnavailable,
    Timeout,
    Network,
    Decode,
    Unknown,
}

impl ApiErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::EntitlementDenied => "entitlement_denied",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Decode => "decode",
            Self::Unknown => "unknown",
        }
    }
}

/// Error surfaced by every outbound backend call.
///
/// `status_code` is `0` when no HTTP response was received (timeouts,
/// connection failures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind_label}:{status_code}:{message}", kind_label = .kind.as_str())]
pub struct ApiError {
    pub status_code: u16,
    pub code: Option<String>,
    pub message: String,
    pub kind: ApiErrorKind,
    pub retryable: bool,
}

impl ApiError {
    #[must_use]
    pub fn from_status(status_code: u16, code: Option<String>, message: impl Into<String>) -> Self {
        let classified = classify_http_error(status_code, code.as_deref(), message.into());
        Self {
            status_code,
            code,
            message: classified.message,
            kind: classified.kind,
            retryable: classified.retryable,
        }
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::from_status(401, None, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::from_status(0, Some(CODE_TIMEOUT.to_string()), message)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::from_status(0, Some(CODE_NETWORK_ERROR.to_string()), message)
    }

    #[must_use]
    pub fn missing_credential() -> Self {
        Self {
            status_code: 0,
            code: Some(CODE_MISSING_CREDENTIAL.to_string()),
            message: "no access token is stored".to_string(),
            kind: ApiErrorKind::MissingCredential,
            retryable: false,
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status_code: 422,
            code: Some("validation_error".to_string()),
            message: message.into(),
            kind: ApiErrorKind::Validation,
            retryable: false,
        }
    }

    #[must_use]
    pub fn decode(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            code: Some("decode_failed".to_string()),
            message: message.into(),
            kind: ApiErrorKind::Decode,
            retryable: false,
        }
    }

    /// Errors that end the session: the backend rejected the credential itself.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::Unauthorized | ApiErrorKind::MissingCredential
        )
    }

    /// Errors that leave the session intact and may fall back to cached state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::Timeout
                | ApiErrorKind::Network
                | ApiErrorKind::ServiceUnavailable
                | ApiErrorKind::RateLimited
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedHttpError {
    pub kind: ApiErrorKind,
    pub retryable: bool,
    pub message: String,
}

#[must_use]
pub fn classify_http_error(status: u16, code: Option<&str>, message: String) -> ClassifiedHttpError {
    let kind = match status {
        0 => match code {
            Some(CODE_TIMEOUT) => ApiErrorKind::Timeout,
            Some(CODE_MISSING_CREDENTIAL) => ApiErrorKind::MissingCredential,
            _ => ApiErrorKind::Network,
        },
        401 => ApiErrorKind::Unauthorized,
        403 if code == Some(CODE_NO_AI_ACCESS) => ApiErrorKind::EntitlementDenied,
        403 => ApiErrorKind::Forbidden,
        404 => ApiErrorKind::NotFound,
        400 | 409 | 422 => ApiErrorKind::Validation,
        408 => ApiErrorKind::Timeout,
        429 => ApiErrorKind::RateLimited,
        500..=599 => ApiErrorKind::ServiceUnavailable,
        _ => ApiErrorKind::Unknown,
    };
    let retryable = matches!(
        kind,
        ApiErrorKind::Timeout
            | ApiErrorKind::Network
            | ApiErrorKind::ServiceUnavailable
            | ApiErrorKind::RateLimited
    );
    let message = if message.trim().is_empty() {
        format!("request failed with status {status}")
    } else {
        message
    };
    ClassifiedHttpError {
        kind,
        retryable,
        message,
    }
}
