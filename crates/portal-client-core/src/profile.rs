//! Canonical user profile as returned by `GET /auth/profile`.
//!
//! The backend has emitted several shapes over time. Known fields are typed;
//! everything else is preserved verbatim in [`CanonicalProfile::extra`] so a
//! cached copy round-trips without losing data.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub role_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    /// `None` when the backend omitted the flag; the resolver then falls back
    /// to the role-id convention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<BTreeSet<String>>,
    /// Raw subscription payload in whichever historical shape the backend sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub department_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalProfile {
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref().filter(|name| !name.trim().is_empty()) {
            return username.to_string();
        }
        let first = self.extra_str("first_name").unwrap_or_default();
        let last = self.extra_str("last_name").unwrap_or_default();
        let joined = format!("{first} {last}");
        let joined = joined.trim();
        if joined.is_empty() {
            "User".to_string()
        } else {
            joined.to_string()
        }
    }

    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Replaces the subscription payload, leaving every other field untouched.
    pub fn merge_subscription(&mut self, subscription: Value) {
        self.subscription = Some(subscription);
    }
}

/// Accepts `2`, `"2"`, `null`, or a missing field.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse::<i64>().ok(),
        _ => None,
    })
}
