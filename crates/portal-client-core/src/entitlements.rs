//! Entitlement resolution.
//!
//! [`resolve`] is a pure function of the canonical profile. Subscription
//! capabilities are read through an ordered list of shape matchers
//! ([`SHAPE_MATCHERS`]); the first matcher that gives a definite answer for a
//! capability wins and later shapes are not consulted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::profile::CanonicalProfile;

/// Role id the backend reserves for ordinary users. Any other role id means
/// admin when the explicit `is_admin` flag is absent.
pub const USER_ROLE_ID: i64 = 2;
pub const FREE_PLAN_SLUG: &str = "free";
/// Tier whose bare slug implies AI access when no flag says otherwise.
pub const TOP_TIER_SLUG: &str = "enterprise";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    UseAi,
    EditProfile,
    ChangePassword,
}

impl Capability {
    #[must_use]
    pub fn field_name(self) -> &'static str {
        match self {
            Self::UseAi => "can_use_ai",
            Self::EditProfile => "can_edit_profile",
            Self::ChangePassword => "can_change_password",
        }
    }

    /// Value used when no shape matcher yields an answer. Change-password stays
    /// available so users are not locked out before subscription data exists.
    #[must_use]
    pub fn default_grant(self) -> bool {
        matches!(self, Self::ChangePassword)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionShape {
    /// `{ "can_use_ai": true }`
    DirectFlag,
    /// `{ "plan": { "can_use_ai": true } }`
    NestedPlan,
    /// `{ "features": { "can_use_ai": "true" } }`, also under `plan.features`.
    FeatureMatrix,
    /// `"enterprise"` or `{ "slug": "enterprise" }`; AI only.
    SlugTier,
}

pub type ShapeMatcher = fn(&Value, Capability) -> Option<bool>;

pub const SHAPE_MATCHERS: [(SubscriptionShape, ShapeMatcher); 4] = [
    (SubscriptionShape::DirectFlag, match_direct_flag),
    (SubscriptionShape::NestedPlan, match_nested_plan),
    (SubscriptionShape::FeatureMatrix, match_feature_matrix),
    (SubscriptionShape::SlugTier, match_slug_tier),
];

pub fn match_direct_flag(raw: &Value, capability: Capability) -> Option<bool> {
    raw.get(capability.field_name()).and_then(Value::as_bool)
}

pub fn match_nested_plan(raw: &Value, capability: Capability) -> Option<bool> {
    raw.get("plan")
        .and_then(|plan| plan.get(capability.field_name()))
        .and_then(Value::as_bool)
}

pub fn match_feature_matrix(raw: &Value, capability: Capability) -> Option<bool> {
    let from = |features: Option<&Value>| {
        features
            .and_then(|features| features.get(capability.field_name()))
            .and_then(parse_feature_flag)
    };
    from(raw.get("features")).or_else(|| from(raw.get("plan").and_then(|plan| plan.get("features"))))
}

pub fn match_slug_tier(raw: &Value, capability: Capability) -> Option<bool> {
    if capability != Capability::UseAi {
        return None;
    }
    let slug = subscription_slug(raw)?;
    slug.eq_ignore_ascii_case(TOP_TIER_SLUG).then_some(true)
}

/// Runs the matchers in priority order and reports which shape answered.
#[must_use]
pub fn match_capability(raw: &Value, capability: Capability) -> Option<(SubscriptionShape, bool)> {
    SHAPE_MATCHERS
        .iter()
        .find_map(|(shape, matcher)| matcher(raw, capability).map(|granted| (*shape, granted)))
}

/// The feature matrix stores flags as strings (`"true"`, `"1"`, `"yes"`).
fn parse_feature_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|number| number != 0),
        Value::String(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            Some(matches!(normalized.as_str(), "true" | "1" | "yes" | "y" | "t"))
        }
        _ => None,
    }
}

fn subscription_slug(raw: &Value) -> Option<String> {
    let slug = match raw {
        Value::String(slug) => Some(slug.as_str()),
        Value::Object(_) => raw
            .get("slug")
            .and_then(Value::as_str)
            .or_else(|| raw.get("plan_slug").and_then(Value::as_str))
            .or_else(|| {
                raw.get("plan")
                    .and_then(|plan| plan.get("slug"))
                    .and_then(Value::as_str)
            })
            .or_else(|| raw.get("plan").and_then(Value::as_str)),
        _ => None,
    }?;
    let slug = slug.trim().to_ascii_lowercase();
    if slug.is_empty() { None } else { Some(slug) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub slug: String,
    pub name: String,
    pub can_use_ai: bool,
    pub can_edit_profile: bool,
    pub can_change_password: bool,
    pub is_active: bool,
}

impl Subscription {
    /// Synthesized when the backend sends no subscription at all.
    #[must_use]
    pub fn free_default() -> Self {
        Self {
            slug: FREE_PLAN_SLUG.to_string(),
            name: "Free".to_string(),
            can_use_ai: false,
            can_edit_profile: false,
            can_change_password: Capability::ChangePassword.default_grant(),
            is_active: true,
        }
    }

    #[must_use]
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::UseAi => self.can_use_ai,
            Capability::EditProfile => self.can_edit_profile,
            Capability::ChangePassword => self.can_change_password,
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::free_default()
    }
}

#[must_use]
pub fn normalize_subscription(raw: Option<&Value>) -> Subscription {
    let Some(raw) = raw.filter(|value| !value.is_null()) else {
        return Subscription::free_default();
    };

    let capability = |capability: Capability| {
        match_capability(raw, capability)
            .map_or_else(|| capability.default_grant(), |(_, granted)| granted)
    };
    let slug = subscription_slug(raw).unwrap_or_else(|| FREE_PLAN_SLUG.to_string());
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| {
            raw.get("plan")
                .and_then(|plan| plan.get("name"))
                .and_then(Value::as_str)
        })
        .map(ToString::to_string)
        .unwrap_or_else(|| title_case(&slug));

    Subscription {
        can_use_ai: capability(Capability::UseAi),
        can_edit_profile: capability(Capability::EditProfile),
        can_change_password: capability(Capability::ChangePassword),
        is_active: subscription_is_active(raw),
        slug,
        name,
    }
}

fn subscription_is_active(raw: &Value) -> bool {
    if let Some(active) = raw
        .get("is_active")
        .or_else(|| raw.get("active"))
        .and_then(Value::as_bool)
    {
        return active;
    }
    !matches!(
        raw.get("status").and_then(Value::as_str),
        Some("expired" | "cancelled" | "canceled")
    )
}

fn title_case(slug: &str) -> String {
    let mut chars = slug.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSet {
    pub is_admin: bool,
    pub permissions: BTreeSet<String>,
    pub can_use_ai: bool,
    pub can_edit_profile: bool,
    pub can_change_password: bool,
    pub subscription: Subscription,
}

impl EntitlementSet {
    #[must_use]
    pub fn has_permission(&self, codename: &str) -> bool {
        self.permissions.contains(codename)
    }

    #[must_use]
    pub fn has_any_permission(&self, codenames: &[&str]) -> bool {
        codenames.iter().any(|codename| self.has_permission(codename))
    }

    #[must_use]
    pub fn grants(&self, capability: Capability) -> bool {
        match capability {
            Capability::UseAi => self.can_use_ai,
            Capability::EditProfile => self.can_edit_profile,
            Capability::ChangePassword => self.can_change_password,
        }
    }
}

impl Default for EntitlementSet {
    fn default() -> Self {
        resolve(None)
    }
}

/// Admin flag with the historical fallback: explicit flag first, then the
/// ordinary-user role sentinel. A profile with neither is not an admin.
#[must_use]
pub fn resolve_is_admin(profile: &CanonicalProfile) -> bool {
    match (profile.is_admin, profile.role_id) {
        (Some(flag), _) => flag,
        (None, Some(role_id)) => role_id != USER_ROLE_ID,
        (None, None) => false,
    }
}

#[must_use]
pub fn resolve(profile: Option<&CanonicalProfile>) -> EntitlementSet {
    let Some(profile) = profile else {
        let subscription = Subscription::free_default();
        return EntitlementSet {
            is_admin: false,
            permissions: BTreeSet::new(),
            can_use_ai: false,
            can_edit_profile: false,
            can_change_password: subscription.can_change_password,
            subscription,
        };
    };

    let subscription = normalize_subscription(profile.subscription.as_ref());
    EntitlementSet {
        is_admin: resolve_is_admin(profile),
        permissions: profile.permissions.clone().unwrap_or_default(),
        can_use_ai: subscription.can_use_ai,
        can_edit_profile: subscription.can_edit_profile,
        can_change_password: subscription.can_change_password,
        subscription,
    }
}
