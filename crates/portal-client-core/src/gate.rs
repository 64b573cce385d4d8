//! Per-feature entitlement checks.
//!
//! Subscription-backed features degrade to an upgrade prompt; permission or
//! role-backed items are hidden outright.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::entitlements::{Capability, EntitlementSet};
use crate::error::{ApiError, ApiErrorKind};
use crate::guards::Route;
use crate::session::SessionSnapshot;

pub const PERMISSION_MANAGE_USERS: &str = "view_manage_user";
pub const PERMISSION_VIEW_REPORTS: &str = "view_reports";
pub const SETTINGS_PERMISSIONS: [&str; 3] = ["view_settings", "manage_roles", "manage_departments"];

pub const AI_UPGRADE_MESSAGE: &str = "Your subscription does not include AI access.";
const EDIT_PROFILE_UPGRADE_MESSAGE: &str = "Your plan does not allow editing your profile.";
const CHANGE_PASSWORD_UPGRADE_MESSAGE: &str = "Your plan does not allow changing your password.";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "feature", content = "codename", rename_all = "snake_case")]
pub enum Feature {
    AiChat,
    ChangePassword,
    EditProfile,
    AdminArea,
    Permission(String),
    /// Visible when any of the listed permissions is held.
    AnyPermission(Vec<String>),
}

impl Feature {
    #[must_use]
    pub fn permission(codename: impl Into<String>) -> Self {
        Self::Permission(codename.into())
    }

    #[must_use]
    pub fn any_permission(codenames: &[&str]) -> Self {
        Self::AnyPermission(codenames.iter().map(ToString::to_string).collect())
    }

    /// Subscription capability backing this feature, if any.
    #[must_use]
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Self::AiChat => Some(Capability::UseAi),
            Self::ChangePassword => Some(Capability::ChangePassword),
            Self::EditProfile => Some(Capability::EditProfile),
            Self::AdminArea | Self::Permission(_) | Self::AnyPermission(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    /// Render the feature disabled with an upgrade prompt.
    UpgradeRequired {
        capability: Capability,
        message: String,
    },
    Hidden,
}

impl GateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    #[must_use]
    pub fn upgrade(capability: Capability) -> Self {
        let message = match capability {
            Capability::UseAi => AI_UPGRADE_MESSAGE,
            Capability::EditProfile => EDIT_PROFILE_UPGRADE_MESSAGE,
            Capability::ChangePassword => CHANGE_PASSWORD_UPGRADE_MESSAGE,
        };
        Self::UpgradeRequired {
            capability,
            message: message.to_string(),
        }
    }
}

#[must_use]
pub fn evaluate(entitlements: &EntitlementSet, feature: &Feature) -> GateDecision {
    if let Some(capability) = feature.capability() {
        return if entitlements.grants(capability) {
            GateDecision::Allow
        } else {
            GateDecision::upgrade(capability)
        };
    }
    let visible = match feature {
        Feature::AdminArea => entitlements.is_admin,
        Feature::Permission(codename) => entitlements.has_permission(codename),
        Feature::AnyPermission(codenames) => codenames
            .iter()
            .any(|codename| entitlements.has_permission(codename)),
        Feature::AiChat | Feature::ChangePassword | Feature::EditProfile => false,
    };
    if visible {
        GateDecision::Allow
    } else {
        GateDecision::Hidden
    }
}

/// Maps a backend refusal of the AI proxy onto the same denial the local gate
/// produces. Any 403 counts; `NO_AI_ACCESS` is simply the explicit form.
#[must_use]
pub fn translate_ai_denial(error: &ApiError) -> Option<GateDecision> {
    match error.kind {
        ApiErrorKind::EntitlementDenied | ApiErrorKind::Forbidden => {
            let message = if error.kind == ApiErrorKind::EntitlementDenied
                && !error.message.trim().is_empty()
            {
                error.message.clone()
            } else {
                AI_UPGRADE_MESSAGE.to_string()
            };
            Some(GateDecision::UpgradeRequired {
                capability: Capability::UseAi,
                message,
            })
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavItem {
    pub label: &'static str,
    pub route: Route,
}

const fn nav(label: &'static str, route: Route) -> NavItem {
    NavItem { label, route }
}

#[must_use]
pub fn admin_nav(entitlements: &EntitlementSet) -> Vec<NavItem> {
    let candidates = [
        (nav("Dashboard", Route::AdminDashboard), None),
        (
            nav("Manage Users", Route::AdminUsers),
            Some(Feature::permission(PERMISSION_MANAGE_USERS)),
        ),
        (
            nav("Reports", Route::AdminReports),
            Some(Feature::permission(PERMISSION_VIEW_REPORTS)),
        ),
        (
            nav("Settings", Route::AdminSettings),
            Some(Feature::any_permission(&SETTINGS_PERMISSIONS)),
        ),
    ];
    candidates
        .into_iter()
        .filter(|(_, feature)| {
            feature
                .as_ref()
                .is_none_or(|feature| evaluate(entitlements, feature).is_allowed())
        })
        .map(|(item, _)| item)
        .collect()
}

#[must_use]
pub fn user_nav(entitlements: &EntitlementSet) -> Vec<NavItem> {
    let mut items = vec![
        nav("Dashboard", Route::Dashboard),
        nav("Profile", Route::Profile),
        nav("Plans", Route::Plans),
    ];
    if evaluate(entitlements, &Feature::AiChat).is_allowed() {
        items.push(nav("AI Chat", Route::AiChat));
    }
    items
}

/// Live view over the session for gating decisions. Every check reads the
/// latest published snapshot.
#[derive(Debug, Clone)]
pub struct FeatureGate {
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl FeatureGate {
    #[must_use]
    pub fn new(snapshots: watch::Receiver<SessionSnapshot>) -> Self {
        Self { snapshots }
    }

    #[must_use]
    pub fn check(&self, feature: &Feature) -> GateDecision {
        evaluate(&self.snapshots.borrow().entitlements, feature)
    }

    #[must_use]
    pub fn nav_items(&self) -> Vec<NavItem> {
        let snapshot = self.snapshots.borrow();
        if snapshot.entitlements.is_admin {
            admin_nav(&snapshot.entitlements)
        } else {
            user_nav(&snapshot.entitlements)
        }
    }

    /// Waits for the next profile change and re-evaluates `feature`. Returns
    /// `None` once the session is gone.
    pub async fn changed(&mut self, feature: &Feature) -> Option<GateDecision> {
        self.snapshots.changed().await.ok()?;
        Some(evaluate(&self.snapshots.borrow_and_update().entitlements, feature))
    }
}
