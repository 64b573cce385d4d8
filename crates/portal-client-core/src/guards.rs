//! Route guards and post-login routing.
//!
//! Guards are total: every snapshot maps to exactly one [`GuardOutcome`].

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionSnapshot, SessionState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Landing,
    Login,
    Register,
    ForgotPassword,
    VerifyOtp,
    Dashboard,
    Profile,
    EditProfile,
    ChangePassword,
    Addresses,
    Plans,
    AiChat,
    Billing,
    AdminDashboard,
    AdminUsers,
    AdminReports,
    AdminSettings,
    AdminProfile,
    AdminChangePassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAccess {
    Public,
    Authenticated,
    Admin,
}

const ROUTES: [(Route, &str); 19] = [
    (Route::Landing, "/"),
    (Route::Login, "/login"),
    (Route::Register, "/register"),
    (Route::ForgotPassword, "/forgot-password"),
    (Route::VerifyOtp, "/verify-otp"),
    (Route::Dashboard, "/dashboard"),
    (Route::Profile, "/profile"),
    (Route::EditProfile, "/edit-profile"),
    (Route::ChangePassword, "/change-password"),
    (Route::Addresses, "/addresses"),
    (Route::Plans, "/account/plans"),
    (Route::AiChat, "/account/ai"),
    (Route::Billing, "/billing"),
    (Route::AdminDashboard, "/admin/dashboard"),
    (Route::AdminUsers, "/admin/users"),
    (Route::AdminReports, "/admin/reports"),
    (Route::AdminSettings, "/admin/settings"),
    (Route::AdminProfile, "/admin/profile"),
    (Route::AdminChangePassword, "/admin/change-password"),
];

impl Route {
    #[must_use]
    pub fn path(&self) -> &'static str {
        ROUTES
            .iter()
            .find(|(route, _)| route == self)
            .map_or("/", |(_, path)| *path)
    }

    /// Resolves a location to its page. Nested admin paths such as
    /// `/admin/users/7` resolve to their section. Query strings and
    /// fragments are ignored.
    #[must_use]
    pub fn from_path(location: &str) -> Option<Self> {
        let path = location
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim();
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        if let Some((route, _)) = ROUTES.iter().find(|(_, candidate)| *candidate == path) {
            return Some(route.clone());
        }
        let section = if path.starts_with("/admin/users/") {
            Route::AdminUsers
        } else if path.starts_with("/admin/profile/") {
            Route::AdminProfile
        } else if path.starts_with("/admin") {
            Route::AdminDashboard
        } else {
            return None;
        };
        Some(section)
    }

    #[must_use]
    pub fn access(&self) -> RouteAccess {
        match self {
            Self::Landing | Self::Login | Self::Register | Self::ForgotPassword | Self::VerifyOtp => {
                RouteAccess::Public
            }
            Self::AdminDashboard
            | Self::AdminUsers
            | Self::AdminReports
            | Self::AdminSettings
            | Self::AdminProfile
            | Self::AdminChangePassword => RouteAccess::Admin,
            _ => RouteAccess::Authenticated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GuardOutcome {
    /// Session still resolving; render nothing yet.
    Pending,
    Render,
    Redirect {
        to: Route,
        /// Location to resume after login.
        return_to: Option<String>,
    },
}

fn suspended(snapshot: &SessionSnapshot) -> bool {
    matches!(
        snapshot.state,
        SessionState::Uninitialized | SessionState::Loading
    )
}

fn login_redirect(requested: &str) -> GuardOutcome {
    GuardOutcome::Redirect {
        to: Route::Login,
        return_to: Some(requested.to_string()).filter(|location| !location.trim().is_empty()),
    }
}

#[must_use]
pub fn require_authenticated(snapshot: &SessionSnapshot, requested: &str) -> GuardOutcome {
    if suspended(snapshot) {
        return GuardOutcome::Pending;
    }
    if snapshot.state == SessionState::Guest {
        return login_redirect(requested);
    }
    GuardOutcome::Render
}

#[must_use]
pub fn require_admin(snapshot: &SessionSnapshot, requested: &str) -> GuardOutcome {
    match require_authenticated(snapshot, requested) {
        GuardOutcome::Render if !snapshot.is_admin() => GuardOutcome::Redirect {
            to: Route::Dashboard,
            return_to: None,
        },
        outcome => outcome,
    }
}

/// Applies whichever guard the requested location needs. Unknown locations
/// redirect to [`default_route`].
#[must_use]
pub fn guard_location(snapshot: &SessionSnapshot, requested: &str) -> GuardOutcome {
    let Some(route) = Route::from_path(requested) else {
        if suspended(snapshot) {
            return GuardOutcome::Pending;
        }
        return GuardOutcome::Redirect {
            to: default_route(snapshot),
            return_to: None,
        };
    };
    match route.access() {
        RouteAccess::Public => GuardOutcome::Render,
        RouteAccess::Authenticated => require_authenticated(snapshot, requested),
        RouteAccess::Admin => require_admin(snapshot, requested),
    }
}

/// Landing page for the current session: login for guests, the admin
/// dashboard for admins, the user dashboard otherwise.
#[must_use]
pub fn default_route(snapshot: &SessionSnapshot) -> Route {
    if !snapshot.state.has_identity() {
        return Route::Login;
    }
    if snapshot.is_admin() {
        Route::AdminDashboard
    } else {
        Route::Dashboard
    }
}

/// Where to send the user right after a successful login.
///
/// A preserved `return_to` wins when its guard would render. Otherwise admins
/// go to the admin dashboard, sessions without role information go to the
/// dashboard, and ordinary users are sent to the address book until they have
/// at least one address. A failed address check counts as "no address".
pub async fn post_login_destination(session: &Session, return_to: Option<&str>) -> String {
    let snapshot = session.snapshot();

    if let Some(location) = return_to.map(str::trim).filter(|location| !location.is_empty())
        && Route::from_path(location).is_some()
        && guard_location(&snapshot, location) == GuardOutcome::Render
    {
        return location.to_string();
    }

    if !snapshot.state.has_identity() {
        return Route::Login.path().to_string();
    }
    if snapshot.is_admin() {
        return Route::AdminDashboard.path().to_string();
    }
    let has_role_information = snapshot
        .profile
        .as_ref()
        .is_some_and(|profile| profile.is_admin.is_some() || profile.role_id.is_some());
    if !has_role_information {
        return Route::Dashboard.path().to_string();
    }
    let epoch = session.epoch();
    let api = session.api().clone();
    let check = session
        .interceptor()
        .call(|token| {
            let api = api.clone();
            async move { api.check_address(&token).await }
        })
        .await;
    match check {
        Ok(check) if check.has_address => Route::Dashboard.path().to_string(),
        Ok(_) => Route::Addresses.path().to_string(),
        Err(error) => {
            tracing::debug!(
                target: "portal.session",
                error = %error,
                "address check failed; routing to address book",
            );
            session.observe_api_error(epoch, &error);
            Route::Addresses.path().to_string()
        }
    }
}
