#![cfg_attr(test, allow(clippy::expect_used))]

pub mod actions;
pub mod api;
pub mod auth;
pub mod entitlements;
pub mod error;
pub mod gate;
pub mod guards;
pub mod interceptor;
pub mod profile;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use actions::{ActionError, AiReply, Gated, PaymentDetails};
pub use api::PortalApi;
pub use auth::{AuthInputError, Credential};
pub use entitlements::{EntitlementSet, Subscription, resolve};
pub use error::{ApiError, ApiErrorKind};
pub use gate::{Feature, FeatureGate, GateDecision};
pub use guards::{GuardOutcome, Route};
pub use interceptor::TokenRefreshInterceptor;
pub use profile::CanonicalProfile;
pub use session::{Session, SessionConfig, SessionError, SessionSnapshot, SessionState};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError};
