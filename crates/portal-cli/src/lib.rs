#![allow(clippy::print_stdout)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use portal_api_client::PortalHttpClient;
use portal_client_core::actions::{Gated, PaymentDetails};
use portal_client_core::api::PlanRecord;
use portal_client_core::gate::{Feature, GateDecision};
use portal_client_core::guards::{GuardOutcome, guard_location, post_login_destination};
use portal_client_core::session::{Session, SessionSnapshot};
use portal_client_core::store::FileCredentialStore;
use serde::Serialize;
use serde_json::json;

pub mod config;

use config::{CliConfig, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "portal")]
#[command(about = "Account portal client: session, plans, and AI chat")]
pub struct PortalCli {
    /// Backend base URL (overrides PORTAL_API_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Credential file (overrides PORTAL_STORE_PATH)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in and store the credential
    Login(LoginArgs),
    /// Clear the stored credential
    Logout,
    /// Show the current session
    Whoami,
    /// Show feature decisions and navigation for the current session
    Features,
    /// List subscription plans
    Plans,
    /// Subscribe to a plan
    Subscribe(SubscribeArgs),
    /// Send a prompt to the AI assistant
    Chat(ChatArgs),
    /// Evaluate the route guard for a location
    Guard(GuardArgs),
    /// Change the account password
    ChangePassword(ChangePasswordArgs),
    /// Ask the backend whether the user holds a permission
    Permission(PermissionArgs),
    /// Password reset by one-time code
    ResetPassword(ResetPasswordArgs),
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    pub username: String,
    #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
    pub password: String,
    /// Location to resume after login
    #[arg(long)]
    pub return_to: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    pub plan: String,
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub reference: Option<String>,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    pub prompt: String,
}

#[derive(Args, Debug)]
pub struct GuardArgs {
    pub path: String,
}

#[derive(Args, Debug)]
pub struct ChangePasswordArgs {
    #[arg(long, env = "PORTAL_OLD_PASSWORD", hide_env_values = true)]
    pub old: String,
    #[arg(long, env = "PORTAL_NEW_PASSWORD", hide_env_values = true)]
    pub new: String,
    /// Defaults to the new password
    #[arg(long)]
    pub confirm: Option<String>,
}

#[derive(Args, Debug)]
pub struct PermissionArgs {
    pub codename: String,
}

#[derive(Args, Debug)]
pub struct ResetPasswordArgs {
    #[command(subcommand)]
    pub step: ResetStep,
}

#[derive(Subcommand, Debug)]
pub enum ResetStep {
    /// Email a one-time code
    Send { email: String },
    /// Set a new password with the emailed code
    Verify {
        email: String,
        otp: String,
        #[arg(long, env = "PORTAL_NEW_PASSWORD", hide_env_values = true)]
        new: String,
        #[arg(long)]
        confirm: Option<String>,
    },
}

pub fn load_config(cli: &PortalCli) -> Result<CliConfig, ConfigError> {
    CliConfig::from_env()?.with_overrides(cli.base_url.as_deref(), cli.store.clone())
}

pub fn build_session(config: &CliConfig) -> anyhow::Result<Session> {
    let api = Arc::new(
        PortalHttpClient::new(config.http.clone()).context("build portal http client")?,
    );
    let store = Arc::new(FileCredentialStore::open(config.store_path.clone()));
    Ok(Session::with_config(api, store, config.session_config()))
}

pub async fn run(cli: PortalCli, config: &CliConfig) -> anyhow::Result<()> {
    tracing::debug!(
        base_url = %config.base_url,
        source = config.base_url_source,
        store = %config.store_path.display(),
        "portal cli configured",
    );
    let session = build_session(config)?;
    let out = Output { json: cli.json };

    match cli.command {
        Command::Login(args) => {
            let snapshot = session.login(&args.username, &args.password).await?;
            let destination = post_login_destination(&session, args.return_to.as_deref()).await;
            out.emit(
                &json!({"session": snapshot, "destination": destination}),
                || format!("{} -> {destination}", snapshot_summary(&snapshot)),
            )
        }
        Command::Logout => {
            let snapshot = session.logout().await;
            out.emit(&snapshot, || "logged out".to_string())
        }
        Command::Whoami => {
            let snapshot = session.start().await;
            out.emit(&snapshot, || snapshot_summary(&snapshot))
        }
        Command::Features => {
            session.start().await;
            let gate = session.feature_gate();
            let decisions = [
                ("ai_chat", Feature::AiChat),
                ("edit_profile", Feature::EditProfile),
                ("change_password", Feature::ChangePassword),
                ("admin_area", Feature::AdminArea),
            ]
            .into_iter()
            .map(|(name, feature)| (name, gate.check(&feature)))
            .collect::<Vec<_>>();
            let nav = gate.nav_items();
            out.emit(
                &json!({
                    "features": decisions
                        .iter()
                        .map(|(name, decision)| json!({"feature": name, "decision": decision}))
                        .collect::<Vec<_>>(),
                    "nav": nav,
                }),
                || {
                    let mut lines = decisions
                        .iter()
                        .map(|(name, decision)| format!("{name}: {}", decision_summary(decision)))
                        .collect::<Vec<_>>();
                    lines.push(format!(
                        "nav: {}",
                        nav.iter()
                            .map(|item| item.route.path())
                            .collect::<Vec<_>>()
                            .join(" ")
                    ));
                    lines.join("\n")
                },
            )
        }
        Command::Plans => {
            let plans = session.list_plans().await?;
            out.emit(&plans, || {
                plans.iter().map(plan_summary).collect::<Vec<_>>().join("\n")
            })
        }
        Command::Subscribe(args) => {
            session.start().await;
            let snapshot = session
                .subscribe_to_plan(
                    &args.plan,
                    PaymentDetails {
                        provider: args.provider,
                        reference: args.reference,
                    },
                )
                .await?;
            out.emit(&snapshot, || snapshot_summary(&snapshot))
        }
        Command::Chat(args) => {
            session.start().await;
            match session.send_ai_prompt(&args.prompt).await? {
                Gated::Allowed(reply) => out.emit(&reply, || reply.text.clone()),
                Gated::Denied(decision) => Err(denied(&decision)),
            }
        }
        Command::Guard(args) => {
            let snapshot = session.start().await;
            let outcome = guard_location(&snapshot, &args.path);
            out.emit(&outcome, || guard_summary(&outcome))
        }
        Command::ChangePassword(args) => {
            session.start().await;
            let confirm = args.confirm.unwrap_or_else(|| args.new.clone());
            match session.change_password(&args.old, &args.new, &confirm).await? {
                Gated::Allowed(message) => out.emit(&json!({"message": message}), || message.clone()),
                Gated::Denied(decision) => Err(denied(&decision)),
            }
        }
        Command::Permission(args) => {
            let has = session.has_permission_remote(&args.codename).await?;
            out.emit(&json!({"codename": args.codename, "has": has}), || {
                format!("{}: {}", args.codename, if has { "granted" } else { "denied" })
            })
        }
        Command::ResetPassword(args) => match args.step {
            ResetStep::Send { email } => {
                session.request_password_reset(&email).await?;
                out.emit(&json!({"sent": true}), || {
                    "one-time code sent if the account exists".to_string()
                })
            }
            ResetStep::Verify {
                email,
                otp,
                new,
                confirm,
            } => {
                let confirm = confirm.unwrap_or_else(|| new.clone());
                session.verify_otp(&email, &otp, &new, &confirm).await?;
                out.emit(&json!({"reset": true}), || "password reset".to_string())
            }
        },
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize + ?Sized>(
        &self,
        value: &T,
        summary: impl FnOnce() -> String,
    ) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", summary());
        }
        Ok(())
    }
}

fn denied(decision: &GateDecision) -> anyhow::Error {
    anyhow!(decision_summary(decision))
}

pub fn snapshot_summary(snapshot: &SessionSnapshot) -> String {
    let user = snapshot
        .profile
        .as_ref()
        .map_or_else(|| "-".to_string(), |profile| profile.display_name());
    let mut line = format!(
        "{} user={user} plan={} admin={}",
        snapshot.state.as_str(),
        snapshot.current_plan_slug(),
        snapshot.is_admin()
    );
    if let Some(error) = snapshot.last_error.as_ref() {
        line.push_str(&format!(" error={}", error.message));
    }
    line
}

fn decision_summary(decision: &GateDecision) -> String {
    match decision {
        GateDecision::Allow => "allowed".to_string(),
        GateDecision::UpgradeRequired { message, .. } => format!("upgrade required ({message})"),
        GateDecision::Hidden => "hidden".to_string(),
    }
}

fn guard_summary(outcome: &GuardOutcome) -> String {
    match outcome {
        GuardOutcome::Pending => "pending".to_string(),
        GuardOutcome::Render => "render".to_string(),
        GuardOutcome::Redirect { to, return_to } => match return_to {
            Some(return_to) => format!("redirect {} (return to {return_to})", to.path()),
            None => format!("redirect {}", to.path()),
        },
    }
}

fn plan_summary(plan: &PlanRecord) -> String {
    let capabilities = plan.capabilities();
    let price = plan
        .price_cents
        .map_or_else(|| "-".to_string(), |cents| format!("{}.{:02}", cents / 100, cents % 100));
    format!(
        "{} {} price={price} ai={}",
        plan.slug,
        plan.name.as_deref().unwrap_or(plan.slug.as_str()),
        capabilities.can_use_ai
    )
}
