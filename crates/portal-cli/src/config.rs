use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;

use portal_api_client::{PortalHttpClientConfig, clamp_timeout};
use portal_client_core::auth::{AuthInputError, normalize_base_url, resolve_api_base_url};
use portal_client_core::session::SessionConfig;
use portal_client_core::store::default_credential_path;
use thiserror::Error;

pub const ENV_STORE_PATH: &str = "PORTAL_STORE_PATH";
pub const ENV_LOG: &str = "PORTAL_LOG";
pub const ENV_HTTP_TIMEOUT_MS: &str = "PORTAL_HTTP_TIMEOUT_MS";
pub const ENV_PROFILE_TIMEOUT_MS: &str = "PORTAL_PROFILE_TIMEOUT_MS";
pub const ENV_CHAT_TIMEOUT_MS: &str = "PORTAL_CHAT_TIMEOUT_MS";

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid api base url: {0}")]
    BaseUrl(#[from] AuthInputError),
    #[error("invalid {key} value '{value}': {source}")]
    InvalidTimeout {
        key: &'static str,
        value: String,
        source: ParseIntError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    pub base_url: String,
    pub base_url_source: &'static str,
    pub store_path: PathBuf,
    pub log_filter: String,
    pub http: PortalHttpClientConfig,
}

impl CliConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let (base_url, base_url_source) = resolve_api_base_url()?;

        let store_path = env_non_empty(ENV_STORE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(default_credential_path);

        let log_filter = env_non_empty(ENV_LOG)
            .or_else(|| env_non_empty("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let mut http = PortalHttpClientConfig::new(base_url.as_str());
        if let Some(timeout_ms) = parse_millis(ENV_HTTP_TIMEOUT_MS)? {
            http.timeout_ms = timeout_ms;
        }
        if let Some(timeout_ms) = parse_millis(ENV_PROFILE_TIMEOUT_MS)? {
            http.profile_timeout_ms = timeout_ms;
        }
        if let Some(timeout_ms) = parse_millis(ENV_CHAT_TIMEOUT_MS)? {
            http.chat_timeout_ms = timeout_ms;
        }

        Ok(Self {
            base_url,
            base_url_source,
            store_path,
            log_filter,
            http,
        })
    }

    /// Applies command-line flags on top of the environment.
    pub fn with_overrides(
        mut self,
        base_url: Option<&str>,
        store_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if let Some(base_url) = base_url {
            self.base_url = normalize_base_url(base_url)?;
            self.base_url_source = "flag";
            self.http.base_url.clone_from(&self.base_url);
        }
        if let Some(store_path) = store_path {
            self.store_path = store_path;
        }
        Ok(self)
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            profile_timeout: clamp_timeout(self.http.profile_timeout_ms),
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_millis(key: &'static str) -> Result<Option<u64>, ConfigError> {
    env_non_empty(key)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|source| ConfigError::InvalidTimeout { key, value, source })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const KEYS: [&str; 8] = [
        "PORTAL_API_BASE_URL",
        "VITE_API_BASE_URL",
        ENV_STORE_PATH,
        ENV_LOG,
        "RUST_LOG",
        ENV_HTTP_TIMEOUT_MS,
        ENV_PROFILE_TIMEOUT_MS,
        ENV_CHAT_TIMEOUT_MS,
    ];

    fn with_env<T>(vars: &[(&str, &str)], test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = KEYS
            .iter()
            .map(|key| (*key, env::var(key).ok()))
            .collect::<Vec<_>>();
        for key in KEYS {
            let value = vars
                .iter()
                .find(|(candidate, _)| *candidate == key)
                .map(|(_, value)| *value);
            set_or_remove(key, value);
        }

        let result = test();

        for (key, value) in previous {
            set_or_remove(key, value.as_deref());
        }
        result
    }

    fn set_or_remove(key: &str, value: Option<&str>) {
        if let Some(value) = value {
            unsafe { env::set_var(key, value) };
        } else {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = with_env(&[], CliConfig::from_env).expect("config");
        assert_eq!(config.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.base_url_source, "default_local");
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.store_path, default_credential_path());
        assert_eq!(config.session_config().profile_timeout, Duration::from_secs(8));
    }

    #[test]
    fn portal_log_wins_over_rust_log() {
        let config = with_env(
            &[(ENV_LOG, "portal.session=debug"), ("RUST_LOG", "warn")],
            CliConfig::from_env,
        )
        .expect("config");
        assert_eq!(config.log_filter, "portal.session=debug");

        let fallback = with_env(&[("RUST_LOG", "warn")], CliConfig::from_env).expect("config");
        assert_eq!(fallback.log_filter, "warn");
    }

    #[test]
    fn timeouts_and_store_path_are_read_from_environment() {
        let config = with_env(
            &[
                (ENV_STORE_PATH, "/tmp/portal/creds.json"),
                (ENV_PROFILE_TIMEOUT_MS, "1500"),
                (ENV_CHAT_TIMEOUT_MS, "45000"),
            ],
            CliConfig::from_env,
        )
        .expect("config");
        assert_eq!(config.store_path, PathBuf::from("/tmp/portal/creds.json"));
        assert_eq!(config.http.profile_timeout_ms, 1_500);
        assert_eq!(config.http.chat_timeout_ms, 45_000);
        assert_eq!(
            config.session_config().profile_timeout,
            Duration::from_millis(1_500)
        );
    }

    #[test]
    fn zero_profile_timeout_is_floored() {
        let config =
            with_env(&[(ENV_PROFILE_TIMEOUT_MS, "0")], CliConfig::from_env).expect("config");
        assert_eq!(
            config.session_config().profile_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn malformed_timeout_is_rejected() {
        let result = with_env(&[(ENV_HTTP_TIMEOUT_MS, "soon")], CliConfig::from_env);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidTimeout {
                key: ENV_HTTP_TIMEOUT_MS,
                ..
            })
        ));
    }

    #[test]
    fn flag_overrides_replace_environment_values() {
        let config = with_env(&[("PORTAL_API_BASE_URL", "https://env.example.com")], || {
            CliConfig::from_env()?.with_overrides(
                Some("https://flag.example.com/"),
                Some(PathBuf::from("/tmp/other.json")),
            )
        })
        .expect("config");
        assert_eq!(config.base_url, "https://flag.example.com");
        assert_eq!(config.http.base_url, "https://flag.example.com");
        assert_eq!(config.base_url_source, "flag");
        assert_eq!(config.store_path, PathBuf::from("/tmp/other.json"));

        let rejected = with_env(&[], || {
            CliConfig::from_env()?.with_overrides(Some("ftp://nope"), None)
        });
        assert!(matches!(rejected, Err(ConfigError::BaseUrl(_))));
    }
}
