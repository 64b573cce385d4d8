//! Persisted client state: credential pair, cached profile snapshot and the
//! opaque reference tables (permission/message lookups).
//!
//! Stores are pure storage. They never validate tokens and never touch the
//! network, so they are safe to open before anything else runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Credential;
use crate::profile::CanonicalProfile;

const CREDENTIAL_SCHEMA_VERSION: u32 = 1;
pub const CREDENTIAL_FILE_NAME: &str = "credentials.v1.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to prepare credential store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode credential store payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write credential store payload {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to finalize credential store payload {path}: {source}")]
    Rename {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Credential;

    fn set(&self, credential: Credential) -> Result<(), StoreError>;

    /// Wipes everything: tokens, cached profile and reference tables.
    fn clear(&self) -> Result<(), StoreError>;

    fn cached_profile(&self) -> Option<CanonicalProfile>;

    fn set_cached_profile(&self, profile: Option<CanonicalProfile>) -> Result<(), StoreError>;

    fn reference_tables(&self) -> Option<Value>;

    fn set_reference_tables(&self, tables: Option<Value>) -> Result<(), StoreError>;

    /// Swaps the access token if `expected` is still the stored one, keeping
    /// the stored refresh token unless a rotated one is supplied. Returns
    /// `None` when the credential was replaced in the meantime.
    fn swap_access_token(
        &self,
        expected: &str,
        access_token: &str,
        rotated_refresh_token: Option<String>,
    ) -> Result<Option<Credential>, StoreError>;

    /// Wipes everything if `expected` is still the stored access token.
    fn clear_if_current(&self, expected: Option<&str>) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoredState {
    credential: Credential,
    cached_profile: Option<CanonicalProfile>,
    reference_tables: Option<Value>,
}

impl StoredState {
    fn swap_access_token(
        &mut self,
        expected: &str,
        access_token: &str,
        rotated_refresh_token: Option<String>,
    ) -> Option<Credential> {
        if self.credential.access_token() != Some(expected) {
            return None;
        }
        let refresh_token = rotated_refresh_token
            .or_else(|| self.credential.refresh_token().map(ToString::to_string));
        self.credential = Credential::new(access_token, refresh_token);
        Some(self.credential.clone())
    }

    fn clear_if_current(&mut self, expected: Option<&str>) -> bool {
        if self.credential.access_token() != expected {
            return false;
        }
        *self = Self::default();
        true
    }
}

fn lock_state(state: &Mutex<StoredState>) -> MutexGuard<'_, StoredState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<StoredState>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: Mutex::new(StoredState {
                credential,
                ..StoredState::default()
            }),
        }
    }

    #[must_use]
    pub fn with_cached_profile(self, profile: CanonicalProfile) -> Self {
        lock_state(&self.state).cached_profile = Some(profile);
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Credential {
        lock_state(&self.state).credential.clone()
    }

    fn set(&self, credential: Credential) -> Result<(), StoreError> {
        lock_state(&self.state).credential = credential;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *lock_state(&self.state) = StoredState::default();
        Ok(())
    }

    fn cached_profile(&self) -> Option<CanonicalProfile> {
        lock_state(&self.state).cached_profile.clone()
    }

    fn set_cached_profile(&self, profile: Option<CanonicalProfile>) -> Result<(), StoreError> {
        lock_state(&self.state).cached_profile = profile;
        Ok(())
    }

    fn reference_tables(&self) -> Option<Value> {
        lock_state(&self.state).reference_tables.clone()
    }

    fn set_reference_tables(&self, tables: Option<Value>) -> Result<(), StoreError> {
        lock_state(&self.state).reference_tables = tables;
        Ok(())
    }

    fn swap_access_token(
        &self,
        expected: &str,
        access_token: &str,
        rotated_refresh_token: Option<String>,
    ) -> Result<Option<Credential>, StoreError> {
        Ok(lock_state(&self.state).swap_access_token(
            expected,
            access_token,
            rotated_refresh_token,
        ))
    }

    fn clear_if_current(&self, expected: Option<&str>) -> Result<bool, StoreError> {
        Ok(lock_state(&self.state).clear_if_current(expected))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialDocument {
    version: u32,
    #[serde(flatten)]
    state: StoredState,
    updated_at: String,
}

/// JSON-file backed store. Every mutation rewrites the whole document through
/// a temp file and a rename.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<StoredState>,
}

impl FileCredentialStore {
    pub fn open_default() -> Self {
        Self::open(default_credential_path())
    }

    pub fn open(path: PathBuf) -> Self {
        let state = load_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoredState)) -> Result<(), StoreError> {
        let mut guard = lock_state(&self.state);
        apply(&mut guard);
        persist_state(&self.path, &guard)
    }

    /// Persists only when `apply` reports a change.
    fn mutate_if<T>(
        &self,
        apply: impl FnOnce(&mut StoredState) -> Option<T>,
    ) -> Result<Option<T>, StoreError> {
        let mut guard = lock_state(&self.state);
        let Some(outcome) = apply(&mut guard) else {
            return Ok(None);
        };
        persist_state(&self.path, &guard)?;
        Ok(Some(outcome))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Credential {
        lock_state(&self.state).credential.clone()
    }

    fn set(&self, credential: Credential) -> Result<(), StoreError> {
        self.mutate(|state| state.credential = credential)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.mutate(|state| *state = StoredState::default())
    }

    fn cached_profile(&self) -> Option<CanonicalProfile> {
        lock_state(&self.state).cached_profile.clone()
    }

    fn set_cached_profile(&self, profile: Option<CanonicalProfile>) -> Result<(), StoreError> {
        self.mutate(|state| state.cached_profile = profile)
    }

    fn reference_tables(&self) -> Option<Value> {
        lock_state(&self.state).reference_tables.clone()
    }

    fn set_reference_tables(&self, tables: Option<Value>) -> Result<(), StoreError> {
        self.mutate(|state| state.reference_tables = tables)
    }

    fn swap_access_token(
        &self,
        expected: &str,
        access_token: &str,
        rotated_refresh_token: Option<String>,
    ) -> Result<Option<Credential>, StoreError> {
        self.mutate_if(|state| {
            state.swap_access_token(expected, access_token, rotated_refresh_token)
        })
    }

    fn clear_if_current(&self, expected: Option<&str>) -> Result<bool, StoreError> {
        Ok(self
            .mutate_if(|state| state.clear_if_current(expected).then_some(()))?
            .is_some())
    }
}

fn load_state(path: &Path) -> StoredState {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return StoredState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "portal.store",
                path = %path.display(),
                error = %error,
                "failed to read credential store; starting with empty state",
            );
            return StoredState::default();
        }
    };

    match serde_json::from_str::<CredentialDocument>(&raw) {
        Ok(document) if document.version == CREDENTIAL_SCHEMA_VERSION => document.state,
        Ok(document) => {
            tracing::warn!(
                target: "portal.store",
                path = %path.display(),
                version = document.version,
                "unsupported credential store version; starting with empty state",
            );
            StoredState::default()
        }
        Err(error) => {
            tracing::warn!(
                target: "portal.store",
                path = %path.display(),
                error = %error,
                "failed to parse credential store; starting with empty state",
            );
            StoredState::default()
        }
    }
}

fn persist_state(path: &Path, state: &StoredState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let payload = serde_json::to_vec_pretty(&CredentialDocument {
        version: CREDENTIAL_SCHEMA_VERSION,
        state: state.clone(),
        updated_at: Utc::now().to_rfc3339(),
    })?;
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

    fs::write(&temp_path, payload).map_err(|source| StoreError::Write {
        path: temp_path.clone(),
        source,
    })?;
    fs::rename(&temp_path, path).map_err(|source| StoreError::Rename {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[must_use]
pub fn default_credential_path() -> PathBuf {
    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("portal");
        data_dir.push(CREDENTIAL_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".portal");
        home_dir.push(CREDENTIAL_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(CREDENTIAL_FILE_NAME)
}
