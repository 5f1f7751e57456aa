use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::fsops::io_atom::write_atomic;

const KEYRING_SERVICE: &str = "magpie";

/// Persisted grant material. The access token is short-lived; the refresh
/// token is what survives between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

impl StoredTokens {
    pub fn expires_on(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.expires_at)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn expires_within(&self, window_secs: i64, now: OffsetDateTime) -> bool {
        now.unix_timestamp() >= self.expires_at - window_secs
    }
}

/// OS keyring first, falling back to a mode-0600 JSON file for headless
/// machines without a secret-service backend.
pub struct TokenStore {
    account: String,
    fallback_path: PathBuf,
    use_keyring: bool,
}

impl TokenStore {
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        let fallback_path = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/magpie/tokens.json");
        Self {
            account,
            fallback_path,
            use_keyring: true,
        }
    }

    /// File-backed only; used by tests and honored when no keyring exists.
    pub fn file_only(account: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            account: account.into(),
            fallback_path: path.into(),
            use_keyring: false,
        }
    }

    fn entry(&self) -> Option<keyring::Entry> {
        if !self.use_keyring {
            return None;
        }
        keyring::Entry::new(KEYRING_SERVICE, &self.account).ok()
    }

    pub fn load(&self) -> Result<Option<StoredTokens>> {
        if let Some(entry) = self.entry() {
            match entry.get_password() {
                Ok(raw) => {
                    return serde_json::from_str(&raw)
                        .map(Some)
                        .map_err(|err| Error::Auth(format!("stored token is unreadable: {err}")));
                }
                Err(keyring::Error::NoEntry) => {}
                Err(_) => {} // backend unavailable; fall through to the file
            }
        }
        self.load_file()
    }

    fn load_file(&self) -> Result<Option<StoredTokens>> {
        if !self.fallback_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.fallback_path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| Error::Auth(format!("stored token is unreadable: {err}")))
    }

    pub fn save(&self, tokens: &StoredTokens) -> Result<()> {
        let raw = serde_json::to_string(tokens)
            .map_err(|err| Error::Auth(format!("token serialization failed: {err}")))?;
        if let Some(entry) = self.entry() {
            if entry.set_password(&raw).is_ok() {
                return Ok(());
            }
        }
        write_atomic(&self.fallback_path, raw.as_bytes())?;
        restrict_permissions(&self.fallback_path)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if let Some(entry) = self.entry() {
            match entry.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(_) => {}
            }
        }
        if self.fallback_path.exists() {
            std::fs::remove_file(&self.fallback_path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
