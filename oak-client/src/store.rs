//! On-disk token store.
//!
//! Persists the key id a client bootstrapped with and the latest token the
//! server issued for it. The file holds a live credential, so it is written
//! with owner-only permissions and replaced atomically.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Persisted client state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    /// Key id the client bootstrapped with.
    pub key_id: String,
    /// Latest server-issued token; absent right after `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// When this entry was written (Unix timestamp)
    pub updated_at: i64,
}

impl StoredToken {
    /// A new entry stamped with the current time.
    #[must_use]
    pub fn new(key_id: impl Into<String>, token: Option<String>) -> Self {
        Self {
            key_id: key_id.into(),
            token,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Token file handle.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store backed by `path`. Nothing is read until [`load`](Self::load).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored entry, if any.
    pub fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token store at {}", self.path.display()))?;
        let stored: StoredToken = toml::from_str(&content)
            .with_context(|| format!("Failed to parse token store at {}", self.path.display()))?;
        Ok(Some(stored))
    }

    /// Read the stored entry, failing if the client never ran `init`.
    pub fn require(&self) -> Result<StoredToken> {
        self.load()?.with_context(|| {
            format!(
                "No token stored at {}; run `oak init` first",
                self.path.display()
            )
        })
    }

    /// Replace the stored entry.
    pub fn save(&self, stored: &StoredToken) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }

        let content = toml::to_string_pretty(stored).context("Failed to serialize token store")?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write token store to {}", tmp.display()))?;

        // Set restrictive permissions before the token becomes visible
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace token store at {}", self.path.display()))?;
        Ok(())
    }
}
