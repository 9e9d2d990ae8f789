//! Client configuration.
//!
//! Read from `config.toml` in the platform config directory, or from the file
//! named by `--config` / `OAK_CONFIG`. Every key is optional.
//!
//! ```toml
//! gpg_program = "gpg2"
//! gpg_homedir = "/home/alice/.gnupg-oak"
//! provider_timeout_secs = 30
//! token_path = "/home/alice/.local/share/oak/token.toml"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use oak_auth::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::gpg::GpgProvider;

/// Default bound on one gpg invocation.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// gpg binary to run.
    pub gpg_program: PathBuf,
    /// Keyring directory (`--homedir`); gpg's default when unset.
    pub gpg_homedir: Option<PathBuf>,
    /// Upper bound on each gpg invocation, in seconds.
    pub provider_timeout_secs: u64,
    /// Where the current token is kept; under the data directory when unset.
    pub token_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gpg_program: PathBuf::from("gpg"),
            gpg_homedir: None,
            provider_timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            token_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = Self::default_path()?;
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        anyhow::ensure!(
            config.provider_timeout_secs > 0,
            "provider_timeout_secs must be positive in {}",
            path.display()
        );
        Ok(config)
    }

    /// `config.toml` in the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Token file location.
    pub fn token_path(&self) -> Result<PathBuf> {
        match &self.token_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("token.toml")),
        }
    }

    /// Per-call provider timeout.
    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            provider_timeout: self.provider_timeout(),
        }
    }

    /// A gpg provider for this configuration.
    #[must_use]
    pub fn gpg_provider(&self, passphrase: Option<&str>) -> GpgProvider {
        let mut provider =
            GpgProvider::new(&self.gpg_program).with_timeout(self.provider_timeout());
        if let Some(homedir) = &self.gpg_homedir {
            provider = provider.with_homedir(homedir);
        }
        if let Some(passphrase) = passphrase {
            provider = provider.with_passphrase(passphrase);
        }
        provider
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "oak", "oak").context("Could not determine config directory")
}
