//! Daemon registry: the ordered list of supervisors the client may talk to.
//!
//! The registry is read from `daemons.toml`. Writing it back is handled by
//! whatever provisioning tool owns the file; this crate only consumes it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

pub const LOCAL_DAEMON: &str = "local";
pub const REGISTRY_FILE: &str = "daemons.toml";
pub const SOCKET_FILE: &str = "fleetd.sock";

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read daemon registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse daemon registry: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("daemon '{name}': {reason}")]
    InvalidAddress { name: String, reason: String },
}

/// One daemon connection entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl DaemonConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            auth_token: String::new(),
            enabled: true,
            provider: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRegistry {
    #[serde(default)]
    pub daemons: Vec<DaemonConfig>,
}

impl DaemonRegistry {
    pub fn new(daemons: Vec<DaemonConfig>) -> Self {
        Self { daemons }
    }

    /// Load from the default location, adding the implicit `local` daemon.
    pub fn load() -> Result<Self, RegistryError> {
        Self::load_from(&default_registry_path())
    }

    /// Load from `path`. A missing file yields a registry holding only `local`.
    pub fn load_from(path: &Path) -> Result<Self, RegistryError> {
        let registry = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "daemon registry missing, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(RegistryError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Ok(registry.with_local_default())
    }

    /// Parse registry TOML and expand `${VAR}` references in auth tokens.
    pub fn from_toml(raw: &str) -> Result<Self, RegistryError> {
        let mut registry: DaemonRegistry = toml::from_str(raw)?;
        for daemon in &mut registry.daemons {
            daemon.auth_token = expand_env_vars(&daemon.auth_token);
        }
        Ok(registry)
    }

    /// Prepend the implicit `local` daemon unless one is already defined.
    pub fn with_local_default(mut self) -> Self {
        if self.get(LOCAL_DAEMON).is_none() {
            let address = format!("{UNIX_SCHEME}{}", default_socket_path().display());
            self.daemons.insert(0, DaemonConfig::new(LOCAL_DAEMON, address));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&DaemonConfig> {
        self.daemons.iter().find(|d| d.name == name)
    }

    /// Enabled daemons in stored order.
    pub fn enabled(&self) -> impl Iterator<Item = &DaemonConfig> {
        self.daemons.iter().filter(|d| d.enabled)
    }

    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }

    /// Check every entry's address.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for daemon in &self.daemons {
            validate_address(&daemon.address).map_err(|reason| RegistryError::InvalidAddress {
                name: daemon.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// Resolve the registry path: `$FLEETD_REGISTRY`, then `$FLEETD_HOME`, then
/// `~/.config/fleetd`.
pub fn default_registry_path() -> PathBuf {
    if let Some(path) = non_empty_env("FLEETD_REGISTRY") {
        return PathBuf::from(path);
    }
    if let Some(home) = non_empty_env("FLEETD_HOME") {
        return PathBuf::from(home).join(REGISTRY_FILE);
    }
    let home = non_empty_env("HOME").unwrap_or_else(|| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("fleetd")
        .join(REGISTRY_FILE)
}

pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(SOCKET_FILE)
}

/// Addresses must be non-empty and use the `unix://` or `tcp://` scheme.
pub fn validate_address(address: &str) -> Result<(), String> {
    if address.trim().is_empty() {
        return Err("address cannot be empty".to_string());
    }
    if !address.starts_with(UNIX_SCHEME) && !address.starts_with(TCP_SCHEME) {
        return Err(format!(
            "address must start with '{UNIX_SCHEME}' or '{TCP_SCHEME}', got: {address}"
        ));
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_var_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Expand `${NAME}` references; unset variables expand to the empty string.
pub fn expand_env_vars(input: &str) -> String {
    if !input.contains("${") {
        return input.to_string();
    }
    let Some(re) = env_var_pattern() else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
