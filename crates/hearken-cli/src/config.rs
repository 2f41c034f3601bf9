//! Configuration – reads/writes `~/.hearken/config.toml`.

use hearken_types::{BrokerConfig, BusError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

/// Which backend the shell drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process bus; nothing leaves the process.
    #[default]
    Memory,
    /// Broker adapter wired to the in-process loopback broker.
    Loopback,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Loopback => write!(f, "loopback"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "loopback" => Ok(BackendKind::Loopback),
            other => Err(BusError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Persisted user configuration stored in `~/.hearken/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    /// Broker connection settings, used by the `loopback` backend.
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Return the path to `~/.hearken/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".hearken").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HEARKEN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HEARKEN_BACKEND` | `backend` |
/// | `HEARKEN_BROKER_HOST` | `broker.host` |
/// | `HEARKEN_BROKER_PORT` | `broker.port` |
/// | `HEARKEN_KEEPALIVE` | `broker.keepalive_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HEARKEN_BACKEND")
        && let Ok(kind) = v.parse::<BackendKind>()
    {
        cfg.backend = kind;
    }
    if let Ok(v) = std::env::var("HEARKEN_BROKER_HOST") {
        cfg.broker.host = v;
    }
    if let Ok(v) = std::env::var("HEARKEN_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker.port = port;
    }
    if let Ok(v) = std::env::var("HEARKEN_KEEPALIVE")
        && let Ok(secs) = v.parse::<u16>()
    {
        cfg.broker.keepalive_secs = secs;
    }
}

/// Save the config to disk, creating `~/.hearken/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
