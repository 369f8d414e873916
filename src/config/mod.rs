//! Configuration loading.
//!
//! Layered through the `config` crate: an optional `config.{toml,json,yaml}`
//! in the platform config directory, overridden by `TONEBRIDGE`-prefixed
//! environment variables with `__` as the section separator
//! (e.g. `TONEBRIDGE__HQPLAYER__HOST=10.0.0.5`). The enable flags decide
//! which adapters the coordinator instantiates; a disabled adapter never
//! starts.

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfig {
    /// Seconds the coordinator waits for shutdown ACKs.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    #[serde(default)]
    pub hqplayer: Option<HqpConfig>,

    #[serde(default)]
    pub lms: Option<LmsConfig>,
}

fn default_grace_secs() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct HqpConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub host: String,
    /// Control port; the DSP listens on 4321.
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct LmsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BridgeConfig {
    pub fn hqp_enabled(&self) -> bool {
        self.hqplayer.as_ref().map(|c| c.enabled).unwrap_or(false)
    }

    pub fn lms_enabled(&self) -> bool {
        self.lms.as_ref().map(|c| c.enabled).unwrap_or(false)
    }

    pub fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_secs)
    }
}

/// Platform config directory, overridable via `TONEBRIDGE_CONFIG_DIR`.
pub fn config_dir() -> std::path::PathBuf {
    if let Ok(dir) = std::env::var("TONEBRIDGE_CONFIG_DIR") {
        return std::path::PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join("Library/Application Support/tonebridge");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return std::path::PathBuf::from(xdg).join("tonebridge");
        }
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join(".config/tonebridge");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return std::path::PathBuf::from(appdata).join("tonebridge");
        }
    }

    std::path::PathBuf::from(".")
}

pub fn load_config() -> Result<BridgeConfig> {
    let dir = config_dir();

    let config = ::config::Config::builder()
        .add_source(
            ::config::File::with_name(&dir.join("config").to_string_lossy()).required(false),
        )
        .add_source(
            ::config::Environment::with_prefix("TONEBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_everything() {
        let cfg = BridgeConfig::default();
        assert!(!cfg.hqp_enabled());
        assert!(!cfg.lms_enabled());
    }

    #[test]
    fn enable_flag_defaults_to_true_when_section_present() {
        let cfg: BridgeConfig = serde_json::from_value(serde_json::json!({
            "hqplayer": { "host": "10.0.0.5" }
        }))
        .unwrap();
        assert!(cfg.hqp_enabled());
        assert!(!cfg.lms_enabled());
        assert_eq!(cfg.grace_secs, 5);
    }

    #[test]
    fn explicit_disable_wins() {
        let cfg: BridgeConfig = serde_json::from_value(serde_json::json!({
            "hqplayer": { "host": "10.0.0.5", "enabled": false },
            "lms": { "host": "10.0.0.6", "port": 9002, "enabled": true },
            "grace_secs": 8
        }))
        .unwrap();
        assert!(!cfg.hqp_enabled());
        assert!(cfg.lms_enabled());
        assert_eq!(cfg.grace().as_secs(), 8);
        assert_eq!(cfg.lms.unwrap().port, Some(9002));
    }
}
