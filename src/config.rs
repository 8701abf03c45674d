//! Loading relay configuration (backend location, timeouts, poll schedule) from TOML.
//!
//! See `RelayConfig` for the expected schema. Environment variables override
//! the file: QUESTGEN_BACKEND_URL, PORT.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::schedule::BackoffPolicy;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
  /// Base URL that `/jobs` and `/jobs/{id}` are appended to.
  pub backend_url: String,
  pub port: u16,
  pub submit_timeout_secs: u64,
  pub poll_timeout_secs: u64,
  pub backoff: BackoffPolicy,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      backend_url: "http://localhost:8080/api".into(),
      port: 3000,
      submit_timeout_secs: 30,
      poll_timeout_secs: 30,
      backoff: BackoffPolicy::default(),
    }
  }
}

impl RelayConfig {
  pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
    toml::from_str(s)
  }

  pub fn submit_timeout(&self) -> Duration { Duration::from_secs(self.submit_timeout_secs) }

  pub fn poll_timeout(&self) -> Duration { Duration::from_secs(self.poll_timeout_secs) }

  /// Apply overrides from a variable lookup. Unparseable values are ignored.
  pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
    if let Some(url) = var("QUESTGEN_BACKEND_URL").filter(|u| !u.trim().is_empty()) {
      self.backend_url = url.trim().to_string();
    }
    if let Some(port) = var("PORT").and_then(|p| p.parse::<u16>().ok()) {
      self.port = port;
    }
  }
}

/// Load from QUESTGEN_CONFIG_PATH (if set) plus env overrides. On any
/// read/parse error the defaults are used.
pub fn load_config_from_env() -> RelayConfig {
  let mut cfg = match std::env::var("QUESTGEN_CONFIG_PATH") {
    Ok(path) => match std::fs::read_to_string(&path) {
      Ok(s) => match RelayConfig::from_toml(&s) {
        Ok(cfg) => {
          info!(target: "questgen_relay", %path, "Loaded relay config (TOML)");
          cfg
        }
        Err(e) => {
          error!(target: "questgen_relay", %path, error = %e, "Failed to parse TOML config; using defaults");
          RelayConfig::default()
        }
      },
      Err(e) => {
        error!(target: "questgen_relay", %path, error = %e, "Failed to read TOML config file; using defaults");
        RelayConfig::default()
      }
    },
    Err(_) => RelayConfig::default(),
  };
  cfg.apply_overrides(|k| std::env::var(k).ok());
  cfg
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_file_keeps_defaults() {
    let cfg = RelayConfig::from_toml(
      r#"
        backend_url = "https://quests.example.org/api"
        [backoff]
        max_attempts = 10
      "#,
    )
    .expect("parse");
    assert_eq!(cfg.backend_url, "https://quests.example.org/api");
    assert_eq!(cfg.submit_timeout_secs, 30);
    assert_eq!(cfg.backoff.max_attempts, 10);
    assert_eq!(cfg.backoff.base_delay_ms, 3_000);
    assert_eq!(cfg.backoff.max_delay_ms, 15_000);
  }

  #[test]
  fn bad_types_are_rejected() {
    assert!(RelayConfig::from_toml("port = \"eighty\"").is_err());
  }

  #[test]
  fn env_overrides_win() {
    let mut cfg = RelayConfig::default();
    cfg.apply_overrides(|k| match k {
      "QUESTGEN_BACKEND_URL" => Some("http://backend:9000".into()),
      "PORT" => Some("not-a-port".into()),
      _ => None,
    });
    assert_eq!(cfg.backend_url, "http://backend:9000");
    assert_eq!(cfg.port, 3000);
  }
}
