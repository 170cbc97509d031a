//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where worker activations run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// A dedicated OS thread per activation.
    #[default]
    Thread,
    /// Tokio's blocking pool on the current runtime.
    Tokio,
}

impl SpawnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMode::Thread => "thread",
            SpawnMode::Tokio => "tokio",
        }
    }
}

impl std::fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpawnMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(SpawnMode::Thread),
            "tokio" => Ok(SpawnMode::Tokio),
            other => Err(Error::Config(format!(
                "unknown spawn mode {other:?} (expected \"thread\" or \"tokio\")"
            ))),
        }
    }
}

/// Per-gatherer settings consumed by [`GathererBuilder::from_config`].
///
/// [`GathererBuilder::from_config`]: crate::gatherer::GathererBuilder::from_config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GathererConfig {
    /// Used in thread names, spans, logs and metric labels.
    pub name: String,
    pub spawn: SpawnMode,
}

impl Default for GathererConfig {
    fn default() -> Self {
        Self {
            name: "gatherer".to_string(),
            spawn: SpawnMode::Thread,
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub gatherer: GathererConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = GathererConfig::default();
        let spawn = match std::env::var("GATHER_SPAWN") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.spawn,
        };
        let name = match std::env::var("GATHER_NAME") {
            Ok(value) if value.trim().is_empty() => {
                return Err(Error::Config("GATHER_NAME must not be empty".to_string()));
            }
            Ok(value) => value,
            Err(_) => defaults.name,
        };

        Ok(Self {
            gatherer: GathererConfig { name, spawn },
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
