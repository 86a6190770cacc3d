use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::engine::{Engine, EngineError};
use crate::model::{BusinessProfile, InventoryItem};
use crate::provider::{BusyInterval, StaticBusyProvider};

/// Server settings, read from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared secret clients must present with `auth`. Unset means open.
    pub token: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub provider_timeout: Duration,
    /// Commits per customer and business per window. `None` disables the gate.
    pub rate_limit: Option<u32>,
    pub rate_window: Duration,
    pub metrics_port: Option<u16>,
    pub seed: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            token: None,
            max_connections: 256,
            compact_threshold: 1000,
            provider_timeout: crate::engine::DEFAULT_PROVIDER_TIMEOUT,
            rate_limit: Some(30),
            rate_window: Duration::from_secs(60),
            metrics_port: None,
            seed: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default
    /// with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("ignoring {key}={raw:?}: not a number");
                    None
                }
            }
        }

        let rate_limit = match number::<u32>("SLOTWISE_RATE_LIMIT", parsed("SLOTWISE_RATE_LIMIT")) {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.rate_limit,
        };

        Self {
            port: number("SLOTWISE_PORT", parsed("SLOTWISE_PORT")).unwrap_or(defaults.port),
            bind: parsed("SLOTWISE_BIND").unwrap_or(defaults.bind),
            data_dir: parsed("SLOTWISE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            token: parsed("SLOTWISE_TOKEN"),
            max_connections: number("SLOTWISE_MAX_CONNECTIONS", parsed("SLOTWISE_MAX_CONNECTIONS"))
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: number("SLOTWISE_COMPACT_THRESHOLD", parsed("SLOTWISE_COMPACT_THRESHOLD"))
                .unwrap_or(defaults.compact_threshold),
            provider_timeout: number("SLOTWISE_PROVIDER_TIMEOUT_MS", parsed("SLOTWISE_PROVIDER_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.provider_timeout),
            rate_limit,
            rate_window: number("SLOTWISE_RATE_WINDOW_SECS", parsed("SLOTWISE_RATE_WINDOW_SECS"))
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_window),
            metrics_port: number("SLOTWISE_METRICS_PORT", parsed("SLOTWISE_METRICS_PORT")),
            seed: parsed("SLOTWISE_SEED").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }
}

#[derive(Debug)]
pub enum SeedError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Rejected(EngineError),
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedError::Io(e) => write!(f, "reading seed file: {e}"),
            SeedError::Parse(e) => write!(f, "parsing seed file: {e}"),
            SeedError::Rejected(e) => write!(f, "applying seed: {e}"),
        }
    }
}

impl std::error::Error for SeedError {}

/// Businesses, items and static busy calendars loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub businesses: Vec<BusinessProfile>,
    #[serde(default)]
    pub items: Vec<InventoryItem>,
    /// Calendar id to busy intervals, served by the in-memory provider.
    #[serde(default)]
    pub busy: HashMap<String, Vec<BusyInterval>>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path).map_err(SeedError::Io)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        serde_json::from_str(raw).map_err(SeedError::Parse)
    }

    /// Upsert everything into the engine and load busy data into `provider`.
    pub async fn apply(self, engine: &Engine, provider: &StaticBusyProvider) -> Result<(), SeedError> {
        for (calendar_id, busy) in self.busy {
            provider.set_busy(&calendar_id, busy);
        }
        for profile in self.businesses {
            engine.upsert_business(profile).await.map_err(SeedError::Rejected)?;
        }
        for item in self.items {
            engine.upsert_item(item).await.map_err(SeedError::Rejected)?;
        }
        Ok(())
    }
}
