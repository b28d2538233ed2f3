//! Configuration management for the hedge node.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{Error, Result};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this client process; positions and actions it owns carry it.
    pub client_id: String,
    /// Broker accounts this process manages.
    pub owned_accounts: Vec<String>,
    pub lock: LockConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub hedge: HedgeConfig,
    pub bus: BusConfig,
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub stale_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconcile_interval_secs: u64,
    pub command_timeout_ms: u64,
    pub max_subscription_errors: u32,
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub refresh_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HedgeConfig {
    pub analysis_interval_secs: u64,
    pub fully_hedged_threshold: Decimal,
    pub rebalance_threshold: Decimal,
    pub high_priority_net_lots: Decimal,
    pub excess_cleanup_lots: Decimal,
    pub sync_tolerance_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: "hedge-node".to_string(),
            owned_accounts: Vec::new(),
            lock: LockConfig::default(),
            sync: SyncConfig::default(),
            cache: CacheConfig::default(),
            hedge: HedgeConfig::default(),
            bus: BusConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 300,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 5,
            command_timeout_ms: 10_000,
            max_subscription_errors: 5,
            reconnect_delay_secs: 1,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            analysis_interval_secs: 30,
            fully_hedged_threshold: Decimal::new(95, 2),
            rebalance_threshold: Decimal::new(8, 1),
            high_priority_net_lots: Decimal::ONE,
            excess_cleanup_lots: Decimal::TWO,
            sync_tolerance_ms: 1_000,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
        }
    }
}

impl LockConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
}

impl SyncConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

impl HedgeConfig {
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs.max(1))
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| Error::Config {
            message: format!("{} has an invalid value: {}", name, raw),
        }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();
        if let Ok(client_id) = env::var("HEDGE_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(accounts) = env::var("HEDGE_OWNED_ACCOUNTS") {
            config.owned_accounts = accounts
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(v) = parse_var("HEDGE_LOCK_STALE_TIMEOUT_SECS")? {
            config.lock.stale_timeout_secs = v;
        }
        if let Some(v) = parse_var("HEDGE_SYNC_RECONCILE_INTERVAL_SECS")? {
            config.sync.reconcile_interval_secs = v;
        }
        if let Some(v) = parse_var("HEDGE_SYNC_COMMAND_TIMEOUT_MS")? {
            config.sync.command_timeout_ms = v;
        }
        if let Some(v) = parse_var("HEDGE_SYNC_MAX_SUBSCRIPTION_ERRORS")? {
            config.sync.max_subscription_errors = v;
        }
        if let Some(v) = parse_var("HEDGE_SYNC_RECONNECT_DELAY_SECS")? {
            config.sync.reconnect_delay_secs = v;
        }
        if let Some(v) = parse_var("HEDGE_CACHE_REFRESH_INTERVAL_MS")? {
            config.cache.refresh_interval_ms = v;
        }
        if let Some(v) = parse_var("HEDGE_HEDGE_ANALYSIS_INTERVAL_SECS")? {
            config.hedge.analysis_interval_secs = v;
        }
        if let Some(v) = parse_var("HEDGE_HEDGE_FULLY_HEDGED_THRESHOLD")? {
            config.hedge.fully_hedged_threshold = v;
        }
        if let Some(v) = parse_var("HEDGE_HEDGE_REBALANCE_THRESHOLD")? {
            config.hedge.rebalance_threshold = v;
        }
        if let Some(v) = parse_var("HEDGE_HEDGE_SYNC_TOLERANCE_MS")? {
            config.hedge.sync_tolerance_ms = v;
        }
        if let Some(v) = parse_var("HEDGE_BUS_CAPACITY")? {
            config.bus.capacity = v;
        }
        if let Some(v) = parse_var("HEDGE_RESOLVER_HISTORY_LIMIT")? {
            config.resolver.history_limit = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a TOML/YAML/JSON file, with `HEDGE__SECTION__KEY` environment overrides.
    #[allow(clippy::result_large_err)]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("HEDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("owned_accounts")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config {
                message: "client_id must not be empty".to_string(),
            });
        }
        if self.bus.capacity == 0 {
            return Err(Error::Config {
                message: "bus.capacity must be at least 1".to_string(),
            });
        }
        if self.hedge.rebalance_threshold > self.hedge.fully_hedged_threshold {
            return Err(Error::Config {
                message: "hedge.rebalance_threshold exceeds fully_hedged_threshold".to_string(),
            });
        }
        Ok(())
    }

    pub fn owns_account(&self, account_id: &str) -> bool {
        self.owned_accounts.iter().any(|a| a == account_id)
    }

    /// Configuration for tests.
    pub fn for_client(client_id: impl Into<String>, accounts: &[&str]) -> Self {
        Self {
            client_id: client_id.into(),
            owned_accounts: accounts.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.lock.stale_timeout(), Duration::from_secs(300));
        assert_eq!(config.sync.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.max_subscription_errors, 5);
        assert_eq!(config.cache.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.hedge.fully_hedged_threshold, Decimal::new(95, 2));
        assert_eq!(config.resolver.history_limit, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_client() {
        let config = Config::for_client("client-a", &["acc-1", "acc-2"]);
        assert!(config.owns_account("acc-2"));
        assert!(!config.owns_account("acc-3"));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.hedge.rebalance_threshold = Decimal::ONE;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("hedge-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.toml");
        std::fs::write(
            &path,
            "client_id = \"client-b\"\nowned_accounts = [\"acc-9\"]\n\n[lock]\nstale_timeout_secs = 60\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.client_id, "client-b");
        assert_eq!(config.owned_accounts, vec!["acc-9".to_string()]);
        assert_eq!(config.lock.stale_timeout_secs, 60);
        assert_eq!(config.sync.command_timeout_ms, 10_000);

        std::fs::remove_dir_all(&dir).ok();
    }
}
