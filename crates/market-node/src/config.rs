use anyhow::{Context, Result};
use market_provider::ProviderNodeConfig;
use market_types::{Address, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub repo: RepoConfig,
    pub chain: ChainConfig,
    pub tracker: TrackerConfig,
    pub fees: FeeConfig,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// `<tag>:<location>`, e.g. `rocks:./data/market`, `sqlite:./data/market.db` or `memory:`.
    pub dsn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub message_confidence: u64,
    pub deal_publish_confidence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub poll_interval_secs: u64,
    pub providers: Vec<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub max_add_balance_fee: Option<TokenAmount>,
    pub max_publish_fee: Option<TokenAmount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub collateral_multiplier: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
    pub file_output: Option<String>,
    pub module_filters: BTreeMap<String, String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            dsn: "rocks:./data/market".to_string(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            message_confidence: 5,
            deal_publish_confidence: 5,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            providers: Vec::new(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            collateral_multiplier: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: BTreeMap::new(),
        }
    }
}

impl MarketConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        // env overrides are applied by the caller, after the file
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dsn) = env::var("MARKET_REPO") {
            if !dsn.is_empty() {
                self.repo.dsn = dsn;
            }
        }

        if let Ok(providers) = env::var("MARKET_PROVIDERS") {
            self.tracker.providers = providers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<Address>() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!(address = s, error = %e, "ignoring unparseable provider address");
                        None
                    }
                })
                .collect();
        }

        if let Ok(level) = env::var("MARKET_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        if let Ok(secs) = env::var("MARKET_POLL_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.tracker.poll_interval_secs = secs;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.tracker.poll_interval_secs.max(1))
    }

    pub fn provider_node_config(&self) -> ProviderNodeConfig {
        ProviderNodeConfig {
            message_confidence: self.chain.message_confidence,
            deal_publish_confidence: self.chain.deal_publish_confidence,
            collateral_multiplier: self.provider.collateral_multiplier,
            max_publish_fee: self.fees.max_publish_fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MarketConfig::default();
        assert_eq!(config.repo.dsn, "rocks:./data/market");
        assert_eq!(config.chain.message_confidence, 5);
        assert_eq!(config.tracker.poll_interval_secs, 60);
        assert_eq!(config.provider.collateral_multiplier, 2);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_file_round_trip_keeps_amounts_and_providers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("market.toml");

        let mut config = MarketConfig::default();
        config.repo.dsn = "sqlite:/var/lib/market.db".to_string();
        config.tracker.providers = vec![Address::new_id(1000), Address::new_id(1001)];
        config.fees.max_publish_fee = Some(TokenAmount::from_atto(500));
        config
            .logging
            .module_filters
            .insert("market_chain".to_string(), "debug".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = MarketConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.provider_node_config().max_publish_fee, Some(TokenAmount::from_atto(500)));
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("market.toml");
        std::fs::write(&path, "[chain]\nmessage_confidence = 10\n").unwrap();

        let config = MarketConfig::from_file(&path).unwrap();
        assert_eq!(config.chain.message_confidence, 10);
        assert_eq!(config.chain.deal_publish_confidence, 5);
        assert_eq!(config.repo, RepoConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("MARKET_REPO", "memory:");
        env::set_var("MARKET_PROVIDERS", "f01000, not-an-address,f01001");
        env::set_var("MARKET_LOG_LEVEL", "debug");
        env::set_var("MARKET_POLL_INTERVAL_SECS", "15");

        let mut config = MarketConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.repo.dsn, "memory:");
        assert_eq!(
            config.tracker.providers,
            vec![Address::new_id(1000), Address::new_id(1001)]
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.tracker.poll_interval_secs, 15);

        env::remove_var("MARKET_REPO");
        env::remove_var("MARKET_PROVIDERS");
        env::remove_var("MARKET_LOG_LEVEL");
        env::remove_var("MARKET_POLL_INTERVAL_SECS");
    }
}
