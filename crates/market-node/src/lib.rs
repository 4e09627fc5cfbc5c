//! Market node: configuration, logging setup and wiring of the repository,
//! chain event dispatcher, reconciliation pollers and provider adapter.

pub mod config;
pub mod logging;
pub mod node;

pub use config::{
    ChainConfig, FeeConfig, LoggingConfig, MarketConfig, ProviderConfig, RepoConfig, TrackerConfig,
};
pub use node::MarketNode;
