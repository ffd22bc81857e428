//! Engine configuration: one struct per spec section, loaded from a TOML
//! document or constructed in-process via [`Config::default`].

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::price_estimator::PriceMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Live,
    Paper,
}

impl ExecMode {
    pub fn is_paper(self) -> bool {
        matches!(self, ExecMode::Paper)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub symbol: String,
    pub min_spread: f64,
    pub max_spread: f64,
    pub min_order_value: f64,
    pub target_orders_per_side: usize,
    pub drift_threshold: f64,
    pub rebalance_interval_s: f64,
    pub modify_threshold: f64,
    pub max_modify_deviation: f64,
    pub tick_size: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-USD".to_string(),
            min_spread: 0.002,
            max_spread: 0.004,
            min_order_value: 10_000.0,
            target_orders_per_side: 1,
            drift_threshold: 0.01,
            rebalance_interval_s: 1.0,
            modify_threshold: 0.003,
            max_modify_deviation: 0.01,
            tick_size: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderManagementConfig {
    pub reset_interval_s: u64,
    pub max_pending_modifications: usize,
    pub modification_timeout_s: u64,
    pub cleanup_interval_s: u64,
    pub history_capacity: usize,
}

impl Default for OrderManagementConfig {
    fn default() -> Self {
        Self {
            reset_interval_s: 300,
            max_pending_modifications: 8,
            modification_timeout_s: 10,
            cleanup_interval_s: 30,
            history_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceConfig {
    pub method: PriceMethod,
    pub window_size: usize,
    pub smoothing_factor: f64,
    pub change_threshold: f64,
    pub anomaly_threshold: f64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            method: PriceMethod::Twap,
            window_size: 50,
            smoothing_factor: 0.2,
            change_threshold: 0.0005,
            anomaly_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub rate_limit: u32,
    pub max_retries: u32,
    pub retry_delay_s: f64,
    pub modify_worker_count: usize,
    pub modify_rate_limit: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            batch_size: 8,
            rate_limit: 10,
            max_retries: 3,
            retry_delay_s: 0.25,
            modify_worker_count: 2,
            modify_rate_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_position: f64,
    pub max_order_count: usize,
    pub max_daily_loss: f64,
    pub max_price_change: f64,
    pub check_interval_s: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position: 1.0,
            max_order_count: 16,
            max_daily_loss: 500.0,
            max_price_change: 0.05,
            check_interval_s: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub key: String,
    pub secret: String,
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exec_mode: ExecMode,
    /// How often the engine re-evaluates strategy even with no new event.
    pub tick_ms: u64,

    pub strategy: StrategyConfig,
    pub order_management: OrderManagementConfig,
    pub price: PriceConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exec_mode: ExecMode::Paper,
            tick_ms: 25,
            strategy: StrategyConfig::default(),
            order_management: OrderManagementConfig::default(),
            price: PriceConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

// `#[serde(default)]` on `ExecMode` requires a plain `Default` impl too,
// since it's nested inside a struct carrying the attribute.
impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Paper
    }
}

impl Config {
    /// Load a config document from disk. Missing sections fall back to
    /// their `Default`, matching the teacher's preference for sane
    /// built-in defaults over required boilerplate.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }
}
