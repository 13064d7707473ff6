//! Configuration management
//! Supports TOML, YAML, JSON config files

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::trading::position::PositionConfig;
use crate::trading::simulation::TradingMode;
use crate::trading::sizing;

/// Bot configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    /// Position lifecycle settings
    pub position: PositionConfig,
    pub exchange: ExchangeConfig,
    pub strategy: StrategyConfig,
    /// Logging level
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub name: String,
    /// Product traded, as BASE-QUOTE
    pub product_id: String,
    /// Force the bot into error if a stop has not completed within this many ms
    pub stop_timeout_ms: Option<u64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "tickbot".to_string(),
            product_id: "BTC-USD".to_string(),
            stop_timeout_ms: Some(30_000),
        }
    }
}

/// Thresholds of the runner's dip-buying strategy, as fractions of price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Drop below the running high that triggers an entry
    pub dip: Decimal,
    /// Rise above the entry price that triggers an exit
    pub take_profit: Decimal,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            dip: Decimal::new(1, 2),
            take_profit: Decimal::new(1, 2),
        }
    }
}

/// Exchange connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub mode: TradingMode,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    /// Starting balances of the paper exchange, per currency
    pub paper_balances: BTreeMap<String, Decimal>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        let mut paper_balances = BTreeMap::new();
        paper_balances.insert("USD".to_string(), Decimal::from(1000));
        Self {
            mode: TradingMode::Paper,
            api_url: None,
            api_key: None,
            paper_balances,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotConfig::default(),
            position: PositionConfig::default(),
            exchange: ExchangeConfig::default(),
            strategy: StrategyConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;

        let config = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::from_str(&content)?
        } else if path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false) {
            serde_yaml::from_str(&content)?
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            // Try to auto-detect format
            if content.trim().starts_with('{') {
                serde_json::from_str(&content)?
            } else if content.contains("---") {
                serde_yaml::from_str(&content)?
            } else {
                toml::from_str(&content)?
            }
        };

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from default locations
    pub fn load() -> anyhow::Result<Self> {
        let locations = [
            "tickbot.toml",
            "tickbot.yaml",
            "tickbot.yml",
            "config.toml",
            ".tickbot.toml",
        ];

        for location in &locations {
            if Path::new(location).exists() {
                return Self::from_file(location);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_file = config_dir.join("tickbot/config.toml");
            if config_file.exists() {
                return Self::from_file(config_file);
            }
        }

        anyhow::bail!("No configuration file found. Expected one of: {:?}", locations)
    }

    /// Save configuration to file with credentials removed
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();

        let mut safe_config = self.clone();
        safe_config.exchange.api_key = None;

        let content = if path.extension().map(|e| e == "toml").unwrap_or(false) {
            toml::to_string_pretty(&safe_config)?
        } else if path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false) {
            serde_yaml::to_string(&safe_config)?
        } else {
            serde_json::to_string_pretty(&safe_config)?
        };

        std::fs::write(path, content)?;
        info!("Configuration saved to: {} (credentials redacted)", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bot.name.trim().is_empty() {
            anyhow::bail!("Bot name is required");
        }
        if sizing::split_product(&self.bot.product_id).is_none() {
            anyhow::bail!(
                "Product id must be of the form BASE-QUOTE, got '{}'",
                self.bot.product_id
            );
        }

        let position = &self.position;
        if position.avail_funds_perc <= Decimal::ZERO || position.avail_funds_perc > Decimal::ONE {
            anyhow::bail!("avail_funds_perc must be in (0, 1]");
        }
        if position.max_retries_on_order_fail == 0 {
            anyhow::bail!("max_retries_on_order_fail must be at least 1");
        }
        if position.retry_limit == 0 {
            anyhow::bail!("retry_limit must be at least 1");
        }
        if position.retry_interval_ms == 0 {
            anyhow::bail!("retry_interval_ms must be positive");
        }

        let thresholds = [("dip", self.strategy.dip), ("take_profit", self.strategy.take_profit)];
        for (name, value) in thresholds {
            if value <= Decimal::ZERO || value >= Decimal::ONE {
                anyhow::bail!("strategy.{} must be in (0, 1)", name);
            }
        }

        let api_url = self.exchange.api_url.as_deref().unwrap_or("");
        if self.exchange.mode.is_live() && api_url.is_empty() {
            anyhow::bail!("Live trading requires exchange.api_url");
        }
        Ok(())
    }
}

fn parse_balances(list: &str) -> anyhow::Result<BTreeMap<String, Decimal>> {
    let mut balances = BTreeMap::new();
    for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (currency, amount) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected CURRENCY=AMOUNT, got '{}'", pair))?;
        balances.insert(currency.trim().to_uppercase(), amount.trim().parse::<Decimal>()?);
    }
    Ok(balances)
}

/// Load config from environment variables (fallback)
pub fn from_env() -> anyhow::Result<Config> {
    use std::env;

    let defaults = Config::default();
    let position_defaults = PositionConfig::default();
    let strategy_defaults = StrategyConfig::default();

    let config = Config {
        bot: BotConfig {
            name: env::var("BOT_NAME").unwrap_or(defaults.bot.name),
            product_id: env::var("PRODUCT_ID").unwrap_or(defaults.bot.product_id),
            stop_timeout_ms: env::var("STOP_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(defaults.bot.stop_timeout_ms),
        },
        position: PositionConfig {
            avail_funds_perc: env::var("AVAIL_FUNDS_PERC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(position_defaults.avail_funds_perc),
            wait_for_funds_to_clear: env::var("WAIT_FOR_FUNDS_TO_CLEAR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(position_defaults.wait_for_funds_to_clear),
            max_retries_on_order_fail: env::var("MAX_RETRIES_ON_ORDER_FAIL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(position_defaults.max_retries_on_order_fail),
            retry_limit: env::var("RETRY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(position_defaults.retry_limit),
            retry_interval_ms: env::var("RETRY_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(position_defaults.retry_interval_ms),
        },
        exchange: ExchangeConfig {
            mode: env::var("TRADING_MODE")
                .ok()
                .map(|s| s.parse::<TradingMode>().map_err(anyhow::Error::msg))
                .transpose()?
                .unwrap_or_default(),
            api_url: env::var("EXCHANGE_API_URL").ok(),
            api_key: env::var("EXCHANGE_API_KEY").ok(),
            paper_balances: match env::var("PAPER_BALANCES") {
                Ok(list) => parse_balances(&list)?,
                Err(_) => defaults.exchange.paper_balances,
            },
        },
        strategy: StrategyConfig {
            dip: env::var("STRATEGY_DIP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(strategy_defaults.dip),
            take_profit: env::var("STRATEGY_TAKE_PROFIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(strategy_defaults.take_profit),
        },
        log_level: env::var("LOG_LEVEL").ok().or(defaults.log_level),
    };

    config.validate()?;
    Ok(config)
}
