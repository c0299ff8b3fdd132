use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::num::ParseIntError;
use std::path::Path;
use std::str::FromStr;

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_ORDER_SIZE: Decimal = dec!(1000);
const DEFAULT_MIN_ORDER_SIZE: Decimal = dec!(10);
const DEFAULT_MAX_ORDER_SIZE: Decimal = dec!(1000000);
const DEFAULT_SYMBOL_A: &str = "BTCUSDT";
const DEFAULT_SYMBOL_B: &str = "POPCATUSDT";
const DEFAULT_CATEGORY: &str = "linear";
const DEFAULT_SETTLE_COIN: &str = "USDT";
const DEFAULT_POSITION_FILE: &str = "current_position.json";
const DEFAULT_TRADE_LOG_FILE: &str = "trade_log.csv";
const DEFAULT_CHART_INTERVAL: &str = "1";
const DEFAULT_CHART_LIMIT: usize = 300;
const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;
const DEFAULT_PAPER_EQUITY: Decimal = dec!(10000);

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    DecimalParseError(rust_decimal::Error),
    MissingVar(String),
    OtherError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::MissingVar(name) => write!(f, "{} must be set", name),
            ConfigError::OtherError(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

/// API key pair selected once at startup.
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env(testnet: bool) -> Result<Self, ConfigError> {
        let (key_var, secret_var) = if testnet {
            ("API_KEY_TESTNET", "API_SECRET_TESTNET")
        } else {
            ("API_KEY", "API_SECRET")
        };
        let key = env::var(key_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar(key_var.to_string()))?;
        let secret = env::var(secret_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar(secret_var.to_string()))?;
        log::info!(
            "[CONFIG] using {} credentials from {}",
            if testnet { "testnet" } else { "live" },
            key_var
        );
        Ok(Self {
            key: key.trim().to_string(),
            secret: secret.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Bybit,
    Paper,
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bybit" => Ok(ExchangeKind::Bybit),
            "paper" => Ok(ExchangeKind::Paper),
            other => Err(ConfigError::OtherError(format!(
                "unsupported exchange '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct PairTradeYaml {
    exchange: Option<String>,
    testnet: Option<bool>,
    refresh_interval_ms: Option<u64>,
    default_order_size: Option<Decimal>,
    min_order_size: Option<Decimal>,
    max_order_size: Option<Decimal>,
    symbol_a: Option<String>,
    symbol_b: Option<String>,
    category: Option<String>,
    settle_coin: Option<String>,
    position_file: Option<String>,
    trade_log_file: Option<String>,
    chart_interval: Option<String>,
    chart_limit: Option<usize>,
    recv_window_ms: Option<u64>,
    paper_file: Option<String>,
    paper_equity: Option<Decimal>,
    reconcile_tolerance: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct PairTradeConfig {
    pub exchange: ExchangeKind,
    pub testnet: bool,
    pub refresh_interval_ms: u64,
    pub default_order_size: Decimal,
    pub min_order_size: Decimal,
    pub max_order_size: Decimal,
    pub symbol_a: String,
    pub symbol_b: String,
    pub category: String,
    pub settle_coin: String,
    pub position_file: String,
    pub trade_log_file: String,
    pub chart_interval: String,
    pub chart_limit: usize,
    pub recv_window_ms: u64,
    // Offline price replay used instead of a live exchange
    pub paper_file: Option<String>,
    pub paper_equity: Decimal,
    pub reconcile_tolerance: Decimal,
}

impl Default for PairTradeConfig {
    fn default() -> Self {
        Self::build(PairTradeYaml::default(), ExchangeKind::Bybit)
    }
}

impl PairTradeConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRDESK_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let mut cfg = match config_path {
            Some(path) => Self::from_yaml_path(path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open pairdesk config {}", path_ref.display()))?;
        let yaml: PairTradeYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse pairdesk config {}", path_ref.display()))?;
        Self::from_yaml(yaml)
    }

    fn from_yaml(yaml: PairTradeYaml) -> Result<Self> {
        let exchange = yaml
            .exchange
            .as_deref()
            .unwrap_or("bybit")
            .parse::<ExchangeKind>()?;
        Ok(Self::build(yaml, exchange))
    }

    fn build(yaml: PairTradeYaml, exchange: ExchangeKind) -> Self {
        PairTradeConfig {
            exchange,
            testnet: yaml.testnet.unwrap_or(false),
            refresh_interval_ms: yaml
                .refresh_interval_ms
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS),
            default_order_size: yaml.default_order_size.unwrap_or(DEFAULT_ORDER_SIZE),
            min_order_size: yaml.min_order_size.unwrap_or(DEFAULT_MIN_ORDER_SIZE),
            max_order_size: yaml.max_order_size.unwrap_or(DEFAULT_MAX_ORDER_SIZE),
            symbol_a: normalize_symbol(yaml.symbol_a.as_deref().unwrap_or(DEFAULT_SYMBOL_A)),
            symbol_b: normalize_symbol(yaml.symbol_b.as_deref().unwrap_or(DEFAULT_SYMBOL_B)),
            category: yaml
                .category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            settle_coin: yaml
                .settle_coin
                .unwrap_or_else(|| DEFAULT_SETTLE_COIN.to_string()),
            position_file: yaml
                .position_file
                .unwrap_or_else(|| DEFAULT_POSITION_FILE.to_string()),
            trade_log_file: yaml
                .trade_log_file
                .unwrap_or_else(|| DEFAULT_TRADE_LOG_FILE.to_string()),
            chart_interval: yaml
                .chart_interval
                .unwrap_or_else(|| DEFAULT_CHART_INTERVAL.to_string()),
            chart_limit: yaml.chart_limit.unwrap_or(DEFAULT_CHART_LIMIT),
            recv_window_ms: yaml.recv_window_ms.unwrap_or(DEFAULT_RECV_WINDOW_MS),
            paper_file: yaml.paper_file.filter(|v| !v.trim().is_empty()),
            paper_equity: yaml.paper_equity.unwrap_or(DEFAULT_PAPER_EQUITY),
            reconcile_tolerance: yaml.reconcile_tolerance.unwrap_or(Decimal::ZERO),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_value("PAIRDESK_EXCHANGE") {
            self.exchange = v.parse()?;
        }
        if let Some(v) = env_value("TESTNET") {
            self.testnet = parse_bool(&v);
        }
        if let Some(v) = env_value("UPDATE_INTERVAL_MS") {
            self.refresh_interval_ms = v.parse()?;
        }
        if let Some(v) = env_value("DEFAULT_ORDER_SIZE") {
            self.default_order_size = v.parse()?;
        }
        if let Some(v) = env_value("MIN_ORDER_SIZE") {
            self.min_order_size = v.parse()?;
        }
        if let Some(v) = env_value("MAX_ORDER_SIZE") {
            self.max_order_size = v.parse()?;
        }
        if let Some(v) = env_value("SYMBOL_A") {
            self.symbol_a = normalize_symbol(&v);
        }
        if let Some(v) = env_value("SYMBOL_B") {
            self.symbol_b = normalize_symbol(&v);
        }
        if let Some(v) = env_value("POSITION_FILE") {
            self.position_file = v;
        }
        if let Some(v) = env_value("TRADE_LOG_FILE") {
            self.trade_log_file = v;
        }
        if let Some(v) = env_value("PAPER_FILE") {
            self.paper_file = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_ms == 0 {
            bail!("refresh_interval_ms must be positive");
        }
        if self.min_order_size <= Decimal::ZERO || self.min_order_size > self.max_order_size {
            bail!(
                "invalid order size bounds: min={} max={}",
                self.min_order_size,
                self.max_order_size
            );
        }
        if !self.order_size_in_bounds(self.default_order_size) {
            bail!(
                "default_order_size {} outside [{}, {}]",
                self.default_order_size,
                self.min_order_size,
                self.max_order_size
            );
        }
        if self.symbol_a.is_empty() || self.symbol_b.is_empty() {
            bail!("both symbols must be set");
        }
        if self.exchange == ExchangeKind::Paper && self.paper_file.is_none() {
            bail!("paper exchange requires paper_file");
        }
        Ok(())
    }

    pub fn order_size_in_bounds(&self, size: Decimal) -> bool {
        size >= self.min_order_size && size <= self.max_order_size
    }
}

pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
