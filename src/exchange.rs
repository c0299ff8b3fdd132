use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for a long exposure, -1 for a short one.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "Market",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            reduce_only: false,
        }
    }

    pub fn reduce_only(symbol: &str, side: Side, quantity: Decimal) -> Self {
        Self {
            reduce_only: true,
            ..Self::market(symbol, side, quantity)
        }
    }
}

/// Outcome of a single order submission as seen by the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub message: String,
}

impl OrderResult {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            message: "OK".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for OrderResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.success, &self.order_id) {
            (true, Some(id)) => write!(f, "ok (order {})", id),
            (true, None) => write!(f, "ok"),
            (false, _) => write!(f, "failed: {}", self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub start_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Position as reported by the exchange. Never mutated locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug)]
pub enum ExchangeError {
    Http(String),
    Api { code: i64, msg: String },
    Decode(String),
    Other(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExchangeError::Http(e) => write!(f, "HTTP error: {}", e),
            ExchangeError::Api { code, msg } => write!(f, "API error {}: {}", code, msg),
            ExchangeError::Decode(e) => write!(f, "Decode error: {}", e),
            ExchangeError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for ExchangeError {}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> ExchangeError {
        ExchangeError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> ExchangeError {
        ExchangeError::Decode(err.to_string())
    }
}

/// Request/response capabilities the desk needs from an exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn get_kline_series(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError>;

    /// Number of decimal places allowed for order quantities.
    async fn get_instrument_quantity_precision(&self, symbol: &str) -> Result<u32, ExchangeError>;

    async fn get_wallet_equity(&self) -> Result<Decimal, ExchangeError>;

    async fn get_open_positions(
        &self,
        settle_asset: &str,
    ) -> Result<Vec<RawExchangePosition>, ExchangeError>;

    /// Returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
}
