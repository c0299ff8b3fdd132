use crate::exchange::OrderResult;
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;

/// Both order responses of a pair open that did not fully succeed.
#[derive(Debug, Clone, PartialEq)]
pub struct PairOrderFailure {
    pub symbol_a: String,
    pub symbol_b: String,
    pub leg_a: OrderResult,
    pub leg_b: OrderResult,
}

impl PairOrderFailure {
    /// Symbol of the leg that filled while its counterpart failed, if any.
    pub fn unhedged_symbol(&self) -> Option<&str> {
        match (self.leg_a.success, self.leg_b.success) {
            (true, false) => Some(&self.symbol_a),
            (false, true) => Some(&self.symbol_b),
            _ => None,
        }
    }
}

impl fmt::Display for PairOrderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} | {}: {}",
            self.symbol_a, self.leg_a, self.symbol_b, self.leg_b
        )
    }
}

#[derive(Debug)]
pub enum PairTradeError {
    InvalidPrice { leg: String, price: Decimal },
    InvalidNotional(Decimal),
    PriceUnavailable { symbol: String },
    /// A leg rounded to nothing at the instrument's precision.
    QuantityTooSmall { symbol: String, quantity: Decimal },
    /// One leg filled and the other did not. The filled leg is live on the
    /// exchange and unknown to the ledger.
    PartialFill(PairOrderFailure),
    OrdersRejected(PairOrderFailure),
    Persistence(String),
    IndexOutOfRange { index: usize, len: usize },
    Io(std::io::Error),
}

impl fmt::Display for PairTradeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PairTradeError::InvalidPrice { leg, price } => {
                write!(f, "Invalid price for {}: {}", leg, price)
            }
            PairTradeError::InvalidNotional(n) => write!(f, "Invalid notional: {}", n),
            PairTradeError::PriceUnavailable { symbol } => {
                write!(f, "Price unavailable for {}", symbol)
            }
            PairTradeError::QuantityTooSmall { symbol, quantity } => write!(
                f,
                "Order size too small for {}: quantity rounds to {}",
                symbol, quantity
            ),
            PairTradeError::PartialFill(detail) => write!(
                f,
                "Partial fill, {} leg is UNHEDGED on the exchange: {}",
                detail.unhedged_symbol().unwrap_or("?"),
                detail
            ),
            PairTradeError::OrdersRejected(detail) => {
                write!(f, "Both pair orders rejected: {}", detail)
            }
            PairTradeError::Persistence(e) => write!(f, "Persistence error: {}", e),
            PairTradeError::IndexOutOfRange { index, len } => {
                write!(f, "Position index {} out of range (open positions: {})", index, len)
            }
            PairTradeError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for PairTradeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PairTradeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PairTradeError {
    fn from(err: std::io::Error) -> PairTradeError {
        PairTradeError::Io(err)
    }
}

impl From<serde_json::Error> for PairTradeError {
    fn from(err: serde_json::Error) -> PairTradeError {
        PairTradeError::Persistence(err.to_string())
    }
}
