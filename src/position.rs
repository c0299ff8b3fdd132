use crate::exchange::Side;
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `Long` bets on the ratio `price_b / price_a` rising: short leg A, long leg B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order sides for (leg_a, leg_b) when opening.
    pub fn leg_sides(self) -> (Side, Side) {
        match self {
            Direction::Long => (Side::Sell, Side::Buy),
            Direction::Short => (Side::Buy, Side::Sell),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn letter(self) -> char {
        match self {
            Direction::Long => 'L',
            Direction::Short => 'S',
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Direction::Long),
            "short" => Ok(Direction::Short),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairPosition {
    pub trade_id: String,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub opened_at_rounded: DateTime<Utc>,
    pub leg_a: Leg,
    pub leg_b: Leg,
    /// Last value computed by the PnL refresh. Display only.
    #[serde(default)]
    pub combined_unrealized_pnl: Decimal,
}

impl PairPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        direction: Direction,
        symbol_a: &str,
        symbol_b: &str,
        qty_a: Decimal,
        qty_b: Decimal,
        price_a: Decimal,
        price_b: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        let (side_a, side_b) = direction.leg_sides();
        Self {
            trade_id: generate_trade_id(),
            direction,
            opened_at,
            opened_at_rounded: truncate_to_minute(opened_at),
            leg_a: Leg {
                symbol: symbol_a.to_string(),
                side: side_a,
                quantity: qty_a,
                entry_price: price_a,
            },
            leg_b: Leg {
                symbol: symbol_b.to_string(),
                side: side_b,
                quantity: qty_b,
                entry_price: price_b,
            },
            combined_unrealized_pnl: Decimal::ZERO,
        }
    }

    pub fn legs(&self) -> [&Leg; 2] {
        [&self.leg_a, &self.leg_b]
    }

    /// `B/A` with settlement suffixes stripped, e.g. `POPCAT/BTC`.
    pub fn pair_label(&self) -> String {
        pair_label(&self.leg_a.symbol, &self.leg_b.symbol)
    }

    /// Mean entry notional of the two legs.
    pub fn average_entry_value(&self) -> Decimal {
        (self.leg_a.quantity * self.leg_a.entry_price
            + self.leg_b.quantity * self.leg_b.entry_price)
            / Decimal::TWO
    }
}

pub fn generate_trade_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub fn short_symbol(symbol: &str) -> &str {
    symbol
        .strip_suffix("USDT")
        .or_else(|| symbol.strip_suffix("USDC"))
        .filter(|s| !s.is_empty())
        .unwrap_or(symbol)
}

pub fn pair_label(symbol_a: &str, symbol_b: &str) -> String {
    format!("{}/{}", short_symbol(symbol_b), short_symbol(symbol_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn long_sells_first_leg_and_buys_second() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 1, 12, 34, 56).unwrap();
        let pos = PairPosition::open(
            Direction::Long,
            "BTCUSDT",
            "POPCATUSDT",
            dec!(0.020),
            dec!(500.0),
            dec!(50000),
            dec!(2),
            ts,
        );
        assert_eq!(pos.leg_a.side, Side::Sell);
        assert_eq!(pos.leg_b.side, Side::Buy);
        assert_eq!(
            pos.opened_at_rounded,
            Utc.with_ymd_and_hms(2024, 7, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(pos.trade_id.len(), 32);
        assert_eq!(pos.pair_label(), "POPCAT/BTC");
        assert_eq!(pos.average_entry_value(), dec!(1000));
    }

    #[test]
    fn short_mirrors_long() {
        assert_eq!(Direction::Short.leg_sides(), (Side::Buy, Side::Sell));
    }

    #[test]
    fn direction_serializes_lowercase() {
        let json = serde_json::to_string(&Direction::Short).unwrap();
        assert_eq!(json, "\"short\"");
        assert_eq!("LONG".parse::<Direction>().unwrap(), Direction::Long);
    }

    #[test]
    fn short_symbol_strips_settlement_suffix() {
        assert_eq!(short_symbol("ETHUSDC"), "ETH");
        assert_eq!(short_symbol("USDT"), "USDT");
        assert_eq!(short_symbol("BTCPERP"), "BTCPERP");
    }
}
