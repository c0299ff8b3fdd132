use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::exchange::{RawExchangePosition, Side};
use crate::position::{Leg, PairPosition};
use crate::trade::execution::exchange_box::ExchangeBox;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Ticker lookups memoized for one refresh so a symbol shared by several
/// positions is fetched once.
#[derive(Default)]
pub struct PriceCache {
    prices: HashMap<String, Option<Decimal>>,
}

impl PriceCache {
    pub async fn get(&mut self, exchange: &ExchangeBox, symbol: &str) -> Option<Decimal> {
        if let Some(cached) = self.prices.get(symbol) {
            return *cached;
        }
        let price = exchange.ticker_price(symbol).await;
        self.prices.insert(symbol.to_string(), price);
        price
    }
}

pub fn leg_pnl(leg: &Leg, current_price: Decimal) -> Decimal {
    (current_price - leg.entry_price) * leg.quantity * leg.side.sign()
}

pub fn pnl_percentage(pnl: Decimal, order_size: Decimal) -> Decimal {
    if order_size.is_zero() {
        return Decimal::ZERO;
    }
    pnl / order_size * HUNDRED
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairPnlRow {
    pub index: usize,
    pub trade_id: String,
    pub side_letter: char,
    pub label: String,
    pub average_value: Decimal,
    /// `None` when a leg price was unavailable this refresh.
    pub pnl: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPositionRow {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub value: Decimal,
    pub unrealized_pnl: Decimal,
    pub pnl_pct: Decimal,
}

pub async fn refresh_pair_pnl(
    exchange: &ExchangeBox,
    positions: &mut [PairPosition],
    order_size: Decimal,
) -> Vec<PairPnlRow> {
    let mut cache = PriceCache::default();
    pair_rows(exchange, &mut cache, positions, order_size).await
}

async fn pair_rows(
    exchange: &ExchangeBox,
    cache: &mut PriceCache,
    positions: &mut [PairPosition],
    order_size: Decimal,
) -> Vec<PairPnlRow> {
    let mut rows = Vec::with_capacity(positions.len());
    for (index, position) in positions.iter_mut().enumerate() {
        let price_a = cache.get(exchange, &position.leg_a.symbol).await;
        let price_b = cache.get(exchange, &position.leg_b.symbol).await;
        let pnl = match (price_a, price_b) {
            (Some(a), Some(b)) => {
                let combined = leg_pnl(&position.leg_a, a) + leg_pnl(&position.leg_b, b);
                position.combined_unrealized_pnl = combined;
                Some(combined)
            }
            _ => {
                log::warn!(
                    "[PNL] price unavailable for {}, PnL not updated",
                    position.pair_label()
                );
                None
            }
        };
        rows.push(PairPnlRow {
            index,
            trade_id: position.trade_id.clone(),
            side_letter: position.direction.letter(),
            label: position.pair_label(),
            average_value: position.average_entry_value(),
            pnl,
            pnl_pct: pnl.map(|p| pnl_percentage(p, order_size)),
        });
    }
    rows
}

pub async fn raw_position_rows(
    exchange: &ExchangeBox,
    raw: &[RawExchangePosition],
) -> Vec<RawPositionRow> {
    let mut cache = PriceCache::default();
    raw_rows(exchange, &mut cache, raw).await
}

async fn raw_rows(
    exchange: &ExchangeBox,
    cache: &mut PriceCache,
    raw: &[RawExchangePosition],
) -> Vec<RawPositionRow> {
    let mut rows = Vec::with_capacity(raw.len());
    for position in raw {
        let value = match cache.get(exchange, &position.symbol).await {
            Some(current) => position.size * current - position.unrealized_pnl,
            None => position.size * position.entry_price,
        };
        let pnl_pct = position
            .unrealized_pnl
            .checked_div(value)
            .map(|ratio| ratio * HUNDRED)
            .unwrap_or(Decimal::ZERO);
        rows.push(RawPositionRow {
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            value,
            unrealized_pnl: position.unrealized_pnl,
            pnl_pct,
        });
    }
    rows
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshot {
    pub equity: Option<Decimal>,
    pub pair_rows: Vec<PairPnlRow>,
    /// Exchange positions as reported, kept for reconciliation.
    pub raw_positions: Option<Vec<RawExchangePosition>>,
    /// `None` when the exchange position list could not be fetched.
    pub raw_rows: Option<Vec<RawPositionRow>>,
    pub pair_total_pnl: Decimal,
    pub raw_total_pnl: Decimal,
}

pub async fn build_snapshot(
    exchange: &ExchangeBox,
    positions: &mut [PairPosition],
    order_size: Decimal,
    settle_asset: &str,
) -> PortfolioSnapshot {
    let mut cache = PriceCache::default();
    let equity = exchange.wallet_equity().await;
    let pair_rows = pair_rows(exchange, &mut cache, positions, order_size).await;
    let raw_positions = exchange.open_positions(settle_asset).await;
    let raw_rows = match &raw_positions {
        Some(raw) => Some(raw_rows(exchange, &mut cache, raw).await),
        None => None,
    };

    // rows without prices keep their last computed value
    let pair_total_pnl = positions.iter().map(|p| p.combined_unrealized_pnl).sum();
    let raw_total_pnl = raw_rows
        .as_ref()
        .map(|rows| rows.iter().map(|r| r.unrealized_pnl).sum())
        .unwrap_or(Decimal::ZERO);

    PortfolioSnapshot {
        equity,
        pair_rows,
        raw_positions,
        raw_rows,
        pair_total_pnl,
        raw_total_pnl,
    }
}

fn money(value: Decimal) -> String {
    format!("${:.2}", value.round_dp(2))
}

fn pct(value: Decimal) -> String {
    format!("{:.2}%", value.round_dp(2))
}

impl PortfolioSnapshot {
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(match self.equity {
            Some(equity) => format!("Equity: {}", money(equity)),
            None => "Equity: unavailable".to_string(),
        });

        lines.push(format!("Pair positions ({}):", self.pair_rows.len()));
        for row in &self.pair_rows {
            let pnl = match (row.pnl, row.pnl_pct) {
                (Some(p), Some(pc)) => format!("{} ({})", money(p), pct(pc)),
                _ => "n/a".to_string(),
            };
            lines.push(format!(
                "  [{}] {} {:<16} {:>12}  PnL {}",
                row.index,
                row.side_letter,
                row.label,
                money(row.average_value),
                pnl
            ));
        }
        lines.push(format!("Pair UPnL total: {}", money(self.pair_total_pnl)));

        match &self.raw_rows {
            Some(rows) => {
                lines.push(format!("Exchange positions ({}):", rows.len()));
                for row in rows {
                    lines.push(format!(
                        "  {:<14} {:<4} {:>12} {:>12}  UPnL {} ({})",
                        row.symbol,
                        row.side,
                        row.size,
                        money(row.value),
                        money(row.unrealized_pnl),
                        pct(row.pnl_pct)
                    ));
                }
            }
            None => lines.push("Exchange positions: unavailable".to_string()),
        }
        lines.push(format!("Exchange UPnL total: {}", money(self.raw_total_pnl)));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::position::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn position(direction: Direction) -> PairPosition {
        PairPosition::open(
            direction,
            "BTCUSDT",
            "POPCATUSDT",
            dec!(0.020),
            dec!(500.0),
            dec!(50000),
            dec!(2),
            Utc::now(),
        )
    }

    #[test]
    fn leg_pnl_follows_side() {
        let p = position(Direction::Long);
        // short A, long B
        assert_eq!(leg_pnl(&p.leg_a, dec!(51000)), dec!(-20));
        assert_eq!(leg_pnl(&p.leg_b, dec!(2.1)), dec!(50));
    }

    #[test]
    fn percentage_of_zero_order_size_is_zero() {
        assert_eq!(pnl_percentage(dec!(10), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(pnl_percentage(dec!(10), dec!(1000)), dec!(1));
    }

    #[tokio::test]
    async fn refresh_fills_derived_pnl_and_caches_prices() {
        let mock = Arc::new(MockExchange::with_prices(&[
            ("BTCUSDT", dec!(51000)),
            ("POPCATUSDT", dec!(2.1)),
        ]));
        let exchange = ExchangeBox::new(mock.clone());
        let mut positions = vec![position(Direction::Long), position(Direction::Short)];

        let rows = refresh_pair_pnl(&exchange, &mut positions, dec!(1000)).await;
        assert_eq!(mock.call_count(), 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].side_letter, 'L');
        assert_eq!(rows[0].label, "POPCAT/BTC");
        assert_eq!(rows[0].average_value, dec!(1000));
        assert_eq!(rows[0].pnl, Some(dec!(30)));
        assert_eq!(rows[0].pnl_pct, Some(dec!(3)));
        assert_eq!(rows[1].pnl, Some(dec!(-30)));
        assert_eq!(positions[0].combined_unrealized_pnl, dec!(30));
    }

    #[tokio::test]
    async fn missing_price_marks_row_unavailable() {
        let mock = Arc::new(MockExchange::with_prices(&[("BTCUSDT", dec!(51000))]));
        let exchange = ExchangeBox::new(mock);
        let mut positions = vec![position(Direction::Long)];
        positions[0].combined_unrealized_pnl = dec!(7);

        let rows = refresh_pair_pnl(&exchange, &mut positions, dec!(1000)).await;
        assert_eq!(rows[0].pnl, None);
        assert_eq!(rows[0].pnl_pct, None);
        assert_eq!(positions[0].combined_unrealized_pnl, dec!(7));
    }

    #[tokio::test]
    async fn raw_rows_use_reported_upnl() {
        let mock = Arc::new(MockExchange::with_prices(&[("BTCUSDT", dec!(51000))]));
        let exchange = ExchangeBox::new(mock);
        let raw = vec![
            RawExchangePosition {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                size: dec!(0.02),
                entry_price: dec!(50000),
                unrealized_pnl: dec!(20),
            },
            RawExchangePosition {
                symbol: "POPCATUSDT".to_string(),
                side: Side::Sell,
                size: dec!(100),
                entry_price: dec!(2),
                unrealized_pnl: dec!(-5),
            },
        ];
        let rows = raw_position_rows(&exchange, &raw).await;
        assert_eq!(rows[0].value, dec!(1000));
        assert_eq!(rows[0].pnl_pct, dec!(2));
        // ticker unavailable, value from entry
        assert_eq!(rows[1].value, dec!(200));
        assert_eq!(rows[1].pnl_pct, dec!(-2.5));
    }

    #[tokio::test]
    async fn snapshot_totals_and_render() {
        let mock = MockExchange {
            equity: Some(dec!(10250.5)),
            positions: vec![RawExchangePosition {
                symbol: "BTCUSDT".to_string(),
                side: Side::Sell,
                size: dec!(0.02),
                entry_price: dec!(50000),
                unrealized_pnl: dec!(-20),
            }],
            ..MockExchange::with_prices(&[("BTCUSDT", dec!(51000)), ("POPCATUSDT", dec!(2.1))])
        };
        let exchange = ExchangeBox::new(Arc::new(mock));
        let mut positions = vec![position(Direction::Long)];

        let snapshot = build_snapshot(&exchange, &mut positions, dec!(1000), "USDT").await;
        assert_eq!(snapshot.equity, Some(dec!(10250.5)));
        assert_eq!(snapshot.pair_total_pnl, dec!(30));
        assert_eq!(snapshot.raw_total_pnl, dec!(-20));

        let text = snapshot.render().join("\n");
        assert!(text.contains("Equity: $10250.50"));
        assert!(text.contains("POPCAT/BTC"));
        assert!(text.contains("$30.00 (3.00%)"));
        assert!(text.contains("Exchange UPnL total: $-20.00"));
    }

    #[tokio::test]
    async fn snapshot_total_keeps_last_value_of_unpriced_pairs() {
        let mock = MockExchange::with_prices(&[("BTCUSDT", dec!(51000)), ("POPCATUSDT", dec!(2.1))]);
        let exchange = ExchangeBox::new(Arc::new(mock));
        let mut unpriced = PairPosition::open(
            Direction::Short,
            "BTCUSDT",
            "ETHUSDT",
            dec!(0.020),
            dec!(0.5),
            dec!(50000),
            dec!(2000),
            Utc::now(),
        );
        unpriced.combined_unrealized_pnl = dec!(7);
        let mut positions = vec![position(Direction::Long), unpriced];

        let snapshot = build_snapshot(&exchange, &mut positions, dec!(1000), "USDT").await;
        assert_eq!(snapshot.pair_rows[0].pnl, Some(dec!(30)));
        assert_eq!(snapshot.pair_rows[1].pnl, None);
        assert_eq!(snapshot.pair_total_pnl, dec!(37));
    }
}
