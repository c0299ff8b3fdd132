use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::error::{PairOrderFailure, PairTradeError};
use crate::exchange::{OrderRequest, OrderResult, Side};
use crate::ledger::PositionLedger;
use crate::position::{Direction, PairPosition};
use crate::quantity::{compute_leg_quantities, dollar_value};
use crate::trade::execution::exchange_box::ExchangeBox;
use crate::trade_log::{TradeLog, TradeLogEntry};

#[derive(Debug, Clone)]
pub struct OpenReport {
    pub position: PairPosition,
    pub leg_a: OrderResult,
    pub leg_b: OrderResult,
}

#[derive(Debug, Clone)]
pub struct LegClose {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    /// `None` when the leg had nothing to close.
    pub result: Option<OrderResult>,
}

impl LegClose {
    pub fn failed(&self) -> bool {
        matches!(&self.result, Some(r) if !r.success)
    }
}

#[derive(Debug, Clone)]
pub struct CloseReport {
    pub position: PairPosition,
    pub legs: Vec<LegClose>,
    pub exit_price_a: Decimal,
    pub exit_price_b: Decimal,
}

impl CloseReport {
    /// Legs whose reduce-only order was rejected. These stay open on the
    /// exchange although the ledger entry is gone.
    pub fn failed_legs(&self) -> Vec<&LegClose> {
        self.legs.iter().filter(|l| l.failed()).collect()
    }
}

/// Opens and closes pair positions and keeps the ledger and trade log in
/// step with what was submitted.
pub struct PairExecutor {
    exchange: Arc<ExchangeBox>,
    ledger: PositionLedger,
    trade_log: TradeLog,
}

impl PairExecutor {
    pub fn new(exchange: Arc<ExchangeBox>, ledger: PositionLedger, trade_log: TradeLog) -> Self {
        Self {
            exchange,
            ledger,
            trade_log,
        }
    }

    pub fn positions(&self) -> &[PairPosition] {
        self.ledger.positions()
    }

    pub fn positions_mut(&mut self) -> &mut [PairPosition] {
        self.ledger.positions_mut()
    }

    pub fn reload(&mut self) -> &[PairPosition] {
        self.ledger.load()
    }

    pub fn trade_log(&self) -> &TradeLog {
        &self.trade_log
    }

    pub async fn open(
        &mut self,
        direction: Direction,
        symbol_a: &str,
        symbol_b: &str,
        notional: Decimal,
    ) -> Result<OpenReport, PairTradeError> {
        let price_a = self.require_price(symbol_a).await?;
        let price_b = self.require_price(symbol_b).await?;
        let precision_a = self.exchange.quantity_precision(symbol_a).await;
        let precision_b = self.exchange.quantity_precision(symbol_b).await;
        let (qty_a, qty_b) =
            compute_leg_quantities(notional, price_a, price_b, precision_a, precision_b)?;
        for (symbol, quantity) in [(symbol_a, qty_a), (symbol_b, qty_b)] {
            if quantity <= Decimal::ZERO {
                log::warn!(
                    "[OPEN] {} rounds to {} at notional {}, no orders placed",
                    symbol,
                    quantity,
                    notional
                );
                return Err(PairTradeError::QuantityTooSmall {
                    symbol: symbol.to_string(),
                    quantity,
                });
            }
        }

        let (side_a, side_b) = direction.leg_sides();
        log::info!(
            "[OPEN] {} {}/{} notional={} | {} {} {} @ {} (${}) | {} {} {} @ {} (${})",
            direction,
            symbol_a,
            symbol_b,
            notional,
            side_a,
            qty_a,
            symbol_a,
            price_a,
            dollar_value(qty_a, price_a).round_dp(2),
            side_b,
            qty_b,
            symbol_b,
            price_b,
            dollar_value(qty_b, price_b).round_dp(2)
        );

        // both legs are always submitted
        let leg_a = self
            .exchange
            .place_order(&OrderRequest::market(symbol_a, side_a, qty_a))
            .await;
        let leg_b = self
            .exchange
            .place_order(&OrderRequest::market(symbol_b, side_b, qty_b))
            .await;

        if !(leg_a.success && leg_b.success) {
            let failure = PairOrderFailure {
                symbol_a: symbol_a.to_string(),
                symbol_b: symbol_b.to_string(),
                leg_a,
                leg_b,
            };
            if let Some(unhedged) = failure.unhedged_symbol() {
                log::error!(
                    "[UNHEDGED] {} filled without its counterpart, close it manually: {}",
                    unhedged,
                    failure
                );
                return Err(PairTradeError::PartialFill(failure));
            }
            log::warn!("[OPEN] both legs rejected: {}", failure);
            return Err(PairTradeError::OrdersRejected(failure));
        }

        let position = PairPosition::open(
            direction,
            symbol_a,
            symbol_b,
            qty_a,
            qty_b,
            price_a,
            price_b,
            Utc::now(),
        );

        self.ledger.load();
        self.ledger.append(position.clone());
        if let Err(e) = self.ledger.save() {
            log::error!(
                "[LEDGER] position {} is open on the exchange but was not saved: {}",
                position.trade_id,
                e
            );
            return Err(e);
        }

        if let Err(e) = self.trade_log.append(&TradeLogEntry::opened(&position)) {
            log::warn!("[TRADE_LOG] failed to record open of {}: {}", position.trade_id, e);
        }
        log::info!(
            "[OPEN] recorded {} {} ({} open)",
            position.pair_label(),
            position.trade_id,
            self.ledger.len()
        );

        Ok(OpenReport {
            position,
            leg_a,
            leg_b,
        })
    }

    pub async fn close(&mut self, index: usize) -> Result<CloseReport, PairTradeError> {
        self.ledger.load();
        let position = match self.ledger.positions().get(index) {
            Some(p) => p.clone(),
            None => {
                return Err(PairTradeError::IndexOutOfRange {
                    index,
                    len: self.ledger.len(),
                })
            }
        };

        let report = self.close_position(position).await;
        self.ledger.remove_at(index)?;
        self.ledger.save()?;
        Ok(report)
    }

    /// Returns `false` without touching the exchange when nothing is open.
    pub async fn close_all(&mut self) -> Result<bool, PairTradeError> {
        self.ledger.load();
        if self.ledger.is_empty() {
            log::info!("[CLOSE] no open positions");
            return Ok(false);
        }

        let positions = self.ledger.positions().to_vec();
        let mut residual = 0;
        for position in positions {
            let report = self.close_position(position).await;
            residual += report.failed_legs().len();
        }
        self.ledger.clear();
        self.ledger.save()?;
        if residual > 0 {
            log::error!("[RESIDUAL] {} leg(s) left open after close-all", residual);
        }
        Ok(true)
    }

    async fn require_price(&self, symbol: &str) -> Result<Decimal, PairTradeError> {
        self.exchange
            .ticker_price(symbol)
            .await
            .ok_or_else(|| PairTradeError::PriceUnavailable {
                symbol: symbol.to_string(),
            })
    }

    async fn close_position(&self, position: PairPosition) -> CloseReport {
        let mut legs = Vec::with_capacity(2);
        for leg in position.legs() {
            let side = leg.side.opposite();
            if leg.quantity <= Decimal::ZERO {
                log::info!(
                    "[CLOSE] {} has zero quantity in {}, skipped",
                    leg.symbol,
                    position.trade_id
                );
                legs.push(LegClose {
                    symbol: leg.symbol.clone(),
                    side,
                    quantity: leg.quantity,
                    result: None,
                });
                continue;
            }
            let result = self
                .exchange
                .place_order(&OrderRequest::reduce_only(&leg.symbol, side, leg.quantity))
                .await;
            if !result.success {
                log::error!(
                    "[RESIDUAL] failed to close {} {} {} of {}: {}",
                    side,
                    leg.quantity,
                    leg.symbol,
                    position.trade_id,
                    result.message
                );
            }
            legs.push(LegClose {
                symbol: leg.symbol.clone(),
                side,
                quantity: leg.quantity,
                result: Some(result),
            });
        }

        let exit_price_a = self.exit_price(&position.leg_a.symbol, position.leg_a.entry_price).await;
        let exit_price_b = self.exit_price(&position.leg_b.symbol, position.leg_b.entry_price).await;
        if let Err(e) = self
            .trade_log
            .append(&TradeLogEntry::closed(&position, exit_price_a, exit_price_b))
        {
            log::warn!("[TRADE_LOG] failed to record close of {}: {}", position.trade_id, e);
        }
        log::info!(
            "[CLOSE] {} {} {} @ {} / {}",
            position.direction,
            position.pair_label(),
            position.trade_id,
            exit_price_a,
            exit_price_b
        );

        CloseReport {
            position,
            legs,
            exit_price_a,
            exit_price_b,
        }
    }

    async fn exit_price(&self, symbol: &str, entry_price: Decimal) -> Decimal {
        match self.exchange.ticker_price(symbol).await {
            Some(price) => price,
            None => {
                log::warn!(
                    "[TRADE_LOG] no live price for {}, logging entry price {}",
                    symbol,
                    entry_price
                );
                entry_price
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use rust_decimal_macros::dec;
    use tempfile::{tempdir, TempDir};

    const A: &str = "BTCUSDT";
    const B: &str = "POPCATUSDT";

    fn mock() -> Arc<MockExchange> {
        Arc::new(
            MockExchange::with_prices(&[(A, dec!(50000)), (B, dec!(2))])
                .precision(A, 3)
                .precision(B, 1),
        )
    }

    fn executor(mock: Arc<MockExchange>, dir: &TempDir) -> PairExecutor {
        PairExecutor::new(
            Arc::new(ExchangeBox::new(mock)),
            PositionLedger::open(dir.path().join("current_position.json")),
            TradeLog::new(dir.path().join("trade_log.csv")),
        )
    }

    #[tokio::test]
    async fn open_long_sizes_and_records_both_legs() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);

        let report = exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap();

        let orders = mock.orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].symbol, A);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].quantity.to_string(), "0.020");
        assert_eq!(orders[1].side, Side::Buy);
        assert_eq!(orders[1].quantity.to_string(), "500.0");
        assert!(!orders[0].reduce_only);

        assert_eq!(report.position.leg_a.side, Side::Sell);
        assert_eq!(report.position.leg_a.entry_price, dec!(50000));
        assert!(report.leg_a.success && report.leg_b.success);

        let reloaded = PositionLedger::open(dir.path().join("current_position.json"));
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.positions()[0], report.position);
        assert_eq!(exec.trade_log().lines().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_fill_leaves_ledger_and_log_untouched() {
        let dir = tempdir().unwrap();
        let mock = mock();
        mock.reject(B);
        let mut exec = executor(mock.clone(), &dir);

        let err = exec.open(Direction::Short, A, B, dec!(1000)).await.unwrap_err();
        match err {
            PairTradeError::PartialFill(failure) => {
                assert!(failure.leg_a.success);
                assert!(!failure.leg_b.success);
                assert_eq!(failure.unhedged_symbol(), Some(A));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(mock.orders().len(), 2);
        assert!(exec.reload().is_empty());
        assert!(!dir.path().join("current_position.json").exists());
        assert!(exec.trade_log().lines().unwrap().is_empty());
    }

    #[tokio::test]
    async fn both_legs_rejected() {
        let dir = tempdir().unwrap();
        let mock = mock();
        mock.reject(A);
        mock.reject(B);
        let mut exec = executor(mock, &dir);
        let err = exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap_err();
        assert!(matches!(err, PairTradeError::OrdersRejected(_)));
        assert!(exec.reload().is_empty());
    }

    #[tokio::test]
    async fn missing_price_places_no_orders() {
        let dir = tempdir().unwrap();
        let mock = mock();
        mock.remove_price(B);
        let mut exec = executor(mock.clone(), &dir);
        let err = exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap_err();
        assert!(matches!(err, PairTradeError::PriceUnavailable { ref symbol } if symbol == B));
        assert!(mock.orders().is_empty());
    }

    #[tokio::test]
    async fn leg_rounding_to_zero_places_no_orders() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        exec.open(Direction::Short, A, B, dec!(1000)).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("current_position.json")).unwrap();

        // $10 of BTC at 50000 is 0.0002, which is 0.000 at three decimals
        let err = exec.open(Direction::Long, A, B, dec!(10)).await.unwrap_err();
        match err {
            PairTradeError::QuantityTooSmall { symbol, quantity } => {
                assert_eq!(symbol, A);
                assert!(quantity.is_zero());
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(mock.orders().len(), 2);
        let after = std::fs::read_to_string(dir.path().join("current_position.json")).unwrap();
        assert_eq!(before, after);
        assert_eq!(exec.reload().len(), 1);
        assert_eq!(exec.trade_log().lines().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_all_on_empty_ledger_makes_no_calls() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        assert!(!exec.close_all().await.unwrap());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn close_out_of_range_leaves_ledger() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("current_position.json")).unwrap();

        let err = exec.close(3).await.unwrap_err();
        assert!(matches!(err, PairTradeError::IndexOutOfRange { index: 3, len: 1 }));
        let after = std::fs::read_to_string(dir.path().join("current_position.json")).unwrap();
        assert_eq!(before, after);
        assert_eq!(mock.orders().len(), 2);
    }

    #[tokio::test]
    async fn open_then_close_restores_ledger() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap();
        mock.set_price(A, dec!(51000));

        let report = exec.close(0).await.unwrap();
        assert!(report.failed_legs().is_empty());
        assert_eq!(report.exit_price_a, dec!(51000));
        assert!(exec.reload().is_empty());

        let orders = mock.orders();
        assert_eq!(orders.len(), 4);
        assert_eq!(orders[2].symbol, A);
        assert_eq!(orders[2].side, Side::Buy);
        assert!(orders[2].reduce_only);
        assert_eq!(orders[3].side, Side::Sell);

        let lines = exec.trade_log().lines().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(",CLOSE,BTCUSDT,0.020,51000,POPCATUSDT,500.0,2"));
    }

    #[tokio::test]
    async fn failed_close_leg_still_removes_entry() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        exec.open(Direction::Short, A, B, dec!(1000)).await.unwrap();
        exec.open(Direction::Long, A, B, dec!(500)).await.unwrap();
        mock.reject(B);
        mock.remove_price(B);

        let report = exec.close(0).await.unwrap();
        let failed = report.failed_legs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].symbol, B);
        // entry price stands in for the missing live price
        assert_eq!(report.exit_price_b, dec!(2));

        let remaining = exec.reload();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].direction, Direction::Long);
    }

    #[tokio::test]
    async fn close_all_logs_each_position_and_clears() {
        let dir = tempdir().unwrap();
        let mock = mock();
        let mut exec = executor(mock.clone(), &dir);
        exec.open(Direction::Long, A, B, dec!(1000)).await.unwrap();
        exec.open(Direction::Short, A, B, dec!(1000)).await.unwrap();

        assert!(exec.close_all().await.unwrap());
        assert!(exec.reload().is_empty());
        assert!(!dir.path().join("current_position.json").exists());
        let lines = exec.trade_log().lines().unwrap();
        assert_eq!(lines.iter().filter(|l| l.contains(",CLOSE,")).count(), 2);
        assert_eq!(mock.orders().iter().filter(|o| o.reduce_only).count(), 4);
    }
}
