use rust_decimal::Decimal;
use std::sync::Arc;

use crate::config::{Credentials, ExchangeKind, PairTradeConfig};
use crate::exchange::{
    ExchangeClient, ExchangeError, Kline, OrderRequest, OrderResult, RawExchangePosition,
};
use crate::ports::bybit::BybitClient;
use crate::ports::paper_exchange::PaperExchange;
use crate::quantity::FALLBACK_QUANTITY_PRECISION;
use crate::rate_limit_notifier::{is_rate_limited, notify_rate_limit};

/// Exchange client facade. Every failure is logged and turned into a
/// sentinel here so callers only decide whether missing data is fatal.
pub struct ExchangeBox {
    pub inner: Arc<dyn ExchangeClient>,
    paper: Option<Arc<PaperExchange>>,
}

impl ExchangeBox {
    pub fn new(inner: Arc<dyn ExchangeClient>) -> Self {
        Self { inner, paper: None }
    }

    pub fn paper(paper: Arc<PaperExchange>) -> Self {
        Self {
            inner: paper.clone(),
            paper: Some(paper),
        }
    }

    /// Moves the paper replay one snapshot forward. `None` for live venues.
    pub fn advance_paper(&self) -> Option<bool> {
        self.paper.as_ref().map(|p| p.tick())
    }

    pub fn create(cfg: &PairTradeConfig) -> Result<Self, ExchangeError> {
        match cfg.exchange {
            ExchangeKind::Bybit => {
                let credentials = Credentials::from_env(cfg.testnet)
                    .map_err(|e| ExchangeError::Other(e.to_string()))?;
                let client = BybitClient::new(
                    cfg.testnet,
                    credentials,
                    &cfg.category,
                    cfg.recv_window_ms,
                )?;
                Ok(Self::new(Arc::new(client)))
            }
            ExchangeKind::Paper => {
                let path = cfg.paper_file.as_deref().ok_or_else(|| {
                    ExchangeError::Other("paper exchange requires paper_file".to_owned())
                })?;
                let paper = PaperExchange::from_file(path, cfg.paper_equity)?;
                log::info!("[CONFIG] paper exchange replaying {}", path);
                Ok(Self::paper(Arc::new(paper)))
            }
        }
    }

    fn report(&self, operation: &str, detail: &str, err: &ExchangeError) {
        let err_text = err.to_string();
        if is_rate_limited(&err_text) {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err_text);
        } else {
            log::error!("[EXCHANGE] {} ({}) failed: {}", operation, detail, err_text);
        }
    }

    pub async fn ticker_price(&self, symbol: &str) -> Option<Decimal> {
        match self.inner.get_ticker_price(symbol).await {
            Ok(price) => Some(price),
            Err(err) => {
                self.report("get_ticker_price", symbol, &err);
                None
            }
        }
    }

    pub async fn kline_series(&self, symbol: &str, interval: &str, limit: usize) -> Option<Vec<Kline>> {
        match self.inner.get_kline_series(symbol, interval, limit).await {
            Ok(klines) => Some(klines),
            Err(err) => {
                self.report(
                    "get_kline_series",
                    &format!("{} | interval={} limit={}", symbol, interval, limit),
                    &err,
                );
                None
            }
        }
    }

    /// Falls back to 8 decimal places when instrument metadata is unavailable.
    pub async fn quantity_precision(&self, symbol: &str) -> u32 {
        match self.inner.get_instrument_quantity_precision(symbol).await {
            Ok(precision) => precision,
            Err(err) => {
                self.report("get_instrument_quantity_precision", symbol, &err);
                log::warn!(
                    "[EXCHANGE] using fallback precision {} for {}",
                    FALLBACK_QUANTITY_PRECISION,
                    symbol
                );
                FALLBACK_QUANTITY_PRECISION
            }
        }
    }

    pub async fn wallet_equity(&self) -> Option<Decimal> {
        match self.inner.get_wallet_equity().await {
            Ok(equity) => Some(equity),
            Err(err) => {
                self.report("get_wallet_equity", "UNIFIED", &err);
                None
            }
        }
    }

    /// Open positions with non-zero size.
    pub async fn open_positions(&self, settle_asset: &str) -> Option<Vec<RawExchangePosition>> {
        match self.inner.get_open_positions(settle_asset).await {
            Ok(positions) => Some(
                positions
                    .into_iter()
                    .filter(|p| p.size > Decimal::ZERO)
                    .collect(),
            ),
            Err(err) => {
                self.report("get_open_positions", settle_asset, &err);
                None
            }
        }
    }

    pub async fn place_order(&self, request: &OrderRequest) -> OrderResult {
        log::debug!(
            "[ORDER_PARAMS] symbol={} side={} type={} qty={} reduce_only={}",
            request.symbol,
            request.side,
            request.order_type.as_str(),
            request.quantity,
            request.reduce_only
        );
        match self.inner.place_order(request).await {
            Ok(order_id) => OrderResult::accepted(order_id),
            Err(err) => {
                self.report(
                    "place_order",
                    &format!(
                        "{} | side={} qty={} reduce_only={}",
                        request.symbol, request.side, request.quantity, request.reduce_only
                    ),
                    &err,
                );
                OrderResult::failed(err.to_string())
            }
        }
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> OrderResult {
        match self.inner.cancel_order(symbol, order_id).await {
            Ok(()) => OrderResult::accepted(order_id),
            Err(err) => {
                self.report("cancel_order", &format!("{} | {}", symbol, order_id), &err);
                OrderResult::failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::Side;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn failures_become_sentinels() {
        let mock = Arc::new(MockExchange::with_prices(&[("AAAUSDT", dec!(10))]));
        mock.reject("BBBUSDT");
        let exchange = ExchangeBox::new(mock.clone());

        assert_eq!(exchange.ticker_price("AAAUSDT").await, Some(dec!(10)));
        assert_eq!(exchange.ticker_price("BBBUSDT").await, None);
        assert_eq!(exchange.wallet_equity().await, None);
        assert_eq!(
            exchange.quantity_precision("AAAUSDT").await,
            FALLBACK_QUANTITY_PRECISION
        );

        let ok = exchange
            .place_order(&OrderRequest::market("AAAUSDT", Side::Buy, dec!(1)))
            .await;
        assert!(ok.success);
        let rejected = exchange
            .place_order(&OrderRequest::market("BBBUSDT", Side::Sell, dec!(1)))
            .await;
        assert!(!rejected.success);
        assert!(rejected.message.contains("110007"));
    }

    #[tokio::test]
    async fn open_positions_drop_flat_entries() {
        let mock = MockExchange {
            positions: vec![
                RawExchangePosition {
                    symbol: "AAAUSDT".to_string(),
                    side: Side::Buy,
                    size: dec!(2),
                    entry_price: dec!(10),
                    unrealized_pnl: dec!(1),
                },
                RawExchangePosition {
                    symbol: "BBBUSDT".to_string(),
                    side: Side::Sell,
                    size: dec!(0),
                    entry_price: dec!(0),
                    unrealized_pnl: dec!(0),
                },
            ],
            ..MockExchange::default()
        };
        let exchange = ExchangeBox::new(Arc::new(mock));
        let positions = exchange.open_positions("USDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "AAAUSDT");
    }
}
