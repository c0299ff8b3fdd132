use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::exchange::{
    ExchangeClient, ExchangeError, Kline, OrderRequest, RawExchangePosition, Side,
};
use crate::quantity::precision_from_step;

lazy_static! {
    static ref PAPER_FILL_PROBABILITY: Decimal = {
        match env::var("PAPER_FILL_PROBABILITY") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::ONE),
            Err(_) => Decimal::ONE,
        }
    };
}

// One JSONL line of the price recording
#[derive(Debug, Clone, Deserialize)]
struct PaperSymbolSnapshot {
    price: Decimal,
    #[serde(default)]
    qty_step: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct PaperDataEntry {
    timestamp: i64,
    prices: HashMap<String, PaperSymbolSnapshot>,
}

#[derive(Debug, Clone, Copy)]
struct PaperHolding {
    // positive long, negative short
    net: Decimal,
    entry_price: Decimal,
}

impl PaperHolding {
    fn apply_fill(&mut self, signed_qty: Decimal, price: Decimal) {
        let new_net = self.net + signed_qty;
        if self.net.is_zero() || self.net.is_sign_negative() == signed_qty.is_sign_negative() {
            self.entry_price =
                (self.entry_price * self.net.abs() + price * signed_qty.abs()) / new_net.abs();
        } else if !new_net.is_zero() && new_net.is_sign_negative() != self.net.is_sign_negative()
        {
            self.entry_price = price;
        }
        self.net = new_net;
    }
}

/// Simulated exchange replaying recorded prices. Market orders fill at the
/// current snapshot price and net into per-symbol holdings.
#[derive(Debug)]
pub struct PaperExchange {
    data: Vec<PaperDataEntry>,
    cursor: AtomicUsize,
    starting_equity: Decimal,
    holdings: Mutex<HashMap<String, PaperHolding>>,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn from_file<P: AsRef<Path>>(path: P, starting_equity: Decimal) -> Result<Self, ExchangeError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            ExchangeError::Other(format!("failed to open paper file {}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file), starting_equity)
    }

    pub fn from_reader<R: BufRead>(reader: R, starting_equity: Decimal) -> Result<Self, ExchangeError> {
        let mut data = Vec::new();
        for line in reader.lines() {
            let line = line
                .map_err(|e| ExchangeError::Other(format!("failed to read paper line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: PaperDataEntry = serde_json::from_str(&line).map_err(|e| {
                ExchangeError::Decode(format!("failed to parse paper entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(ExchangeError::Other(
                "paper price file is empty or invalid".to_string(),
            ));
        }
        data.sort_by_key(|e| e.timestamp);

        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
            starting_equity,
            holdings: Mutex::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
        })
    }

    /// Advances to the next recorded snapshot. Returns false at the end.
    pub fn tick(&self) -> bool {
        let current = self.cursor.load(AtomicOrdering::SeqCst);
        if current + 1 < self.data.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn current_timestamp_ms(&self) -> Option<i64> {
        self.data
            .get(self.cursor.load(AtomicOrdering::SeqCst))
            .map(|e| e.timestamp)
    }

    fn current_snapshot(&self, symbol: &str) -> Result<&PaperSymbolSnapshot, ExchangeError> {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let entry = self
            .data
            .get(cursor)
            .ok_or_else(|| ExchangeError::Other("paper cursor out of bounds".to_string()))?;
        entry.prices.get(symbol).ok_or_else(|| {
            ExchangeError::Other(format!(
                "symbol '{}' not found in paper entry at cursor {}",
                symbol, cursor
            ))
        })
    }

    fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.current_snapshot(symbol).ok().map(|s| s.price)
    }

    fn lock_holdings(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PaperHolding>>, ExchangeError> {
        self.holdings
            .lock()
            .map_err(|_| ExchangeError::Other("paper holdings lock poisoned".to_string()))
    }

    fn unrealized_pnl(&self, symbol: &str, holding: &PaperHolding) -> Decimal {
        self.current_price(symbol)
            .map(|price| (price - holding.entry_price) * holding.net)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.current_snapshot(symbol)?.price)
    }

    async fn get_kline_series(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        // one flat candle per recorded snapshot up to the cursor
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let end = (cursor + 1).min(self.data.len());
        let start = end.saturating_sub(limit);
        Ok(self.data[start..end]
            .iter()
            .filter_map(|entry| {
                entry.prices.get(symbol).map(|s| Kline {
                    start_ms: entry.timestamp,
                    open: s.price,
                    high: s.price,
                    low: s.price,
                    close: s.price,
                    volume: Decimal::ZERO,
                })
            })
            .collect())
    }

    async fn get_instrument_quantity_precision(&self, symbol: &str) -> Result<u32, ExchangeError> {
        match self.current_snapshot(symbol)?.qty_step {
            Some(step) => Ok(precision_from_step(step)),
            None => Err(ExchangeError::Other(format!(
                "no qty_step recorded for {}",
                symbol
            ))),
        }
    }

    async fn get_wallet_equity(&self) -> Result<Decimal, ExchangeError> {
        let holdings = self.lock_holdings()?;
        let upnl: Decimal = holdings
            .iter()
            .map(|(symbol, holding)| self.unrealized_pnl(symbol, holding))
            .sum();
        Ok(self.starting_equity + upnl)
    }

    async fn get_open_positions(
        &self,
        _settle_asset: &str,
    ) -> Result<Vec<RawExchangePosition>, ExchangeError> {
        let holdings = self.lock_holdings()?;
        let mut positions: Vec<RawExchangePosition> = holdings
            .iter()
            .filter(|(_, h)| !h.net.is_zero())
            .map(|(symbol, holding)| RawExchangePosition {
                symbol: symbol.clone(),
                side: if holding.net.is_sign_negative() {
                    Side::Sell
                } else {
                    Side::Buy
                },
                size: holding.net.abs(),
                entry_price: holding.entry_price,
                unrealized_pnl: self.unrealized_pnl(symbol, holding),
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Api {
                code: 10001,
                msg: format!("invalid qty {}", request.quantity),
            });
        }
        let fill_price = self.current_snapshot(&request.symbol)?.price;

        if *PAPER_FILL_PROBABILITY < Decimal::ONE {
            let roll = Decimal::from_f64_retain(rand::random::<f64>()).unwrap_or(Decimal::ZERO);
            if roll >= *PAPER_FILL_PROBABILITY {
                return Err(ExchangeError::Api {
                    code: 110007,
                    msg: "simulated rejection".to_string(),
                });
            }
        }

        let mut holdings = self.lock_holdings()?;
        let mut quantity = request.quantity;
        if request.reduce_only {
            let current = holdings.get(&request.symbol).map(|h| h.net).unwrap_or_default();
            let reduces = !current.is_zero()
                && current.is_sign_negative() != (request.side.sign().is_sign_negative());
            if !reduces {
                return Err(ExchangeError::Api {
                    code: 110017,
                    msg: "current position is zero, cannot fix reduce-only order qty".to_string(),
                });
            }
            quantity = quantity.min(current.abs());
        }

        let holding = holdings
            .entry(request.symbol.clone())
            .or_insert(PaperHolding {
                net: Decimal::ZERO,
                entry_price: Decimal::ZERO,
            });
        holding.apply_fill(request.side.sign() * quantity, fill_price);
        if holding.net.is_zero() {
            holdings.remove(&request.symbol);
        }

        let order_id = format!(
            "paper-{}",
            self.next_order_id.fetch_add(1, AtomicOrdering::SeqCst)
        );
        log::info!(
            "[PAPER_FILL] symbol={}, side={}, size={}, price={}, order_id={}",
            request.symbol,
            request.side,
            quantity,
            fill_price,
            order_id
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        // market orders fill immediately
        Err(ExchangeError::Api {
            code: 110001,
            msg: format!("order {} not exists or too late to cancel", order_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TAPE: &str = r#"{"timestamp":1700000060000,"prices":{"BTCUSDT":{"price":"50000","qty_step":"0.001"},"ETHUSDT":{"price":"2000","qty_step":"0.01"}}}
{"timestamp":1700000000000,"prices":{"BTCUSDT":{"price":"49000","qty_step":"0.001"},"ETHUSDT":{"price":"1900"}}}

{"timestamp":1700000120000,"prices":{"BTCUSDT":{"price":"51000"},"ETHUSDT":{"price":"1800"}}}
"#;

    fn paper() -> PaperExchange {
        PaperExchange::from_reader(TAPE.as_bytes(), dec!(10000)).unwrap()
    }

    #[test]
    fn empty_tape_is_rejected() {
        assert!(PaperExchange::from_reader("\n\n".as_bytes(), dec!(1)).is_err());
    }

    #[tokio::test]
    async fn replays_in_timestamp_order() {
        let p = paper();
        assert_eq!(p.current_timestamp_ms(), Some(1700000000000));
        assert_eq!(p.get_ticker_price("BTCUSDT").await.unwrap(), dec!(49000));
        assert!(p.tick());
        assert_eq!(p.get_ticker_price("BTCUSDT").await.unwrap(), dec!(50000));
        assert!(p.tick());
        assert!(!p.tick());
        assert!(p.get_ticker_price("SOLUSDT").await.is_err());

        let klines = p.get_kline_series("ETHUSDT", "1", 2).await.unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].close, dec!(2000));
        assert_eq!(klines[1].close, dec!(1800));
    }

    #[tokio::test]
    async fn precision_comes_from_qty_step() {
        let p = paper();
        assert_eq!(p.get_instrument_quantity_precision("BTCUSDT").await.unwrap(), 3);
        assert!(p.get_instrument_quantity_precision("ETHUSDT").await.is_err());
    }

    #[tokio::test]
    async fn fills_net_and_mark_to_market() {
        let p = paper();
        p.tick();
        p.place_order(&OrderRequest::market("BTCUSDT", Side::Sell, dec!(0.02)))
            .await
            .unwrap();
        p.place_order(&OrderRequest::market("ETHUSDT", Side::Buy, dec!(0.5)))
            .await
            .unwrap();
        p.tick();

        let positions = p.get_open_positions("USDT").await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].side, Side::Sell);
        assert_eq!(positions[0].size, dec!(0.02));
        assert_eq!(positions[0].unrealized_pnl, dec!(-20));
        assert_eq!(positions[1].unrealized_pnl, dec!(-100));
        assert_eq!(p.get_wallet_equity().await.unwrap(), dec!(9880));

        p.place_order(&OrderRequest::reduce_only("BTCUSDT", Side::Buy, dec!(0.05)))
            .await
            .unwrap();
        let positions = p.get_open_positions("USDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn reduce_only_without_position_is_rejected() {
        let p = paper();
        let err = p
            .place_order(&OrderRequest::reduce_only("BTCUSDT", Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("110017"));
        assert!(p.cancel_order("BTCUSDT", "paper-1").await.is_err());
    }

    #[test]
    fn averaging_and_flip() {
        let mut h = PaperHolding {
            net: Decimal::ZERO,
            entry_price: Decimal::ZERO,
        };
        h.apply_fill(dec!(1), dec!(100));
        h.apply_fill(dec!(1), dec!(200));
        assert_eq!(h.entry_price, dec!(150));
        h.apply_fill(dec!(-1), dec!(300));
        assert_eq!(h.entry_price, dec!(150));
        h.apply_fill(dec!(-3), dec!(120));
        assert_eq!(h.net, dec!(-2));
        assert_eq!(h.entry_price, dec!(120));
    }
}
