use anyhow::Result;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Duration, MissedTickBehavior};

use crate::config::{normalize_symbol, PairTradeConfig};
use crate::executor::PairExecutor;
use crate::ledger::PositionLedger;
use crate::pnl::build_snapshot;
use crate::position::{pair_label, Direction};
use crate::ratio::{entry_markers, latest_ratio, pair_ratio_series, sparkline};
use crate::reconcile::reconcile;
use crate::trade::execution::exchange_box::ExchangeBox;
use crate::trade_log::TradeLog;

const SPARKLINE_WIDTH: usize = 60;

const HELP: &str = "commands:
  long                 open long on the ratio (sell A, buy B)
  short                open short on the ratio (buy A, sell B)
  close <index>        close one pair position
  close-all            close every pair position
  size <usd>           set the order size
  pair <a> <b>         set the traded symbols
  status               print equity and PnL now
  chart                print the B/A ratio with entry markers
  help                 this text
  quit                 exit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(Direction),
    Close(usize),
    CloseAll,
    Size(Decimal),
    Pair(String, String),
    Status,
    Chart,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            return Err("empty command".to_string());
        };
        let args: Vec<&str> = parts.collect();
        let command = match (head.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("long", []) => Command::Open(Direction::Long),
            ("short", []) => Command::Open(Direction::Short),
            ("close", [index]) => Command::Close(
                index
                    .parse::<usize>()
                    .map_err(|_| format!("invalid position index '{}'", index))?,
            ),
            ("close-all" | "closeall", []) => Command::CloseAll,
            ("size", [amount]) => Command::Size(
                Decimal::from_str(amount.trim_start_matches('$'))
                    .map_err(|_| format!("invalid order size '{}'", amount))?,
            ),
            ("pair", [a, b]) => Command::Pair(a.to_string(), b.to_string()),
            ("status", []) => Command::Status,
            ("chart", []) => Command::Chart,
            ("help" | "?", []) => Command::Help,
            ("quit" | "exit", []) => Command::Quit,
            _ => return Err(format!("unknown command '{}', type 'help'", line.trim())),
        };
        Ok(command)
    }
}

/// Interactive pair-trading console: operator commands on stdin and a
/// periodic PnL refresh, both on the current-thread runtime.
pub struct PairDesk {
    cfg: PairTradeConfig,
    exchange: Arc<ExchangeBox>,
    executor: PairExecutor,
    order_size: Decimal,
    symbol_a: String,
    symbol_b: String,
}

impl PairDesk {
    pub fn new(cfg: PairTradeConfig, exchange: Arc<ExchangeBox>) -> Self {
        let ledger = PositionLedger::open(&cfg.position_file);
        log::info!(
            "[LEDGER] {} open position(s) loaded from {}",
            ledger.len(),
            ledger.path().display()
        );
        let executor = PairExecutor::new(
            exchange.clone(),
            ledger,
            TradeLog::new(&cfg.trade_log_file),
        );
        Self {
            order_size: cfg.default_order_size,
            symbol_a: cfg.symbol_a.clone(),
            symbol_b: cfg.symbol_b.clone(),
            cfg,
            exchange,
            executor,
        }
    }

    pub fn order_size(&self) -> Decimal {
        self.order_size
    }

    pub fn symbols(&self) -> (&str, &str) {
        (&self.symbol_a, &self.symbol_b)
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] exchange={:?} testnet={} pair={} order_size={} refresh={}ms",
            self.cfg.exchange,
            self.cfg.testnet,
            pair_label(&self.symbol_a, &self.symbol_b),
            self.order_size,
            self.cfg.refresh_interval_ms
        );
        emit(&[HELP.to_string()]);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.refresh_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(false) = self.exchange.advance_paper() {
                        log::debug!("[PAPER] end of recorded prices, holding last snapshot");
                    }
                    let output = self.status().await;
                    emit(&output);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match line.parse::<Command>() {
                            Ok(command) => {
                                if !self.handle_command(command).await {
                                    break;
                                }
                            }
                            Err(e) => emit(&[e]),
                        }
                    }
                    Ok(None) => {
                        log::info!("stdin closed, exiting");
                        break;
                    }
                    Err(e) => {
                        log::error!("failed to read command: {}", e);
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Returns `false` when the desk should stop.
    pub async fn handle_command(&mut self, command: Command) -> bool {
        let output = match command {
            Command::Open(direction) => self.open(direction).await,
            Command::Close(index) => self.close(index).await,
            Command::CloseAll => self.close_all().await,
            Command::Size(size) => vec![match self.set_order_size(size) {
                Ok(()) => format!("order size set to ${}", self.order_size),
                Err(e) => e,
            }],
            Command::Pair(a, b) => vec![match self.set_pair(&a, &b) {
                Ok(()) => format!("pair set to {}", pair_label(&self.symbol_a, &self.symbol_b)),
                Err(e) => e,
            }],
            Command::Status => self.status().await,
            Command::Chart => self.chart().await,
            Command::Help => vec![HELP.to_string()],
            Command::Quit => return false,
        };
        emit(&output);
        true
    }

    pub fn set_order_size(&mut self, size: Decimal) -> Result<(), String> {
        if !self.cfg.order_size_in_bounds(size) {
            return Err(format!(
                "order size must be between ${} and ${}",
                self.cfg.min_order_size, self.cfg.max_order_size
            ));
        }
        self.order_size = size;
        Ok(())
    }

    pub fn set_pair(&mut self, symbol_a: &str, symbol_b: &str) -> Result<(), String> {
        let a = normalize_symbol(symbol_a);
        let b = normalize_symbol(symbol_b);
        if a.is_empty() || b.is_empty() {
            return Err("both symbols are required".to_string());
        }
        log::info!("[CONFIG] pair changed to {}/{}", a, b);
        self.symbol_a = a;
        self.symbol_b = b;
        Ok(())
    }

    async fn open(&mut self, direction: Direction) -> Vec<String> {
        let symbol_a = self.symbol_a.clone();
        let symbol_b = self.symbol_b.clone();
        match self
            .executor
            .open(direction, &symbol_a, &symbol_b, self.order_size)
            .await
        {
            Ok(report) => {
                let p = &report.position;
                vec![format!(
                    "opened {} {}: {} {} {} @ {} | {} {} {} @ {}",
                    direction,
                    p.pair_label(),
                    p.leg_a.side,
                    p.leg_a.quantity,
                    p.leg_a.symbol,
                    p.leg_a.entry_price,
                    p.leg_b.side,
                    p.leg_b.quantity,
                    p.leg_b.symbol,
                    p.leg_b.entry_price
                )]
            }
            Err(e) => vec![format!("open failed: {}", e)],
        }
    }

    async fn close(&mut self, index: usize) -> Vec<String> {
        match self.executor.close(index).await {
            Ok(report) => {
                let mut out = vec![format!(
                    "closed [{}] {} {}",
                    index,
                    report.position.direction,
                    report.position.pair_label()
                )];
                for leg in report.failed_legs() {
                    out.push(format!(
                        "WARNING: {} {} {} is still open on the exchange",
                        leg.side, leg.quantity, leg.symbol
                    ));
                }
                out
            }
            Err(e) => vec![format!("close failed: {}", e)],
        }
    }

    async fn close_all(&mut self) -> Vec<String> {
        match self.executor.close_all().await {
            Ok(true) => vec!["closed all pair positions".to_string()],
            Ok(false) => vec!["no open positions".to_string()],
            Err(e) => vec![format!("close-all failed: {}", e)],
        }
    }

    pub async fn status(&mut self) -> Vec<String> {
        self.executor.reload();
        let snapshot = build_snapshot(
            &self.exchange,
            self.executor.positions_mut(),
            self.order_size,
            &self.cfg.settle_coin,
        )
        .await;
        let mut out = snapshot.render();
        if let Some(raw) = &snapshot.raw_positions {
            for d in reconcile(self.executor.positions(), raw, self.cfg.reconcile_tolerance) {
                log::warn!("[RECONCILE] {}", d);
                out.push(format!("RECONCILE: {}", d));
            }
        }
        out
    }

    pub async fn chart(&mut self) -> Vec<String> {
        let interval = self.cfg.chart_interval.clone();
        let limit = self.cfg.chart_limit;
        let klines_a = self.exchange.kline_series(&self.symbol_a, &interval, limit).await;
        let klines_b = self.exchange.kline_series(&self.symbol_b, &interval, limit).await;
        let (Some(klines_a), Some(klines_b)) = (klines_a, klines_b) else {
            return vec!["chart data unavailable".to_string()];
        };
        let series = pair_ratio_series(&klines_a, &klines_b);
        let Some(latest) = latest_ratio(&series) else {
            return vec!["no overlapping candles for this pair".to_string()];
        };

        self.executor.reload();
        let positions: Vec<_> = self
            .executor
            .positions()
            .iter()
            .filter(|p| p.leg_a.symbol == self.symbol_a && p.leg_b.symbol == self.symbol_b)
            .cloned()
            .collect();
        let markers = entry_markers(&series, &positions);

        let mut out = vec![
            format!(
                "{} ratio ({} candles of {}): latest {}",
                pair_label(&self.symbol_a, &self.symbol_b),
                series.len(),
                interval,
                latest.round_dp(8)
            ),
            sparkline(&series, SPARKLINE_WIDTH),
        ];
        for marker in markers {
            let at = Utc
                .timestamp_millis_opt(marker.start_ms)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| marker.start_ms.to_string());
            out.push(format!(
                "  {} {} @ {} ({})",
                marker.arrow(),
                at,
                marker.ratio.round_dp(8),
                marker.trade_id
            ));
        }
        out
    }
}

fn emit(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}
