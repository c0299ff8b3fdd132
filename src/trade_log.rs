use crate::position::{Direction, PairPosition};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TRADE_LOG_HEADER: &str =
    "timestamp,trade_id,trade_type,symbol1,qty1,price1,symbol2,qty2,price2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeType {
    Long,
    Short,
    Close,
}

impl TradeType {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeType::Long => "LONG",
            TradeType::Short => "SHORT",
            TradeType::Close => "CLOSE",
        }
    }
}

impl From<Direction> for TradeType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => TradeType::Long,
            Direction::Short => TradeType::Short,
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub trade_id: String,
    pub trade_type: TradeType,
    pub symbol_a: String,
    pub qty_a: Decimal,
    pub price_a: Decimal,
    pub symbol_b: String,
    pub qty_b: Decimal,
    pub price_b: Decimal,
}

impl TradeLogEntry {
    pub fn opened(position: &PairPosition) -> Self {
        Self {
            timestamp: position.opened_at,
            trade_id: position.trade_id.clone(),
            trade_type: position.direction.into(),
            symbol_a: position.leg_a.symbol.clone(),
            qty_a: position.leg_a.quantity,
            price_a: position.leg_a.entry_price,
            symbol_b: position.leg_b.symbol.clone(),
            qty_b: position.leg_b.quantity,
            price_b: position.leg_b.entry_price,
        }
    }

    pub fn closed(position: &PairPosition, price_a: Decimal, price_b: Decimal) -> Self {
        Self {
            timestamp: Utc::now(),
            trade_type: TradeType::Close,
            price_a,
            price_b,
            ..Self::opened(position)
        }
    }

    fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.timestamp.to_rfc3339(),
            self.trade_id,
            self.trade_type,
            self.symbol_a,
            self.qty_a,
            self.price_a,
            self.symbol_b,
            self.qty_b,
            self.price_b
        )
    }
}

/// Append-only CSV record of opens and closes. Diagnostic, not authoritative.
#[derive(Debug, Clone)]
pub struct TradeLog {
    path: PathBuf,
}

impl TradeLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &TradeLogEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let needs_header = fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if needs_header {
            writeln!(file, "{}", TRADE_LOG_HEADER)?;
        }
        writeln!(file, "{}", entry.to_csv_line())?;
        Ok(())
    }

    /// Raw data lines (header excluded), oldest first.
    pub fn lines(&self) -> std::io::Result<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .skip(1)
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}
