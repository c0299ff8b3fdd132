use crate::error::PairTradeError;
use crate::exchange::Side;
use crate::position::{truncate_to_minute, Direction, Leg, PairPosition};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const LEGACY_RESERVED_KEYS: [&str; 5] = [
    "type",
    "trade_id",
    "timestamp",
    "timestamp_rounded",
    "combined_upnl",
];

/// Open pair positions, persisted as a JSON array. A missing file and an
/// empty list are the same state.
#[derive(Debug)]
pub struct PositionLedger {
    path: PathBuf,
    positions: Vec<PairPosition>,
}

impl PositionLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let mut ledger = Self {
            path: path.as_ref().to_path_buf(),
            positions: Vec::new(),
        };
        ledger.load();
        ledger
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the in-memory sequence with what is on disk.
    pub fn load(&mut self) -> &[PairPosition] {
        self.positions = read_positions(&self.path);
        &self.positions
    }

    pub fn save(&self) -> Result<(), PairTradeError> {
        if self.positions.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => log::debug!("[LEDGER] no open positions, removed {}", self.path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.positions)?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!(
            "[LEDGER] saved {} position(s) to {}",
            self.positions.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn append(&mut self, position: PairPosition) {
        self.positions.push(position);
    }

    pub fn remove_at(&mut self, index: usize) -> Result<PairPosition, PairTradeError> {
        if index >= self.positions.len() {
            return Err(PairTradeError::IndexOutOfRange {
                index,
                len: self.positions.len(),
            });
        }
        Ok(self.positions.remove(index))
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    pub fn positions(&self) -> &[PairPosition] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut [PairPosition] {
        &mut self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredPosition {
    Current(PairPosition),
    Legacy(Map<String, Value>),
}

fn read_positions(path: &Path) -> Vec<PairPosition> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            log::warn!("[LEDGER] failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    if content.trim().is_empty() {
        return Vec::new();
    }
    match parse_positions(&content) {
        Ok(positions) => positions,
        Err(e) => {
            log::warn!(
                "[LEDGER] failed to parse {}, treating as no open positions: {}",
                path.display(),
                e
            );
            Vec::new()
        }
    }
}

fn parse_positions(content: &str) -> Result<Vec<PairPosition>, PairTradeError> {
    let stored: Vec<StoredPosition> = serde_json::from_str(content)?;
    stored
        .into_iter()
        .map(|entry| match entry {
            StoredPosition::Current(position) => {
                check_legs(&position)?;
                Ok(position)
            }
            StoredPosition::Legacy(map) => {
                let position = from_legacy(&map)?;
                check_legs(&position)?;
                log::info!(
                    "[LEDGER] converted legacy record {} ({})",
                    position.trade_id,
                    position.pair_label()
                );
                Ok(position)
            }
        })
        .collect()
}

/// Every stored pair must hold one Buy and one Sell leg, both with size.
fn check_legs(position: &PairPosition) -> Result<(), PairTradeError> {
    if position.leg_a.side == position.leg_b.side {
        return Err(PairTradeError::Persistence(format!(
            "position {} has two {} legs",
            position.trade_id, position.leg_a.side
        )));
    }
    if let Some(leg) = position.legs().into_iter().find(|l| l.quantity <= Decimal::ZERO) {
        return Err(PairTradeError::Persistence(format!(
            "position {} has non-positive quantity {} for {}",
            position.trade_id, leg.quantity, leg.symbol
        )));
    }
    Ok(())
}

/// Older files stored each leg under its symbol name next to the metadata
/// keys. Leg order is recovered from the direction: leg A is the Sell leg of
/// a long and the Buy leg of a short.
fn from_legacy(map: &Map<String, Value>) -> Result<PairPosition, PairTradeError> {
    let bad = |what: &str| PairTradeError::Persistence(format!("legacy record: {}", what));

    let direction: Direction = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| bad("missing type"))?
        .parse()
        .map_err(|e: String| bad(&e))?;

    let mut legs = Vec::new();
    for (symbol, value) in map {
        if LEGACY_RESERVED_KEYS.contains(&symbol.as_str()) {
            continue;
        }
        let Some(obj) = value.as_object() else {
            continue;
        };
        let side = match obj.get("side").and_then(Value::as_str) {
            Some("Buy") => Side::Buy,
            Some("Sell") => Side::Sell,
            _ => return Err(bad("leg side")),
        };
        legs.push(Leg {
            symbol: symbol.clone(),
            side,
            quantity: decimal_field(obj.get("qty")).ok_or_else(|| bad("leg qty"))?,
            entry_price: decimal_field(obj.get("entry_price"))
                .ok_or_else(|| bad("leg entry_price"))?,
        });
    }
    if legs.len() != 2 || legs[0].side == legs[1].side {
        return Err(bad("expected one Buy and one Sell leg"));
    }
    let (first_side, _) = direction.leg_sides();
    let (leg_a, leg_b) = if legs[0].side == first_side {
        (legs.remove(0), legs.remove(0))
    } else {
        let leg_b = legs.remove(0);
        (legs.remove(0), leg_b)
    };

    let opened_at = map
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .ok_or_else(|| bad("timestamp"))?;
    let opened_at_rounded = map
        .get("timestamp_rounded")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(|| truncate_to_minute(opened_at));

    Ok(PairPosition {
        trade_id: map
            .get("trade_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        direction,
        opened_at,
        opened_at_rounded,
        leg_a,
        leg_b,
        combined_unrealized_pnl: decimal_field(map.get("combined_upnl")).unwrap_or_default(),
    })
}

fn decimal_field(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Accepts RFC 3339 or naive local ISO timestamps.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
}
