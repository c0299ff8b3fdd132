use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;

use crate::exchange::RawExchangePosition;
use crate::position::PairPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscrepancyKind {
    /// Exchange holds a position the ledger knows nothing about.
    Untracked,
    /// Ledger expects a position the exchange does not report.
    Missing,
    Mismatch,
}

impl DiscrepancyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscrepancyKind::Untracked => "untracked",
            DiscrepancyKind::Missing => "missing",
            DiscrepancyKind::Mismatch => "mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub symbol: String,
    pub kind: DiscrepancyKind,
    /// Signed net quantity, long positive.
    pub ledger_net: Decimal,
    pub exchange_net: Decimal,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}: ledger={} exchange={}",
            self.symbol,
            self.kind.as_str(),
            self.ledger_net,
            self.exchange_net
        )
    }
}

/// Compares net signed quantity per symbol between the ledger and the
/// exchange. Read-only.
pub fn reconcile(
    positions: &[PairPosition],
    raw: &[RawExchangePosition],
    tolerance: Decimal,
) -> Vec<Discrepancy> {
    let mut nets: BTreeMap<&str, (Decimal, Decimal)> = BTreeMap::new();
    for position in positions {
        for leg in position.legs() {
            nets.entry(leg.symbol.as_str()).or_default().0 += leg.quantity * leg.side.sign();
        }
    }
    for p in raw {
        nets.entry(p.symbol.as_str()).or_default().1 += p.size * p.side.sign();
    }

    nets.into_iter()
        .filter(|(_, (ledger, exchange))| (*ledger - *exchange).abs() > tolerance)
        .map(|(symbol, (ledger_net, exchange_net))| {
            let kind = if ledger_net.is_zero() {
                DiscrepancyKind::Untracked
            } else if exchange_net.is_zero() {
                DiscrepancyKind::Missing
            } else {
                DiscrepancyKind::Mismatch
            };
            Discrepancy {
                symbol: symbol.to_string(),
                kind,
                ledger_net,
                exchange_net,
            }
        })
        .collect()
}
