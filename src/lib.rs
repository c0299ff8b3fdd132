// src/lib.rs
pub mod ports {
    pub mod bybit;
    pub mod paper_exchange;
}
pub mod trade {
    pub mod execution {
        pub mod exchange_box;
    }
}
pub mod config;
pub mod desk;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod ledger;
pub mod pnl;
pub mod position;
pub mod quantity;
pub mod rate_limit_notifier;
pub mod ratio;
pub mod reconcile;
pub mod trade_log;
