use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use pairdesk::config::PairTradeConfig;
use pairdesk::desk::PairDesk;
use pairdesk::trade::execution::exchange_box::ExchangeBox;
use std::env;
use std::io::Write;
use std::sync::Arc;

const DEFAULT_LOG_FILTER: &str = "info,reqwest=warn,hyper=warn";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .context("invalid TIMEZONE_OFFSET")?;
    let offset = FixedOffset::east_opt(offset_seconds).context("TIMEZONE_OFFSET out of range")?;
    Builder::new()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .parse_filters(&env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()))
        .init();

    let git_hash = option_env!("PAIRDESK_GIT_HASH").unwrap_or("unknown");
    log::info!("pairdesk {} (git {})", env!("CARGO_PKG_VERSION"), git_hash);

    let cfg = PairTradeConfig::from_env_or_yaml().context("invalid pair trade config")?;
    let exchange = ExchangeBox::create(&cfg).context("failed to initialize exchange client")?;
    let mut desk = PairDesk::new(cfg, Arc::new(exchange));
    desk.run().await
}
