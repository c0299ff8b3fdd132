use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NOTIFY_INTERVAL: Duration = Duration::from_secs(60);

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> = Lazy::new(RateLimitNotifier::new);

/// Warns about exchange throttling at most once a minute per operation.
pub fn notify_rate_limit(context: &str, detail: &str) -> bool {
    RATE_LIMIT_NOTIFIER.notify(context, detail)
}

pub fn is_rate_limited(err_text: &str) -> bool {
    err_text.contains("429")
        || err_text.contains("Too Many Requests")
        || err_text.contains("API error 10006")
        || err_text.contains("Too many visits")
}

struct RateLimitNotifier {
    last_notified: Mutex<HashMap<String, Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        Self {
            last_notified: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, context: &str, detail: &str) -> bool {
        let Ok(mut last) = self.last_notified.lock() else {
            return false;
        };
        let now = Instant::now();
        if let Some(prev) = last.get(context) {
            if now.duration_since(*prev) < NOTIFY_INTERVAL {
                log::debug!("[RateLimit] {} still throttled: {}", context, detail);
                return false;
            }
        }
        last.insert(context.to_string(), now);
        log::warn!(
            "[RateLimit] exchange throttling detected while {} (detail: {})",
            context,
            detail
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_throttling_messages() {
        assert!(is_rate_limited("HTTP error: 429 Too Many Requests"));
        assert!(is_rate_limited("API error 10006: Too many visits!"));
        assert!(!is_rate_limited("API error 110007: ab not enough"));
    }

    #[test]
    fn repeated_notifications_are_suppressed() {
        let notifier = RateLimitNotifier::new();
        assert!(notifier.notify("get_ticker (XUSDT)", "429"));
        assert!(!notifier.notify("get_ticker (XUSDT)", "429"));
        assert!(notifier.notify("get_ticker (YUSDT)", "429"));
    }
}
