// =============================================================================
// Service Configuration — loaded once at startup, never hot-reloaded
// =============================================================================
//
// Unlike the strategy document, which the Strategy Service hot-swaps on every
// file change, this configuration governs the process itself: where it binds,
// where it persists state, how it talks to the exchange. It is read once at
// startup from environment variables (following this repository's existing
// `.env` convention) and is immutable for the life of the process.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match std::env::var(key) {
        Ok(v) => Decimal::from_str(&v).with_context(|| format!("{key} is not a valid decimal: {v}")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} is not a valid integer: {v}")),
        Err(_) => Ok(default),
    }
}

/// Top-level process configuration, assembled once in `main` and shared
/// read-only through `AppState`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub state_dir: PathBuf,
    pub strategy_path: PathBuf,
    pub admin_token: Option<String>,

    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub exchange_base_url: String,
    pub exchange_ws_url: String,
    pub max_reconnect_attempts: u64,
    pub reconnect_delay_seconds: u64,

    pub paper_initial_balance_usd: Decimal,
    pub paper_slippage_pct: Decimal,
    pub paper_commission_rate: Decimal,

    pub reload_latency_ms: u64,
    pub validity_check_interval_ms: u64,
    pub default_lot_increment: Decimal,
    pub default_min_lot_size: Decimal,

    pub consecutive_failure_limit: u64,
}

impl ServiceConfig {
    /// Load from environment, applying `.env` first if present (mirrors the
    /// startup sequence already used in this repository's `main`).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let state_dir = PathBuf::from(env_or("STATE_DIR", "./state"));
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state directory {}", state_dir.display()))?;

        Ok(Self {
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            strategy_path: PathBuf::from(env_or("STRATEGY_PATH", "./strategy.json")),
            admin_token: std::env::var("ADMIN_TOKEN").ok(),

            exchange_api_key: env_or("EXCHANGE_API_KEY", ""),
            exchange_api_secret: env_or("EXCHANGE_API_SECRET", ""),
            exchange_base_url: env_or("EXCHANGE_BASE_URL", "https://api.binance.com"),
            exchange_ws_url: env_or("EXCHANGE_WS_URL", "wss://stream.binance.com:9443"),
            max_reconnect_attempts: env_u64("MAX_RECONNECT_ATTEMPTS", 10)?,
            reconnect_delay_seconds: env_u64("RECONNECT_DELAY_SECONDS", 5)?,

            paper_initial_balance_usd: env_decimal("PAPER_INITIAL_BALANCE_USD", Decimal::new(10_000, 0))?,
            paper_slippage_pct: env_decimal("PAPER_SLIPPAGE_PCT", Decimal::new(1, 3))?,
            paper_commission_rate: env_decimal("PAPER_COMMISSION_RATE", Decimal::new(5, 4))?,

            reload_latency_ms: env_u64("RELOAD_LATENCY_MS", 500)?,
            validity_check_interval_ms: env_u64("VALIDITY_CHECK_INTERVAL_MS", 5_000)?,
            default_lot_increment: env_decimal("DEFAULT_LOT_INCREMENT", Decimal::new(1, 4))?,
            default_min_lot_size: env_decimal("DEFAULT_MIN_LOT_SIZE", Decimal::new(1, 4))?,

            consecutive_failure_limit: env_u64("CONSECUTIVE_FAILURE_LIMIT", 5)?,

            state_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_decimal_falls_back_to_default_when_unset() {
        std::env::remove_var("SOME_UNSET_DECIMAL_KEY_FOR_TEST");
        let value = env_decimal("SOME_UNSET_DECIMAL_KEY_FOR_TEST", Decimal::new(5, 1)).unwrap();
        assert_eq!(value, Decimal::new(5, 1));
    }

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("SOME_UNSET_STRING_KEY_FOR_TEST");
        assert_eq!(env_or("SOME_UNSET_STRING_KEY_FOR_TEST", "fallback"), "fallback");
    }
}
