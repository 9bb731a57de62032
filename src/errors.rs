// =============================================================================
// Typed error taxonomy for the exchange boundary
// =============================================================================
//
// The core mostly propagates with `anyhow`, matching the rest of this
// repository. The exchange adapter boundary is the one place callers need to
// match on *kind* (the Order Router decides idempotency and failure-tracking
// behavior differently for a rate limit than for an authentication failure),
// so that boundary returns these typed variants instead.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeAdapterError {
    #[error("rate limited, resumes at {resumes_at}")]
    RateLimit {
        resumes_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("no market data cached for asset {0}")]
    NoMarketData(String),

    #[error("exchange rejected order: {0}")]
    Rejected(String),

    #[error("transient exchange error: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ExchangeAdapterError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    /// Every variant except a rate limit counts as a failure for the Failure
    /// Tracker — a rate limit is a cool-down, not a broken order path.
    pub fn counts_as_failure(&self) -> bool {
        !self.is_rate_limit()
    }
}

