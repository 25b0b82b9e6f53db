use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::execution::retry::{Classify, FailureKind};
use crate::models::{DailyBar, HoldingKind, HoldingRow, OrderId, OrderRequest, QuoteField};

/// Errors surfaced by a brokerage backend
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error ({status})")]
    Server { status: u16 },

    #[error("rate limited by broker")]
    RateLimited,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad request ({status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected [{code}]: {message}")]
    Rejected { code: String, message: String },
}

impl Classify for BrokerError {
    fn classify(&self) -> FailureKind {
        match self {
            BrokerError::Timeout
            | BrokerError::Connection(_)
            | BrokerError::Server { .. }
            | BrokerError::RateLimited => FailureKind::Transient,
            BrokerError::Auth(_)
            | BrokerError::BadRequest { .. }
            | BrokerError::Malformed(_)
            | BrokerError::Rejected { .. } => FailureKind::Fatal,
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else if e.is_decode() {
            BrokerError::Malformed(e.to_string())
        } else {
            BrokerError::Connection(e.to_string())
        }
    }
}

/// Brokerage operations the trading core depends on
#[async_trait]
pub trait Broker: Send + Sync {
    /// Refresh credentials if they are missing or close to expiry
    async fn ensure_session(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn quote(&self, symbol: &str, field: QuoteField) -> Result<f64, BrokerError>;

    /// Daily bars between `from` and `to` inclusive, in any order
    async fn daily_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>, BrokerError>;

    async fn holdings(&self, kind: HoldingKind) -> Result<Vec<HoldingRow>, BrokerError>;

    /// Maximum amount purchasable on credit for `symbol`
    async fn credit_buying_power(&self, symbol: &str) -> Result<f64, BrokerError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderId, BrokerError>;

    /// Display name for notifications
    async fn symbol_name(&self, symbol: &str) -> Result<String, BrokerError> {
        Ok(symbol.to_string())
    }
}
