use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::credit_allocator::allocate;
use super::rate_limiter::{LimiterClosed, RateLimiter};
use super::retry::{RetryError, RetryPolicy};
use crate::api::{Broker, BrokerError};
use crate::models::{
    Funding, LotKey, OrderId, OrderIntent, OrderOutcome, OrderRequest, Position, Side,
};

/// Pause between per-lot sell orders
const LOT_ORDER_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Error)]
pub enum RejectReason {
    #[error("rejected by broker [{code}]: {message}")]
    Broker { code: String, message: String },

    #[error("submission failed: {0}")]
    Transport(BrokerError),

    #[error(transparent)]
    Limiter(#[from] LimiterClosed),
}

impl From<BrokerError> for RejectReason {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Rejected { code, message } => RejectReason::Broker { code, message },
            other => RejectReason::Transport(other),
        }
    }
}

/// Outcome of executing one intent
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub accepted: Vec<(OrderRequest, OrderId)>,
    pub rejected: Vec<(OrderRequest, RejectReason)>,
}

impl ExecutionReport {
    pub fn outcome(&self) -> OrderOutcome {
        match (self.accepted.is_empty(), self.rejected.is_empty()) {
            (false, true) => OrderOutcome::Accepted,
            (false, false) => OrderOutcome::Partial,
            (true, _) => OrderOutcome::Rejected,
        }
    }

    /// Every order reached the book
    pub fn is_accepted(&self) -> bool {
        self.outcome() == OrderOutcome::Accepted
    }

    pub fn accepted_quantity(&self) -> u64 {
        self.accepted.iter().map(|(o, _)| o.quantity).sum()
    }
}

/// Routes intents to the broker's cash or credit order endpoints
pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    limiter: RateLimiter,
    min_credit_buying_power: f64,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn Broker>, limiter: RateLimiter, min_credit_buying_power: f64) -> Self {
        Self {
            broker,
            limiter,
            min_credit_buying_power,
        }
    }

    /// Submit one order. Never retried: a lost response could mean a live order.
    pub async fn submit(&self, order: &OrderRequest) -> Result<OrderId, RejectReason> {
        let _permit = self.limiter.acquire().await?;
        let label = format!("{} {} {}", order.side, order.quantity, order.symbol);

        RetryPolicy::no_retry()
            .run(&label, |_| self.broker.submit_order(order))
            .await
            .map_err(|e: RetryError<BrokerError>| RejectReason::from(e.into_inner()))
    }

    /// Whether the account may open a credit position in `symbol`
    async fn credit_eligible(&self, symbol: &str) -> bool {
        let power = match self.limiter.acquire().await {
            Ok(_permit) => self.broker.credit_buying_power(symbol).await,
            Err(e) => {
                tracing::warn!(symbol, "Credit check skipped: {}", e);
                return false;
            }
        };

        match power {
            Ok(amount) if amount >= self.min_credit_buying_power => true,
            Ok(amount) => {
                tracing::info!(
                    symbol,
                    buying_power = amount,
                    "Credit buying power below threshold, buying with cash"
                );
                false
            }
            Err(e) => {
                tracing::warn!(symbol, "Credit check failed, buying with cash: {}", e);
                false
            }
        }
    }

    /// Turn an intent into broker orders.
    ///
    /// Buys go out as one order, on credit when eligible. Sells are split
    /// across the position's lots and each lot is sold against its own loan.
    pub async fn execute(
        &self,
        intent: &OrderIntent,
        position: Option<&Position>,
        today: NaiveDate,
    ) -> ExecutionReport {
        let orders = match intent.side {
            Side::Buy => {
                let funding = if intent.credit && self.credit_eligible(&intent.symbol).await {
                    Funding::Credit {
                        loan_date: today.format("%Y%m%d").to_string(),
                    }
                } else {
                    Funding::Cash
                };
                vec![OrderRequest {
                    symbol: intent.symbol.clone(),
                    side: Side::Buy,
                    quantity: intent.quantity,
                    mode: intent.mode,
                    funding,
                }]
            }
            Side::Sell => {
                let empty = BTreeMap::new();
                let lots = position.map(|p| &p.lots).unwrap_or(&empty);
                allocate(&intent.symbol, intent.quantity, lots)
                    .into_iter()
                    .map(|a| OrderRequest {
                        symbol: intent.symbol.clone(),
                        side: Side::Sell,
                        quantity: a.quantity,
                        mode: intent.mode,
                        funding: match a.lot {
                            LotKey::Cash => Funding::Cash,
                            LotKey::Loan(loan_date) => Funding::Credit { loan_date },
                        },
                    })
                    .collect()
            }
        };

        let mut report = ExecutionReport::default();
        let count = orders.len();

        for (i, order) in orders.into_iter().enumerate() {
            match self.submit(&order).await {
                Ok(id) => {
                    tracing::info!(
                        order_id = %id,
                        symbol = %order.symbol,
                        side = %order.side,
                        quantity = order.quantity,
                        funding = ?order.funding,
                        "✅ Order accepted"
                    );
                    report.accepted.push((order, id));
                }
                Err(reason) => {
                    tracing::warn!(
                        symbol = %order.symbol,
                        side = %order.side,
                        quantity = order.quantity,
                        "❌ Order rejected: {}",
                        reason
                    );
                    report.rejected.push((order, reason));
                }
            }

            if i + 1 < count {
                tokio::time::sleep(LOT_ORDER_PAUSE).await;
            }
        }

        report
    }
}
