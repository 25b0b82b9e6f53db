use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::price_feed::{guarded, FetchError};
use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use crate::api::Broker;
use crate::models::{HoldingKind, HoldingRow, LotKey, Position};

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub positions: HashMap<String, Position>,
    /// Symbols served from the previous snapshot because a query failed
    pub stale: HashSet<String>,
    pub failed: Vec<HoldingKind>,
}

impl Reconciliation {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn is_stale(&self, symbol: &str) -> bool {
        self.stale.contains(symbol)
    }

    /// Both holdings queries succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    product_name: String,
    held: u64,
    orderable: u64,
    cost: f64,
    loans: BTreeMap<LotKey, u64>,
    cash_orderable: u64,
}

impl Accumulator {
    fn add(&mut self, kind: HoldingKind, row: &HoldingRow) {
        if self.product_name.is_empty() {
            self.product_name = row.product_name.clone();
        }
        self.held += row.held_qty;
        self.orderable += row.orderable_qty;
        self.cost += row.avg_cost * row.held_qty as f64;

        let loan_date = row.loan_date.as_deref().filter(|d| !d.trim().is_empty());
        match (kind, loan_date) {
            (HoldingKind::Credit, Some(date)) => {
                *self.loans.entry(LotKey::Loan(date.to_string())).or_default() += row.orderable_qty;
            }
            _ => self.cash_orderable += row.orderable_qty,
        }
    }

    fn finish(self, symbol: String) -> Position {
        let mut lots = self.loans;
        if !lots.is_empty() && self.cash_orderable > 0 {
            lots.insert(LotKey::Cash, self.cash_orderable);
        }
        let avg_cost = if self.held > 0 {
            self.cost / self.held as f64
        } else {
            0.0
        };

        Position {
            symbol,
            held_qty: self.held,
            orderable_qty: self.orderable,
            avg_cost,
            product_name: self.product_name,
            lots,
        }
    }
}

/// Merge holdings rows from both queries into one position per symbol
pub fn merge_holdings<'a>(
    rows: impl IntoIterator<Item = (HoldingKind, &'a HoldingRow)>,
) -> HashMap<String, Position> {
    let mut acc: HashMap<String, Accumulator> = HashMap::new();
    for (kind, row) in rows {
        if row.held_qty == 0 {
            continue;
        }
        acc.entry(row.symbol.clone()).or_default().add(kind, row);
    }

    acc.into_iter()
        .map(|(symbol, a)| (symbol.clone(), a.finish(symbol)))
        .collect()
}

/// Rebuilds the position book from the broker every cycle
pub struct PositionTracker {
    broker: Arc<dyn Broker>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    last: HashMap<String, Position>,
}

impl PositionTracker {
    pub fn new(broker: Arc<dyn Broker>, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            broker,
            limiter,
            retry,
            last: HashMap::new(),
        }
    }

    async fn query(&self, kind: HoldingKind) -> Result<Vec<HoldingRow>, FetchError> {
        let label = format!("{} holdings", kind);
        guarded(&self.limiter, &self.retry, &label, || self.broker.holdings(kind)).await
    }

    /// Query credit and cash holdings and merge them.
    ///
    /// A failed query does not fail the pass: symbols whose previous snapshot
    /// held that funding kind are carried over and flagged stale.
    pub async fn reconcile(&mut self) -> Reconciliation {
        let mut rows: Vec<(HoldingKind, HoldingRow)> = Vec::new();
        let mut failed = Vec::new();

        for kind in [HoldingKind::Credit, HoldingKind::Cash] {
            match self.query(kind).await {
                Ok(fetched) => rows.extend(fetched.into_iter().map(|r| (kind, r))),
                Err(e) => {
                    tracing::warn!("⚠️  {} holdings query failed: {}", kind, e);
                    failed.push(kind);
                }
            }
        }

        let mut positions = merge_holdings(rows.iter().map(|(k, r)| (*k, r)));
        let mut stale = HashSet::new();

        for kind in &failed {
            for (symbol, prior) in &self.last {
                let affected = match kind {
                    HoldingKind::Credit => prior.is_credit(),
                    HoldingKind::Cash => prior.has_cash(),
                };
                if affected {
                    stale.insert(symbol.clone());
                    positions.insert(symbol.clone(), prior.clone());
                }
            }
        }

        for pos in positions.values() {
            if !pos.lots_consistent() {
                tracing::warn!(
                    symbol = %pos.symbol,
                    orderable = pos.orderable_qty,
                    "Lot quantities do not add up to orderable quantity"
                );
            }
        }

        tracing::debug!(
            positions = positions.len(),
            stale = stale.len(),
            "Positions reconciled"
        );

        self.last = positions.clone();
        Reconciliation {
            positions,
            stale,
            failed,
        }
    }

    /// Most recent snapshot
    pub fn snapshot(&self) -> &HashMap<String, Position> {
        &self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BrokerError, PaperBroker};
    use std::time::Duration;

    fn row(symbol: &str, held: u64, orderable: u64, avg: f64, loan: Option<&str>) -> HoldingRow {
        HoldingRow {
            symbol: symbol.to_string(),
            held_qty: held,
            orderable_qty: orderable,
            avg_cost: avg,
            product_name: format!("{} Corp", symbol),
            loan_date: loan.map(str::to_string),
        }
    }

    fn tracker(broker: Arc<PaperBroker>) -> PositionTracker {
        PositionTracker::new(
            broker,
            RateLimiter::new(2),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_merge_sums_lots_per_loan_date() {
        let rows = vec![
            (HoldingKind::Credit, row("005930", 30, 30, 70_000.0, Some("20240105"))),
            (HoldingKind::Credit, row("005930", 30, 30, 70_000.0, Some("20240105"))),
            (HoldingKind::Credit, row("005930", 40, 40, 72_500.0, Some("20240112"))),
        ];
        let positions = merge_holdings(rows.iter().map(|(k, r)| (*k, r)));
        let pos = &positions["005930"];

        assert_eq!(pos.orderable_qty, 100);
        assert_eq!(pos.lots[&LotKey::Loan("20240105".to_string())], 60);
        assert_eq!(pos.lots[&LotKey::Loan("20240112".to_string())], 40);
        assert!((pos.avg_cost - 71_000.0).abs() < 1e-6);
        assert!(pos.lots_consistent());
    }

    #[test]
    fn test_merge_mixed_holding_keeps_cash_lot() {
        let rows = vec![
            (HoldingKind::Credit, row("000660", 6, 6, 100.0, Some("20240105"))),
            (HoldingKind::Cash, row("000660", 4, 4, 100.0, None)),
            (HoldingKind::Cash, row("035720", 10, 10, 50.0, None)),
            (HoldingKind::Cash, row("068270", 0, 0, 50.0, None)),
        ];
        let positions = merge_holdings(rows.iter().map(|(k, r)| (*k, r)));

        let mixed = &positions["000660"];
        assert_eq!(mixed.lots[&LotKey::Cash], 4);
        assert!(mixed.lots_consistent());

        let cash = &positions["035720"];
        assert!(cash.lots.is_empty());
        assert!(!positions.contains_key("068270"));
    }

    #[tokio::test]
    async fn test_reconcile_fresh_each_cycle() {
        let broker = Arc::new(PaperBroker::new());
        broker.add_holding(HoldingKind::Cash, row("035720", 10, 10, 50.0, None));
        let mut tracker = tracker(broker.clone());

        let first = tracker.reconcile().await;
        assert!(first.is_complete());
        assert_eq!(first.position("035720").unwrap().orderable_qty, 10);

        broker.add_holding(HoldingKind::Credit, row("005930", 5, 5, 70_000.0, Some("20240105")));
        let second = tracker.reconcile().await;
        assert_eq!(second.positions.len(), 2);
        assert!(second.position("005930").unwrap().is_credit());
    }

    #[tokio::test]
    async fn test_failed_query_marks_prior_symbols_stale() {
        let broker = Arc::new(PaperBroker::new());
        broker.add_holding(HoldingKind::Credit, row("005930", 5, 5, 70_000.0, Some("20240105")));
        broker.add_holding(HoldingKind::Cash, row("035720", 10, 10, 50.0, None));
        let mut tracker = tracker(broker.clone());
        tracker.reconcile().await;

        broker.fail_holdings(HoldingKind::Credit, Some(3), BrokerError::Timeout);
        let recon = tracker.reconcile().await;

        assert!(!recon.is_complete());
        assert_eq!(recon.failed, vec![HoldingKind::Credit]);
        assert!(recon.is_stale("005930"));
        assert!(!recon.is_stale("035720"));
        assert_eq!(recon.position("005930").unwrap().orderable_qty, 5);

        // Retries exhausted once; the next pass is fresh again
        let recovered = tracker.reconcile().await;
        assert!(recovered.is_complete());
        assert!(recovered.stale.is_empty());
    }
}
