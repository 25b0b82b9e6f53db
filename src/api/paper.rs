//! In-memory brokerage.
//!
//! Fills orders instantly against simulated holdings. Market data is either
//! scripted with `set_quote`/`set_bars` or delegated to a live broker, which
//! makes it usable both for dry runs and for tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::broker::{Broker, BrokerError};
use crate::models::{
    DailyBar, Funding, HoldingKind, HoldingRow, OrderId, OrderMode, OrderRequest, QuoteField,
    Side,
};

#[derive(Debug, Clone)]
struct FailureScript {
    /// `None` fails forever
    remaining: Option<u32>,
    error: BrokerError,
}

impl FailureScript {
    fn next(&mut self) -> Option<BrokerError> {
        match self.remaining {
            None => Some(self.error.clone()),
            Some(0) => None,
            Some(n) => {
                self.remaining = Some(n - 1);
                Some(self.error.clone())
            }
        }
    }
}

/// Scripted broker rejection; `funding: None` matches every order for the symbol
#[derive(Debug, Clone)]
struct Rejection {
    symbol: String,
    funding: Option<Funding>,
    code: String,
    message: String,
}

impl Rejection {
    fn matches(&self, order: &OrderRequest) -> bool {
        self.symbol == order.symbol
            && self.funding.as_ref().map_or(true, |f| *f == order.funding)
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    quotes: HashMap<(String, QuoteField), f64>,
    bars: HashMap<String, Vec<DailyBar>>,
    names: HashMap<String, String>,
    holdings: Vec<(HoldingKind, HoldingRow)>,
    orders: Vec<OrderRequest>,
    quote_failures: HashMap<String, FailureScript>,
    holding_failures: HashMap<HoldingKind, FailureScript>,
    credit_failures: Option<FailureScript>,
    rejections: Vec<Rejection>,
    quote_calls: HashMap<String, u32>,
    next_order: u64,
}

pub struct PaperBroker {
    market: Option<Arc<dyn Broker>>,
    credit_buying_power: f64,
    book: Mutex<PaperBook>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            market: None,
            credit_buying_power: 0.0,
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// Read market data from `market`; scripted quotes still take precedence
    pub fn with_market(market: Arc<dyn Broker>) -> Self {
        Self {
            market: Some(market),
            ..Self::new()
        }
    }

    pub fn with_credit_buying_power(mut self, amount: f64) -> Self {
        self.credit_buying_power = amount;
        self
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_quote(&self, symbol: &str, field: QuoteField, price: f64) {
        self.book().quotes.insert((symbol.to_string(), field), price);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<DailyBar>) {
        self.book().bars.insert(symbol.to_string(), bars);
    }

    pub fn set_name(&self, symbol: &str, name: &str) {
        self.book().names.insert(symbol.to_string(), name.to_string());
    }

    pub fn add_holding(&self, kind: HoldingKind, row: HoldingRow) {
        self.book().holdings.push((kind, row));
    }

    /// Fail the next `times` quote calls for `symbol` (`None`: every call)
    pub fn fail_quotes(&self, symbol: &str, times: Option<u32>, error: BrokerError) {
        self.book().quote_failures.insert(
            symbol.to_string(),
            FailureScript {
                remaining: times,
                error,
            },
        );
    }

    pub fn fail_holdings(&self, kind: HoldingKind, times: Option<u32>, error: BrokerError) {
        self.book().holding_failures.insert(
            kind,
            FailureScript {
                remaining: times,
                error,
            },
        );
    }

    /// Reject every order for `symbol` with the given broker code
    pub fn reject_orders(&self, symbol: &str, code: &str, message: &str) {
        self.book().rejections.push(Rejection {
            symbol: symbol.to_string(),
            funding: None,
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    /// Reject only the orders for `symbol` funded by `funding`, e.g. one loan lot
    pub fn reject_funding(&self, symbol: &str, funding: Funding, code: &str, message: &str) {
        self.book().rejections.push(Rejection {
            symbol: symbol.to_string(),
            funding: Some(funding),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    pub fn fail_credit_checks(&self, times: Option<u32>, error: BrokerError) {
        self.book().credit_failures = Some(FailureScript {
            remaining: times,
            error,
        });
    }

    /// Orders accepted so far, in submission order
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.book().orders.clone()
    }

    pub fn quote_calls(&self, symbol: &str) -> u32 {
        self.book().quote_calls.get(symbol).copied().unwrap_or(0)
    }

    pub fn holdings_snapshot(&self) -> Vec<(HoldingKind, HoldingRow)> {
        self.book().holdings.clone()
    }

    fn scripted_quote(&self, symbol: &str, fields: &[QuoteField]) -> Option<f64> {
        let book = self.book();
        fields
            .iter()
            .find_map(|f| book.quotes.get(&(symbol.to_string(), *f)).copied())
    }

    async fn fill_price(&self, order: &OrderRequest) -> Result<f64, BrokerError> {
        if let OrderMode::Limit { price } = order.mode {
            return Ok(price);
        }
        if let Some(price) =
            self.scripted_quote(&order.symbol, &[QuoteField::Current, QuoteField::ExpectedClose])
        {
            return Ok(price);
        }
        match &self.market {
            Some(market) => market.quote(&order.symbol, QuoteField::Current).await,
            None => Err(BrokerError::Rejected {
                code: "PAPER".to_string(),
                message: format!("no price for {}", order.symbol),
            }),
        }
    }
}

fn matches_lot(kind: HoldingKind, row: &HoldingRow, order: &OrderRequest) -> bool {
    if row.symbol != order.symbol {
        return false;
    }
    match &order.funding {
        Funding::Cash => kind == HoldingKind::Cash,
        Funding::Credit { loan_date } => {
            kind == HoldingKind::Credit && row.loan_date.as_deref() == Some(loan_date.as_str())
        }
    }
}

impl PaperBook {
    fn apply_fill(&mut self, order: &OrderRequest, price: f64) -> Result<(), BrokerError> {
        let qty = order.quantity;
        let existing = self
            .holdings
            .iter()
            .position(|(kind, row)| matches_lot(*kind, row, order));

        match (order.side, existing) {
            (Side::Buy, Some(i)) => {
                let row = &mut self.holdings[i].1;
                let cost = row.avg_cost * row.held_qty as f64 + price * qty as f64;
                row.held_qty += qty;
                row.orderable_qty += qty;
                row.avg_cost = cost / row.held_qty as f64;
            }
            (Side::Buy, None) => {
                let (kind, loan_date) = match &order.funding {
                    Funding::Cash => (HoldingKind::Cash, None),
                    Funding::Credit { loan_date } => (HoldingKind::Credit, Some(loan_date.clone())),
                };
                let product_name = self
                    .names
                    .get(&order.symbol)
                    .cloned()
                    .unwrap_or_else(|| order.symbol.clone());
                self.holdings.push((
                    kind,
                    HoldingRow {
                        symbol: order.symbol.clone(),
                        held_qty: qty,
                        orderable_qty: qty,
                        avg_cost: price,
                        product_name,
                        loan_date,
                    },
                ));
            }
            (Side::Sell, Some(i)) if self.holdings[i].1.orderable_qty >= qty => {
                let row = &mut self.holdings[i].1;
                row.held_qty -= qty;
                row.orderable_qty -= qty;
            }
            (Side::Sell, _) => {
                return Err(BrokerError::Rejected {
                    code: "PAPER".to_string(),
                    message: format!("insufficient orderable quantity for {}", order.symbol),
                });
            }
        }

        self.holdings.retain(|(_, row)| row.held_qty > 0);
        Ok(())
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn ensure_session(&self) -> Result<(), BrokerError> {
        match &self.market {
            Some(market) => market.ensure_session().await,
            None => Ok(()),
        }
    }

    async fn quote(&self, symbol: &str, field: QuoteField) -> Result<f64, BrokerError> {
        {
            let mut book = self.book();
            *book.quote_calls.entry(symbol.to_string()).or_default() += 1;
            if let Some(error) = book.quote_failures.get_mut(symbol).and_then(|f| f.next()) {
                return Err(error);
            }
            if let Some(price) = book.quotes.get(&(symbol.to_string(), field)) {
                return Ok(*price);
            }
        }

        match &self.market {
            Some(market) => market.quote(symbol, field).await,
            None => Err(BrokerError::Malformed(format!(
                "no {:?} quote for {}",
                field, symbol
            ))),
        }
    }

    async fn daily_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>, BrokerError> {
        let scripted = self.book().bars.get(symbol).map(|bars| {
            bars.iter()
                .filter(|b| b.date >= from && b.date <= to)
                .cloned()
                .collect::<Vec<_>>()
        });

        match (scripted, &self.market) {
            (Some(bars), _) => Ok(bars),
            (None, Some(market)) => market.daily_bars(symbol, from, to).await,
            (None, None) => Ok(Vec::new()),
        }
    }

    async fn holdings(&self, kind: HoldingKind) -> Result<Vec<HoldingRow>, BrokerError> {
        let mut book = self.book();
        if let Some(error) = book.holding_failures.get_mut(&kind).and_then(|f| f.next()) {
            return Err(error);
        }
        Ok(book
            .holdings
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn credit_buying_power(&self, _symbol: &str) -> Result<f64, BrokerError> {
        if let Some(error) = self.book().credit_failures.as_mut().and_then(|f| f.next()) {
            return Err(error);
        }
        Ok(self.credit_buying_power)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderId, BrokerError> {
        let rejection = self
            .book()
            .rejections
            .iter()
            .find(|r| r.matches(order))
            .cloned();
        if let Some(Rejection { code, message, .. }) = rejection {
            return Err(BrokerError::Rejected { code, message });
        }

        let price = self.fill_price(order).await?;

        let mut book = self.book();
        book.apply_fill(order, price)?;
        book.orders.push(order.clone());
        book.next_order += 1;
        let id = OrderId(format!("PAPER-{:08}", book.next_order));

        tracing::info!(
            order_id = %id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            price,
            "Paper fill simulated"
        );
        Ok(id)
    }

    async fn symbol_name(&self, symbol: &str) -> Result<String, BrokerError> {
        let scripted = self.book().names.get(symbol).cloned();
        if let Some(name) = scripted {
            return Ok(name);
        }
        match &self.market {
            Some(market) => market.symbol_name(symbol).await,
            None => Ok(symbol.to_string()),
        }
    }
}
