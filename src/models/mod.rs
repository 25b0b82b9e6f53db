use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::strategy::TradeType;

/// One watch-list entry, immutable for the cycle it was loaded in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolConfig {
    pub symbol: String,
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub trade_type: TradeType,
}

impl SymbolConfig {
    /// Distance between the configured high and low bands
    pub fn band(&self) -> f64 {
        self.high_threshold - self.low_threshold
    }
}

/// Quote fields the market-data layer knows how to fetch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QuoteField {
    /// Last traded price
    Current,
    /// Indicative price of the closing auction
    ExpectedClose,
    Open,
    /// Daily upper price limit
    Ceiling,
    /// Reference (base) price for the day
    Reference,
}

/// A single daily bar from the chart endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyBar {
    pub date: chrono::NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Price snapshot for one symbol, never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSample {
    pub symbol: String,
    pub price: f64,
    pub open: Option<f64>,
    pub ceiling: Option<f64>,
    pub reference: Option<f64>,
    /// Highest daily high over the 120 sessions before today
    pub high_120d: Option<f64>,
    /// Closes of previous sessions, most recent first
    pub prior_closes: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PriceSample {
    /// Sample carrying only a price
    pub fn bare(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            open: None,
            ceiling: None,
            reference: None,
            high_120d: None,
            prior_closes: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Funding kind of a holding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HoldingKind {
    Credit,
    Cash,
}

impl fmt::Display for HoldingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldingKind::Credit => write!(f, "credit"),
            HoldingKind::Cash => write!(f, "cash"),
        }
    }
}

/// Raw holdings row as reported by a position query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldingRow {
    pub symbol: String,
    pub held_qty: u64,
    pub orderable_qty: u64,
    pub avg_cost: f64,
    pub product_name: String,
    pub loan_date: Option<String>,
}

/// Key of a sellable lot: cash or a credit loan taken on a given date (YYYYMMDD)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LotKey {
    Cash,
    Loan(String),
}

/// Reconciled holding for one symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub held_qty: u64,
    pub orderable_qty: u64,
    pub avg_cost: f64,
    pub product_name: String,
    /// Orderable quantity per lot. Empty for a pure cash position.
    pub lots: BTreeMap<LotKey, u64>,
}

impl Position {
    pub fn is_credit(&self) -> bool {
        self.lots.keys().any(|k| matches!(k, LotKey::Loan(_)))
    }

    pub fn has_cash(&self) -> bool {
        self.lots.is_empty() || self.lots.contains_key(&LotKey::Cash)
    }

    /// Lots sum to the orderable quantity whenever any are recorded
    pub fn lots_consistent(&self) -> bool {
        self.lots.is_empty() || self.lots.values().sum::<u64>() == self.orderable_qty
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OrderMode {
    Market,
    Limit { price: f64 },
}

/// Why an intent was produced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntentReason {
    FirstEntry,
    SecondEntry,
    StopLoss,
    TimeCut,
    Half,
    First,
    Second,
    Third,
    Fourth,
    Final,
    GiveBack,
    Breakeven,
    SessionClose,
}

impl IntentReason {
    /// Reasons that close the whole position
    pub fn is_full_exit(&self) -> bool {
        matches!(
            self,
            IntentReason::StopLoss
                | IntentReason::TimeCut
                | IntentReason::Final
                | IntentReason::GiveBack
                | IntentReason::Breakeven
                | IntentReason::SessionClose
        )
    }

    pub fn tag(&self) -> &'static str {
        match self {
            IntentReason::FirstEntry => "first-entry",
            IntentReason::SecondEntry => "second-entry",
            IntentReason::StopLoss => "stop-loss",
            IntentReason::TimeCut => "time-cut",
            IntentReason::Half => "half",
            IntentReason::First => "1st",
            IntentReason::Second => "2nd",
            IntentReason::Third => "3rd",
            IntentReason::Fourth => "4th",
            IntentReason::Final => "final",
            IntentReason::GiveBack => "give-back",
            IntentReason::Breakeven => "breakeven",
            IntentReason::SessionClose => "session-close",
        }
    }
}

impl fmt::Display for IntentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Decision produced by the engine, consumed by the executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderIntent {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub mode: OrderMode,
    /// Buys: prefer credit funding. Sells: the position holds loan lots.
    pub credit: bool,
    pub reason: IntentReason,
}

/// How a single order is funded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Funding {
    Cash,
    /// Loan date (YYYYMMDD) of the credit lot being opened or repaid
    Credit { loan_date: String },
}

/// Concrete order sent to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub mode: OrderMode,
    pub funding: Funding,
}

/// Broker-assigned order number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How much of an intent's order set the broker took
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderOutcome {
    /// Every order accepted
    Accepted,
    /// Some orders accepted, some rejected
    Partial,
    /// Nothing reached the book
    Rejected,
}
