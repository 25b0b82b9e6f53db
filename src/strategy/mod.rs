// Trading strategies and the per-symbol decision state machine
pub mod engine;
pub mod ladder;

pub use engine::{CutPriceUpdate, DecisionEngine, SymbolRuntimeState};
pub use ladder::{Ladder, LadderStep};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::QuoteField;

/// Brokerage fee applied when sizing buys
pub const FEE_MULTIPLIER: f64 = 1.000036396;

/// Strategy family of a watch-list symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TradeType {
    #[serde(rename = "HB")]
    HighBreakout,
    #[serde(rename = "LB")]
    LowBounce,
    #[serde(rename = "LB2")]
    LowBounce2,
    #[serde(rename = "MR")]
    MeanReversion,
    #[serde(rename = "MR2")]
    MeanReversion2,
    #[serde(rename = "MR3")]
    MeanReversion3,
}

/// Condition that opens a position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryRule {
    /// Above 105% of the reference price, the 120-day high and the open,
    /// and still below the daily ceiling
    Breakout,
    /// Below the three-day average (two prior closes plus the current price)
    ThreeDayDip,
    /// At or below `high - (high - low) / 3` of the configured band
    BandRetrace,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryOrder {
    Market,
    /// Limit order at the sampled price
    LimitAtPrice,
}

/// How the stop-loss price is derived from the average cost
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CutRule {
    /// `avg * ratio`
    Ratio(f64),
    /// `avg - band / divisor`, tightened to `after_second` once a second entry fills
    Band { divisor: f64, after_second: f64 },
}

/// When the first profit rung sells half the position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfStep {
    Never,
    AfterSecondEntry,
    Always,
}

/// Part of the trading day a strategy is allowed to act in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingWindow {
    /// Continuous market, session start until exit
    Continuous,
    /// Closing single-price auction, where the expected close is meaningful
    ClosingAuction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyParams {
    /// KRW committed per entry
    pub budget: f64,
    pub price_field: QuoteField,
    pub entry: EntryRule,
    pub entry_order: EntryOrder,
    /// Second entry at `avg - band / 3`
    pub second_entry: bool,
    pub cut: CutRule,
    pub half_step: HalfStep,
    /// Liquidate at the session time-cut
    pub time_cut: bool,
    pub window: TradingWindow,
}

impl TradeType {
    pub const ALL: [TradeType; 6] = [
        TradeType::HighBreakout,
        TradeType::LowBounce,
        TradeType::LowBounce2,
        TradeType::MeanReversion,
        TradeType::MeanReversion2,
        TradeType::MeanReversion3,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            TradeType::HighBreakout => "HB",
            TradeType::LowBounce => "LB",
            TradeType::LowBounce2 => "LB2",
            TradeType::MeanReversion => "MR",
            TradeType::MeanReversion2 => "MR2",
            TradeType::MeanReversion3 => "MR3",
        }
    }

    pub fn params(&self) -> StrategyParams {
        match self {
            TradeType::HighBreakout => StrategyParams {
                budget: 15_000_000.0,
                price_field: QuoteField::ExpectedClose,
                entry: EntryRule::Breakout,
                entry_order: EntryOrder::Market,
                second_entry: false,
                cut: CutRule::Ratio(0.92),
                half_step: HalfStep::Never,
                time_cut: false,
                window: TradingWindow::ClosingAuction,
            },
            TradeType::LowBounce | TradeType::LowBounce2 => StrategyParams {
                budget: if *self == TradeType::LowBounce {
                    5_000_000.0
                } else {
                    10_000_000.0
                },
                price_field: QuoteField::ExpectedClose,
                entry: EntryRule::ThreeDayDip,
                entry_order: EntryOrder::Market,
                second_entry: false,
                cut: CutRule::Ratio(0.92),
                half_step: HalfStep::Never,
                time_cut: false,
                window: TradingWindow::ClosingAuction,
            },
            TradeType::MeanReversion => StrategyParams {
                budget: 15_000_000.0,
                price_field: QuoteField::Current,
                entry: EntryRule::BandRetrace,
                entry_order: EntryOrder::LimitAtPrice,
                second_entry: true,
                cut: CutRule::Band {
                    divisor: 2.0,
                    after_second: 3.0,
                },
                half_step: HalfStep::AfterSecondEntry,
                time_cut: false,
                window: TradingWindow::Continuous,
            },
            TradeType::MeanReversion2 => StrategyParams {
                budget: 15_000_000.0,
                price_field: QuoteField::Current,
                entry: EntryRule::BandRetrace,
                entry_order: EntryOrder::LimitAtPrice,
                second_entry: false,
                cut: CutRule::Band {
                    divisor: 3.0,
                    after_second: 3.0,
                },
                half_step: HalfStep::Always,
                time_cut: false,
                window: TradingWindow::Continuous,
            },
            TradeType::MeanReversion3 => StrategyParams {
                budget: 15_000_000.0,
                price_field: QuoteField::Current,
                entry: EntryRule::BandRetrace,
                entry_order: EntryOrder::LimitAtPrice,
                second_entry: false,
                cut: CutRule::Ratio(0.92),
                half_step: HalfStep::Never,
                time_cut: true,
                window: TradingWindow::Continuous,
            },
        }
    }
}

impl StrategyParams {
    /// Quote fields fetched in addition to `price_field`
    pub fn extra_fields(&self) -> &'static [QuoteField] {
        match self.entry {
            EntryRule::Breakout => &[QuoteField::Open, QuoteField::Ceiling, QuoteField::Reference],
            EntryRule::ThreeDayDip | EntryRule::BandRetrace => &[],
        }
    }

    pub fn needs_high_120d(&self) -> bool {
        self.entry == EntryRule::Breakout
    }

    /// Number of prior daily closes the entry rule reads
    pub fn prior_closes(&self) -> usize {
        match self.entry {
            EntryRule::ThreeDayDip => 2,
            EntryRule::Breakout | EntryRule::BandRetrace => 0,
        }
    }

    /// Shares affordable with the budget at `price`, fees included
    pub fn buy_quantity(&self, price: f64) -> u64 {
        if price <= 0.0 {
            return 0;
        }
        (self.budget / (price * FEE_MULTIPLIER)).floor() as u64
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown trade type: {0}")]
pub struct UnknownTradeType(pub String);

impl FromStr for TradeType {
    type Err = UnknownTradeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        TradeType::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| UnknownTradeType(s.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        assert_eq!("HB".parse::<TradeType>().unwrap(), TradeType::HighBreakout);
        assert_eq!("lb2".parse::<TradeType>().unwrap(), TradeType::LowBounce2);
        assert_eq!(" MR3 ".parse::<TradeType>().unwrap(), TradeType::MeanReversion3);
        assert!("UT".parse::<TradeType>().is_err());
    }

    #[test]
    fn test_tags_round_trip_through_display() {
        for t in TradeType::ALL {
            assert_eq!(t.to_string().parse::<TradeType>().unwrap(), t);
        }
    }

    #[test]
    fn test_budgets() {
        assert_eq!(TradeType::HighBreakout.params().budget, 15_000_000.0);
        assert_eq!(TradeType::LowBounce.params().budget, 5_000_000.0);
        assert_eq!(TradeType::LowBounce2.params().budget, 10_000_000.0);
    }

    #[test]
    fn test_buy_quantity_includes_fee() {
        let params = TradeType::HighBreakout.params();
        let qty = params.buy_quantity(1051.0);
        assert_eq!(qty, (15_000_000.0 / (1051.0 * FEE_MULTIPLIER)).floor() as u64);
        assert_eq!(qty, 14271);
        assert_eq!(params.buy_quantity(0.0), 0);
        assert_eq!(params.buy_quantity(20_000_000.0), 0);
    }

    #[test]
    fn test_only_mr3_has_time_cut() {
        for t in TradeType::ALL {
            assert_eq!(t.params().time_cut, t == TradeType::MeanReversion3);
        }
    }

    #[test]
    fn test_expected_close_strategies_trade_in_auction() {
        for t in TradeType::ALL {
            let params = t.params();
            assert_eq!(
                params.window == TradingWindow::ClosingAuction,
                params.price_field == QuoteField::ExpectedClose,
                "{}",
                t
            );
        }
        assert_eq!(TradeType::LowBounce2.params().window, TradingWindow::ClosingAuction);
        assert_eq!(TradeType::MeanReversion3.params().window, TradingWindow::Continuous);
    }

    #[test]
    fn test_required_fields() {
        let hb = TradeType::HighBreakout.params();
        assert!(hb.needs_high_120d());
        assert_eq!(hb.extra_fields().len(), 3);
        assert_eq!(TradeType::LowBounce.params().prior_closes(), 2);
        assert_eq!(TradeType::MeanReversion.params().price_field, QuoteField::Current);
    }
}
