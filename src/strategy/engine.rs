use chrono::NaiveTime;
use std::collections::HashMap;
use uuid::Uuid;

use super::ladder::Ladder;
use super::{CutRule, EntryOrder, EntryRule, HalfStep, StrategyParams, TradeType};
use crate::models::{
    IntentReason, OrderIntent, OrderMode, OrderOutcome, Position, PriceSample, Side, SymbolConfig,
};
use crate::session::SessionSchedule;

/// Transition staged by an emitted intent, applied once the order is accepted
#[derive(Debug, Clone, Copy, PartialEq)]
enum Pending {
    FirstEntry,
    SecondEntry,
    Sell { next: Option<f64>, full_exit: bool },
}

/// Per-symbol session state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolRuntimeState {
    pub first_entry_done: bool,
    pub second_entry_done: bool,
    pub sold_out: bool,
    pub last_sell_threshold: Option<f64>,
    pub cut_price: Option<f64>,
    pending: Option<Pending>,
}

impl SymbolRuntimeState {
    /// An emitted intent has not been resolved yet
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Stop-loss level of a held symbol moved
#[derive(Debug, Clone, PartialEq)]
pub struct CutPriceUpdate {
    pub symbol: String,
    pub trade_type: TradeType,
    pub avg_cost: f64,
    pub cut_price: f64,
}

/// Turns price samples into order intents, one symbol at a time
pub struct DecisionEngine {
    states: HashMap<String, SymbolRuntimeState>,
    ladder: Ladder,
    schedule: SessionSchedule,
    cut_updates: Vec<CutPriceUpdate>,
}

impl DecisionEngine {
    pub fn new(schedule: SessionSchedule) -> Self {
        Self::with_ladder(schedule, Ladder::default())
    }

    pub fn with_ladder(schedule: SessionSchedule, ladder: Ladder) -> Self {
        Self {
            states: HashMap::new(),
            ladder,
            schedule,
            cut_updates: Vec::new(),
        }
    }

    /// Whether `trade_type` may trade at all at `now`
    pub fn is_active(&self, trade_type: TradeType, now: NaiveTime) -> bool {
        let window = trade_type.params().window;
        self.schedule.allows(window, Side::Sell, now) || self.schedule.allows(window, Side::Buy, now)
    }

    /// Cut-price changes recorded since the last call
    pub fn take_cut_updates(&mut self) -> Vec<CutPriceUpdate> {
        std::mem::take(&mut self.cut_updates)
    }

    /// Mark symbols already held at session start as entered
    pub fn seed_holdings<'a>(&mut self, symbols: impl IntoIterator<Item = &'a str>) {
        for symbol in symbols {
            let state = self.states.entry(symbol.to_string()).or_default();
            state.first_entry_done = true;
            tracing::debug!(symbol, "Seeded held symbol as entered");
        }
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolRuntimeState> {
        self.states.get(symbol)
    }

    /// Drop all session state
    pub fn end_session(&mut self) {
        self.states.clear();
        self.cut_updates.clear();
    }

    /// Evaluate one symbol. At most one intent is outstanding per symbol;
    /// nothing is emitted until the previous one is resolved.
    pub fn evaluate(
        &mut self,
        config: &SymbolConfig,
        sample: &PriceSample,
        position: Option<&Position>,
        now: NaiveTime,
    ) -> Option<OrderIntent> {
        let params = config.trade_type.params();
        let ladder = self.ladder;
        let past_time_cut = now >= self.schedule.time_cut;
        let can_sell = self.schedule.allows(params.window, Side::Sell, now);
        let can_buy = self.schedule.allows(params.window, Side::Buy, now);
        let state = self.states.entry(config.symbol.clone()).or_default();

        if state.sold_out || state.pending.is_some() {
            return None;
        }
        if !(sample.price > 0.0) {
            return None;
        }

        if state.first_entry_done && can_sell {
            if let Some(pos) = position.filter(|p| p.orderable_qty > 0) {
                let previous_cut = state.cut_price;
                let decision =
                    evaluate_sell(config, &params, &ladder, state, pos, sample.price, past_time_cut);
                match state.cut_price {
                    Some(cut_price) if state.cut_price != previous_cut => {
                        self.cut_updates.push(CutPriceUpdate {
                            symbol: config.symbol.clone(),
                            trade_type: config.trade_type,
                            avg_cost: pos.avg_cost,
                            cut_price,
                        });
                    }
                    _ => {}
                }
                if let Some((reason, quantity, pending)) = decision {
                    state.pending = Some(pending);
                    tracing::info!(
                        symbol = %config.symbol,
                        price = sample.price,
                        avg_cost = pos.avg_cost,
                        quantity,
                        reason = %reason,
                        "Sell signal"
                    );
                    return Some(OrderIntent {
                        id: Uuid::new_v4(),
                        symbol: config.symbol.clone(),
                        side: Side::Sell,
                        quantity,
                        mode: OrderMode::Market,
                        credit: pos.is_credit(),
                        reason,
                    });
                }
            }
        }

        if !can_buy {
            return None;
        }
        // Anything bought now would be flattened on the next pass
        if params.time_cut && past_time_cut {
            return None;
        }

        let (reason, pending) = evaluate_buy(config, &params, state, sample, position)?;
        let quantity = params.buy_quantity(sample.price);
        if quantity == 0 {
            tracing::debug!(symbol = %config.symbol, price = sample.price, "Budget too small for one share");
            return None;
        }

        state.pending = Some(pending);
        let mode = match params.entry_order {
            EntryOrder::Market => OrderMode::Market,
            EntryOrder::LimitAtPrice => OrderMode::Limit {
                price: sample.price,
            },
        };
        tracing::info!(
            symbol = %config.symbol,
            trade_type = %config.trade_type,
            price = sample.price,
            quantity,
            reason = %reason,
            "Buy signal"
        );

        Some(OrderIntent {
            id: Uuid::new_v4(),
            symbol: config.symbol.clone(),
            side: Side::Buy,
            quantity,
            mode,
            credit: true,
            reason,
        })
    }

    /// Settle the outstanding intent for `symbol`.
    ///
    /// Accepted intents commit their transition, rejected ones leave state as it
    /// was. A partly accepted full exit is not terminal: whatever is left is
    /// evaluated again on the next cycle.
    pub fn resolve(&mut self, symbol: &str, outcome: OrderOutcome) {
        let Some(state) = self.states.get_mut(symbol) else {
            return;
        };
        let Some(pending) = state.pending.take() else {
            return;
        };

        match (pending, outcome) {
            (_, OrderOutcome::Rejected) => {
                tracing::debug!(symbol, "Intent rejected, state unchanged");
            }
            (Pending::Sell { full_exit: true, .. }, OrderOutcome::Partial) => {
                tracing::warn!(symbol, "Exit only partly accepted, position stays open");
            }
            (Pending::FirstEntry, _) => state.first_entry_done = true,
            (Pending::SecondEntry, _) => state.second_entry_done = true,
            (Pending::Sell { next, full_exit }, _) => {
                state.last_sell_threshold = next;
                if full_exit {
                    state.sold_out = true;
                    tracing::info!(symbol, "Position closed for the session");
                }
            }
        }
    }
}

fn cut_price(rule: CutRule, avg_cost: f64, band: f64, second_entry_done: bool) -> f64 {
    match rule {
        CutRule::Ratio(ratio) => avg_cost * ratio,
        CutRule::Band {
            divisor,
            after_second,
        } => {
            let d = if second_entry_done { after_second } else { divisor };
            avg_cost - band / d
        }
    }
}

fn evaluate_sell(
    config: &SymbolConfig,
    params: &StrategyParams,
    ladder: &Ladder,
    state: &mut SymbolRuntimeState,
    pos: &Position,
    price: f64,
    past_time_cut: bool,
) -> Option<(IntentReason, u64, Pending)> {
    let avg = pos.avg_cost;
    if !(avg > 0.0) {
        return None;
    }
    let qty = pos.orderable_qty;

    let cut = cut_price(params.cut, avg, config.band(), state.second_entry_done);
    if state.cut_price != Some(cut) {
        tracing::info!(symbol = %config.symbol, cut_price = cut, "Cut price updated");
        state.cut_price = Some(cut);
    }

    let full = |reason: IntentReason| {
        Some((
            reason,
            qty,
            Pending::Sell {
                next: None,
                full_exit: true,
            },
        ))
    };

    if price <= cut {
        return full(IntentReason::StopLoss);
    }
    if params.time_cut && past_time_cut {
        return full(IntentReason::TimeCut);
    }

    let step = match state.last_sell_threshold {
        None => {
            let half = match params.half_step {
                HalfStep::Never => false,
                HalfStep::AfterSecondEntry => state.second_entry_done,
                HalfStep::Always => true,
            };
            ladder.unarmed_step(avg, price, half)?
        }
        Some(last) if price >= last => ladder.armed_step(avg, last)?,
        Some(last) => return full(ladder.pullback(avg, last, price, past_time_cut)?),
    };

    Some((
        step.reason,
        step.quantity(qty),
        Pending::Sell {
            next: step.next,
            full_exit: step.reason.is_full_exit(),
        },
    ))
}

fn evaluate_buy(
    config: &SymbolConfig,
    params: &StrategyParams,
    state: &SymbolRuntimeState,
    sample: &PriceSample,
    position: Option<&Position>,
) -> Option<(IntentReason, Pending)> {
    let price = sample.price;

    if !state.first_entry_done {
        if entry_condition(params.entry, config, sample)? {
            return Some((IntentReason::FirstEntry, Pending::FirstEntry));
        }
        return None;
    }

    if params.second_entry && !state.second_entry_done {
        let pos = position.filter(|p| p.avg_cost > 0.0)?;
        if price <= pos.avg_cost - config.band() / 3.0 {
            return Some((IntentReason::SecondEntry, Pending::SecondEntry));
        }
    }

    None
}

/// `None` when the sample lacks a field the rule needs
fn entry_condition(rule: EntryRule, config: &SymbolConfig, sample: &PriceSample) -> Option<bool> {
    let price = sample.price;
    match rule {
        EntryRule::Breakout => {
            let reference = sample.reference?;
            let high_120d = sample.high_120d?;
            let open = sample.open?;
            let ceiling = sample.ceiling?;
            Some(reference * 1.05 <= price && high_120d < price && open < price && price < ceiling)
        }
        EntryRule::ThreeDayDip => {
            let [c0, c1] = [*sample.prior_closes.first()?, *sample.prior_closes.get(1)?];
            Some(price < (c0 + c1 + price) / 3.0)
        }
        EntryRule::BandRetrace => Some(price <= config.high_threshold - config.band() / 3.0),
    }
}
