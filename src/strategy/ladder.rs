use crate::models::IntentReason;

/// Profit-taking ladder expressed as multiples of the average cost.
///
/// Rung 0 is the breakeven line, rungs 1..=5 are the sell steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ladder {
    pub rungs: [f64; 6],
    /// Give-back tolerance once the ladder reached rung 2
    pub give_back: f64,
}

impl Default for Ladder {
    fn default() -> Self {
        Self {
            rungs: [
                1.001872792,
                1.031872792,
                1.041872792,
                1.051872792,
                1.061872792,
                1.071872792,
            ],
            give_back: 0.97,
        }
    }
}

/// One step of the ladder: what to sell and what to arm next
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderStep {
    pub reason: IntentReason,
    /// Fraction of the orderable quantity as `qty / divisor`; `None` sells everything
    pub divisor: Option<u64>,
    /// Next threshold to arm; `None` clears the ladder
    pub next: Option<f64>,
}

impl LadderStep {
    pub fn quantity(&self, orderable: u64) -> u64 {
        match self.divisor {
            Some(d) => partial_quantity(orderable, d),
            None => orderable,
        }
    }
}

/// `max(1, round(qty / divisor))`, ties to even, never above `qty`
pub fn partial_quantity(qty: u64, divisor: u64) -> u64 {
    if qty == 0 {
        return 0;
    }
    let share = (qty as f64 / divisor.max(1) as f64).round_ties_even() as u64;
    share.max(1).min(qty)
}

impl Ladder {
    /// Absolute price of each rung for `avg_cost`
    pub fn thresholds(&self, avg_cost: f64) -> [f64; 6] {
        self.rungs.map(|r| avg_cost * r)
    }

    /// First sale when nothing is armed yet
    pub fn unarmed_step(&self, avg_cost: f64, price: f64, half_enabled: bool) -> Option<LadderStep> {
        let t = self.thresholds(avg_cost);
        if half_enabled && price >= t[0] {
            return Some(LadderStep {
                reason: IntentReason::Half,
                divisor: Some(2),
                next: Some(t[1]),
            });
        }
        if price >= t[1] {
            return Some(LadderStep {
                reason: IntentReason::First,
                divisor: Some(5),
                next: Some(t[2]),
            });
        }
        None
    }

    /// Step taken when the price reaches the armed threshold `last`
    pub fn armed_step(&self, avg_cost: f64, last: f64) -> Option<LadderStep> {
        let t = self.thresholds(avg_cost);
        let step = |reason, divisor, next| {
            Some(LadderStep {
                reason,
                divisor,
                next,
            })
        };

        if last >= t[5] {
            step(IntentReason::Final, None, None)
        } else if last >= t[4] {
            step(IntentReason::Fourth, Some(2), Some(t[5]))
        } else if last >= t[3] {
            step(IntentReason::Third, Some(3), Some(t[4]))
        } else if last >= t[2] {
            step(IntentReason::Second, Some(4), Some(t[3]))
        } else if last >= t[1] {
            step(IntentReason::First, Some(4), Some(t[2]))
        } else {
            None
        }
    }

    /// Full exit while armed and the price sits below `last`
    pub fn pullback(
        &self,
        avg_cost: f64,
        last: f64,
        price: f64,
        past_time_cut: bool,
    ) -> Option<IntentReason> {
        let t = self.thresholds(avg_cost);
        if last >= t[2] && price <= last * self.give_back {
            Some(IntentReason::GiveBack)
        } else if last >= t[1] && price <= t[0] {
            Some(IntentReason::Breakeven)
        } else if last >= t[1] && price >= t[0] && past_time_cut {
            Some(IntentReason::SessionClose)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rungs_strictly_increasing() {
        let ladder = Ladder::default();
        for avg in [1.0, 1000.0, 73_400.0, 512_000.0] {
            let t = ladder.thresholds(avg);
            for pair in t.windows(2) {
                assert!(pair[0] < pair[1], "rungs not increasing for avg {}", avg);
            }
            assert!(t[0] > avg);
        }
    }

    #[test]
    fn test_partial_quantity_rounding() {
        assert_eq!(partial_quantity(10, 2), 5);
        assert_eq!(partial_quantity(5, 2), 2); // 2.5 rounds to even
        assert_eq!(partial_quantity(7, 2), 4); // 3.5 rounds to even
        assert_eq!(partial_quantity(1, 5), 1);
        assert_eq!(partial_quantity(3, 4), 1);
        assert_eq!(partial_quantity(0, 4), 0);
    }

    #[test]
    fn test_unarmed_half_only_when_enabled() {
        let ladder = Ladder::default();
        let step = ladder.unarmed_step(1000.0, 1002.0, true).unwrap();
        assert_eq!(step.reason, IntentReason::Half);
        assert_eq!(step.divisor, Some(2));

        assert!(ladder.unarmed_step(1000.0, 1002.0, false).is_none());

        let step = ladder.unarmed_step(1000.0, 1033.0, false).unwrap();
        assert_eq!(step.reason, IntentReason::First);
        assert_eq!(step.divisor, Some(5));
        assert!((step.next.unwrap() - 1041.872792).abs() < 1e-6);
    }

    #[test]
    fn test_armed_bands() {
        let ladder = Ladder::default();
        let t = ladder.thresholds(1000.0);
        let reasons: Vec<_> = t[1..]
            .iter()
            .map(|&last| ladder.armed_step(1000.0, last).unwrap().reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                IntentReason::First,
                IntentReason::Second,
                IntentReason::Third,
                IntentReason::Fourth,
                IntentReason::Final
            ]
        );
        assert!(ladder.armed_step(1000.0, t[0]).is_none());
    }

    #[test]
    fn test_pullback_rules() {
        let ladder = Ladder::default();
        let t = ladder.thresholds(1000.0);

        // Reached rung 3, dropped more than 3%
        assert_eq!(
            ladder.pullback(1000.0, t[3], t[3] * 0.96, false),
            Some(IntentReason::GiveBack)
        );
        // Reached rung 1 only, fell back to breakeven
        assert_eq!(
            ladder.pullback(1000.0, t[1], 1001.0, false),
            Some(IntentReason::Breakeven)
        );
        // Still in profit at the time-cut
        assert_eq!(
            ladder.pullback(1000.0, t[1], 1010.0, true),
            Some(IntentReason::SessionClose)
        );
        assert_eq!(ladder.pullback(1000.0, t[1], 1010.0, false), None);
    }
}
