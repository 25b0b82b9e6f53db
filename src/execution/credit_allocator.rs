use std::collections::BTreeMap;

use crate::models::LotKey;

/// Quantity to sell against one lot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub lot: LotKey,
    pub quantity: u64,
}

/// Split a sell of `total` shares across the position's lots.
///
/// Each lot gets `round(total * lot / sum)` (ties to even), visited in key
/// order. Zero shares are dropped and the running sum never exceeds `total`,
/// so the result sums to somewhere in `[total - (k - 1), total]`.
/// An empty lot map is a cash position and gets a single cash allocation.
pub fn allocate(symbol: &str, total: u64, lots: &BTreeMap<LotKey, u64>) -> Vec<Allocation> {
    if total == 0 {
        return Vec::new();
    }

    let lot_sum: u64 = lots.values().sum();
    if lots.is_empty() || lot_sum == 0 {
        return vec![Allocation {
            lot: LotKey::Cash,
            quantity: total,
        }];
    }

    let mut remaining = total;
    let mut allocations = Vec::with_capacity(lots.len());

    for (lot, &qty) in lots {
        let share = (total as f64 * qty as f64 / lot_sum as f64).round_ties_even() as u64;
        let share = share.min(remaining);
        if share == 0 {
            continue;
        }
        remaining -= share;
        allocations.push(Allocation {
            lot: lot.clone(),
            quantity: share,
        });
    }

    let allocated = total - remaining;
    if allocated != total {
        tracing::debug!(
            symbol,
            requested = total,
            allocated,
            lots = lots.len(),
            "Lot allocation rounded below requested quantity"
        );
    }

    allocations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loans(entries: &[(&str, u64)]) -> BTreeMap<LotKey, u64> {
        entries
            .iter()
            .map(|(d, q)| (LotKey::Loan(d.to_string()), *q))
            .collect()
    }

    #[test]
    fn test_empty_lots_is_single_cash_allocation() {
        let allocs = allocate("005930", 37, &BTreeMap::new());
        assert_eq!(
            allocs,
            vec![Allocation {
                lot: LotKey::Cash,
                quantity: 37
            }]
        );
    }

    #[test]
    fn test_proportional_split() {
        let lots = loans(&[("20240105", 60), ("20240112", 40)]);
        let allocs = allocate("005930", 50, &lots);

        assert_eq!(allocs.len(), 2);
        assert_eq!(allocs[0].lot, LotKey::Loan("20240105".to_string()));
        assert_eq!(allocs[0].quantity, 30);
        assert_eq!(allocs[1].lot, LotKey::Loan("20240112".to_string()));
        assert_eq!(allocs[1].quantity, 20);
    }

    #[test]
    fn test_zero_shares_dropped() {
        let lots = loans(&[("20240105", 99), ("20240112", 1)]);
        let allocs = allocate("005930", 10, &lots);

        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].quantity, 10);
    }

    #[test]
    fn test_sum_within_rounding_bound() {
        let cases: Vec<(u64, Vec<u64>)> = vec![
            (3, vec![1, 1]),
            (1, vec![1, 1]),
            (7, vec![3, 3, 3]),
            (10, vec![1, 1, 1, 1, 1, 1]),
            (99, vec![17, 23, 5, 55]),
            (5, vec![5, 5, 5, 5, 5]),
            (1000, vec![333, 333, 334]),
        ];

        for (total, quantities) in cases {
            let lots: BTreeMap<LotKey, u64> = quantities
                .iter()
                .enumerate()
                .map(|(i, q)| (LotKey::Loan(format!("202401{:02}", i + 1)), *q))
                .collect();
            let k = lots.len() as u64;
            let sum: u64 = allocate("000660", total, &lots)
                .iter()
                .map(|a| a.quantity)
                .sum();

            assert!(sum <= total, "over-allocated {} of {}", sum, total);
            assert!(
                sum + (k - 1) >= total,
                "under-allocated {} of {} across {} lots",
                sum,
                total,
                k
            );
        }
    }

    #[test]
    fn test_cash_remainder_lot_included() {
        let mut lots = loans(&[("20240105", 6)]);
        lots.insert(LotKey::Cash, 4);
        let allocs = allocate("005930", 10, &lots);

        assert_eq!(allocs[0].lot, LotKey::Cash);
        assert_eq!(allocs[0].quantity, 4);
        assert_eq!(allocs[1].quantity, 6);
    }

    #[test]
    fn test_zero_total_allocates_nothing() {
        let lots = loans(&[("20240105", 6)]);
        assert!(allocate("005930", 0, &lots).is_empty());
    }
}
