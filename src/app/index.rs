use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::config::SummaryMode;
use super::types::{CardValue, RunTimes};

/// Basket size once the valued population is large enough.
pub const BASKET_CAP: usize = 500;
/// Index level of the run that fixes the divisor.
pub const INDEX_BASE: f64 = 10_000.0;

/// `0 → 0`, below the cap the top half (at least one), otherwise the cap.
pub fn basket_size(n: usize) -> usize {
    match n {
        0 => 0,
        n if n < BASKET_CAP => (n / 2).max(1),
        _ => BASKET_CAP,
    }
}

/// Highest value first; equal values keep their discovery order.
pub fn rank_values(mut values: Vec<CardValue>) -> Vec<CardValue> {
    values.sort_by(|a, b| b.value_usd.total_cmp(&a.value_usd));
    values
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexFigure {
    PopWeighted {
        total_pop10: u64,
        average_usd: Option<f64>,
    },
    IndexLevel {
        divisor: Option<f64>,
        level: Option<f64>,
        /// The divisor came from an earlier run rather than this one.
        carried_forward: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub run: RunTimes,
    pub total_cards: usize,
    pub basket_size: usize,
    pub basket_sum_value: f64,
    pub figure: IndexFigure,
}

impl IndexSnapshot {
    /// The headline number: pop-weighted average or index level.
    pub fn headline(&self) -> Option<f64> {
        match self.figure {
            IndexFigure::PopWeighted { average_usd, .. } => average_usd,
            IndexFigure::IndexLevel { level, .. } => level,
        }
    }
}

/// All valued cards of a run, ranked, with the snapshot computed over them.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub ranked: Vec<CardValue>,
    pub snapshot: IndexSnapshot,
}

impl Aggregate {
    pub fn basket(&self) -> &[CardValue] {
        &self.ranked[..self.snapshot.basket_size]
    }
}

/// Ranks `values` (given in discovery order) and computes the run's figure.
///
/// `base_divisor` is the divisor persisted by the first index-level run, if
/// any; it is ignored in pop-weighted mode.
pub fn aggregate(
    values: Vec<CardValue>,
    mode: SummaryMode,
    base_divisor: Option<f64>,
    run: RunTimes,
) -> Aggregate {
    let ranked = rank_values(values);
    let total_cards = ranked.len();
    let k = basket_size(total_cards);
    let basket = &ranked[..k];
    let basket_sum_value: f64 = basket.iter().map(|c| c.value_usd).sum();

    let figure = match mode {
        SummaryMode::PopWeighted => {
            let total_pop10: u64 = basket.iter().map(|c| c.pop10).sum();
            let average_usd = (total_pop10 > 0).then(|| basket_sum_value / total_pop10 as f64);
            IndexFigure::PopWeighted {
                total_pop10,
                average_usd,
            }
        }
        SummaryMode::IndexLevel => index_level(k, basket_sum_value, base_divisor),
    };

    Aggregate {
        snapshot: IndexSnapshot {
            run,
            total_cards,
            basket_size: k,
            basket_sum_value,
            figure,
        },
        ranked,
    }
}

fn index_level(basket_size: usize, basket_sum_value: f64, base_divisor: Option<f64>) -> IndexFigure {
    if basket_size == 0 {
        return IndexFigure::IndexLevel {
            divisor: base_divisor,
            level: None,
            carried_forward: base_divisor.is_some(),
        };
    }
    match base_divisor.filter(|d| d.is_finite() && *d > 0.0) {
        Some(divisor) => IndexFigure::IndexLevel {
            divisor: Some(divisor),
            level: Some(basket_sum_value / divisor),
            carried_forward: true,
        },
        None if basket_sum_value > 0.0 => IndexFigure::IndexLevel {
            divisor: Some(basket_sum_value / INDEX_BASE),
            level: Some(INDEX_BASE),
            carried_forward: false,
        },
        None => IndexFigure::IndexLevel {
            divisor: None,
            level: None,
            carried_forward: false,
        },
    }
}

#[derive(Debug, Clone)]
struct Ranked {
    seq: usize,
    card: CardValue,
}

impl Ord for Ranked {
    /// Greater means ranks higher: larger value, then earlier discovery.
    fn cmp(&self, other: &Self) -> Ordering {
        self.card
            .value_usd
            .total_cmp(&other.card.value_usd)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// The `capacity` highest-value cards seen so far, kept in a min-heap.
#[derive(Debug, Clone)]
pub struct TopN {
    capacity: usize,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl TopN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
        }
    }

    /// `seq` is the card's discovery position; it breaks ties.
    pub fn offer(&mut self, seq: usize, card: &CardValue) {
        if self.capacity == 0 {
            return;
        }
        let candidate = Ranked {
            seq,
            card: card.clone(),
        };
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(candidate));
            return;
        }
        let beats_worst = self
            .heap
            .peek()
            .is_some_and(|Reverse(worst)| candidate > *worst);
        if beats_worst {
            self.heap.pop();
            self.heap.push(Reverse(candidate));
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Best first.
    pub fn into_ranked(self) -> Vec<CardValue> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(r)| r.card)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(value: f64, pop10: u64) -> CardValue {
        CardValue::from_totals(format!("card {value}"), format!("https://x/{value}"), value, pop10)
            .unwrap()
    }

    fn run() -> RunTimes {
        RunTimes {
            iso: "2026-10-18T09:00:00+09:00".into(),
            local: "2026-10-18 09:00:00 +0900".into(),
        }
    }

    #[test]
    fn basket_size_rule() {
        assert_eq!(basket_size(0), 0);
        assert_eq!(basket_size(1), 1);
        assert_eq!(basket_size(3), 1);
        assert_eq!(basket_size(100), 50);
        assert_eq!(basket_size(499), 249);
        assert_eq!(basket_size(500), 500);
        assert_eq!(basket_size(10_000), 500);
    }

    #[test]
    fn pop_weighted_average_over_top_half() {
        let values = vec![card(10.0, 1), card(20.0, 2), card(30.0, 3), card(40.0, 4), card(5000.0, 50)];
        let agg = aggregate(values, SummaryMode::PopWeighted, None, run());
        let snap = &agg.snapshot;
        assert_eq!(snap.total_cards, 5);
        assert_eq!(snap.basket_size, 2);
        assert_eq!(snap.basket_sum_value, 5040.0);
        assert_eq!(
            snap.figure,
            IndexFigure::PopWeighted {
                total_pop10: 54,
                average_usd: Some(5040.0 / 54.0),
            }
        );
        let basket: Vec<f64> = agg.basket().iter().map(|c| c.value_usd).collect();
        assert_eq!(basket, vec![5000.0, 40.0]);
    }

    #[test]
    fn empty_run_has_no_figure() {
        let agg = aggregate(Vec::new(), SummaryMode::PopWeighted, None, run());
        assert_eq!(agg.snapshot.basket_size, 0);
        assert_eq!(agg.snapshot.basket_sum_value, 0.0);
        assert_eq!(agg.snapshot.headline(), None);
        assert!(agg.basket().is_empty());

        let agg = aggregate(Vec::new(), SummaryMode::IndexLevel, None, run());
        assert_eq!(agg.snapshot.headline(), None);
    }

    #[test]
    fn ties_keep_discovery_order() {
        let mut first = card(100.0, 1);
        first.name = "first".into();
        let mut second = card(100.0, 1);
        second.name = "second".into();
        let ranked = rank_values(vec![card(1.0, 1), first, second]);
        assert_eq!(ranked[0].name, "first");
        assert_eq!(ranked[1].name, "second");
    }

    #[test]
    fn first_index_run_is_base_level() {
        let values = vec![card(10.0, 1), card(20.0, 1), card(30.0, 1), card(40.0, 1), card(5000.0, 1)];
        let agg = aggregate(values, SummaryMode::IndexLevel, None, run());
        assert_eq!(
            agg.snapshot.figure,
            IndexFigure::IndexLevel {
                divisor: Some(0.504),
                level: Some(10_000.0),
                carried_forward: false,
            }
        );
    }

    #[test]
    fn carried_divisor_rebases_later_runs() {
        let values = vec![card(10_080.0, 1), card(1.0, 1)];
        let agg = aggregate(values, SummaryMode::IndexLevel, Some(0.504), run());
        let IndexFigure::IndexLevel { level, carried_forward, .. } = agg.snapshot.figure else {
            panic!("expected index level");
        };
        assert!(carried_forward);
        assert!((level.unwrap() - 20_000.0).abs() < 1e-6);
    }

    #[test]
    fn top_n_keeps_best_and_breaks_ties_by_discovery() {
        let mut top = TopN::new(3);
        let values = [5.0, 50.0, 7.0, 50.0, 1.0, 9.0];
        for (seq, v) in values.iter().enumerate() {
            let mut c = card(*v, 1);
            c.name = format!("#{seq}");
            top.offer(seq, &c);
        }
        assert_eq!(top.len(), 3);
        let names: Vec<String> = top.into_ranked().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["#1", "#3", "#5"]);
    }

    #[test]
    fn top_n_matches_full_sort_regardless_of_arrival_order() {
        let values: Vec<CardValue> = (1..=25).map(|i| card((i * 37 % 23) as f64 + 1.0, 1)).collect();
        let expected: Vec<f64> = rank_values(values.clone())
            .into_iter()
            .take(10)
            .map(|c| c.value_usd)
            .collect();

        let mut top = TopN::new(10);
        for (seq, c) in values.iter().enumerate().rev() {
            top.offer(seq, c);
        }
        let got: Vec<f64> = top.into_ranked().into_iter().map(|c| c.value_usd).collect();
        assert_eq!(got, expected);
    }
}
