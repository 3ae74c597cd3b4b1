//! Compatibility scoring and hard feasibility filters.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;
use crate::model::{GenderPreference, TimeWindow};

/// Sub-scores kept alongside the composite for display and debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityScore {
    pub overlap: f64,
    pub interest: f64,
    pub composite: f64,
    /// Smallest pairwise time-window intersection among participants.
    pub time_overlap_minutes: u16,
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

fn normalized(tags: &BTreeSet<String>) -> BTreeSet<String> {
    tags.iter()
        .map(|tag| normalize_tag(tag))
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Jaccard index of two interest sets. Two empty sets score 0.
pub fn interest_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let a = normalized(a);
    let b = normalized(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Mean pairwise Jaccard index across a group.
pub fn group_interest_score(sets: &[&BTreeSet<String>]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (index, a) in sets.iter().enumerate() {
        for b in &sets[index + 1..] {
            total += interest_score(a, b);
            pairs += 1;
        }
    }
    if pairs == 0 { 0.0 } else { total / pairs as f64 }
}

/// Interests every participant has in common.
pub fn shared_interests(sets: &[&BTreeSet<String>]) -> BTreeSet<String> {
    let mut iter = sets.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(normalized(first), |acc, set| {
        let set = normalized(set);
        acc.intersection(&set).cloned().collect()
    })
}

/// If anyone requires the same gender, everyone must share one.
pub fn gender_compatible(participants: &[(GenderPreference, &str)]) -> bool {
    let strict = participants
        .iter()
        .any(|(preference, _)| *preference == GenderPreference::Same);
    if !strict {
        return true;
    }
    let mut genders = participants.iter().map(|(_, gender)| normalize_tag(gender));
    match genders.next() {
        Some(first) if !first.is_empty() => genders.all(|gender| gender == first),
        _ => false,
    }
}

/// Smallest pairwise window intersection, or `None` when some pair shares
/// less than `min_minutes`.
pub fn time_compatible(windows: &[TimeWindow], min_minutes: u16) -> Option<u16> {
    let mut smallest: Option<u16> = None;
    for (index, a) in windows.iter().enumerate() {
        for b in &windows[index + 1..] {
            let shared = a.intersection_minutes(b);
            if shared < min_minutes {
                return None;
            }
            smallest = Some(smallest.map_or(shared, |current| current.min(shared)));
        }
    }
    smallest
}

#[derive(Debug, Clone, Copy)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights: weights.normalized(),
        }
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    pub fn score(&self, overlap: f64, interest: f64, time_overlap_minutes: u16) -> CompatibilityScore {
        let overlap = overlap.clamp(0.0, 1.0);
        let interest = interest.clamp(0.0, 1.0);
        let composite =
            (self.weights.overlap * overlap + self.weights.interest * interest).clamp(0.0, 1.0);
        CompatibilityScore {
            overlap,
            interest,
            composite,
            time_overlap_minutes,
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_interest_score_bounds() {
        let coffee_hiking = tags(&["coffee", "hiking"]);
        let coffee_tech = tags(&["coffee", "tech"]);
        assert!((interest_score(&coffee_hiking, &coffee_tech) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(interest_score(&coffee_hiking, &coffee_hiking), 1.0);
        assert_eq!(interest_score(&coffee_hiking, &BTreeSet::new()), 0.0);
        assert_eq!(interest_score(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }

    #[test]
    fn test_interest_score_ignores_case() {
        assert_eq!(interest_score(&tags(&["Coffee "]), &tags(&["coffee"])), 1.0);
    }

    #[test]
    fn test_group_interest_is_mean_pairwise() {
        let a = tags(&["coffee", "hiking"]);
        let b = tags(&["coffee", "tech"]);
        let c = tags(&["coffee", "hiking"]);
        let expected = (1.0 / 3.0 + 1.0 + 1.0 / 3.0) / 3.0;
        assert!((group_interest_score(&[&a, &b, &c]) - expected).abs() < 1e-12);
        assert_eq!(group_interest_score(&[&a]), 0.0);
    }

    #[test]
    fn test_shared_interests() {
        let a = tags(&["coffee", "hiking"]);
        let b = tags(&["Coffee", "tech"]);
        assert_eq!(shared_interests(&[&a, &b]), tags(&["coffee"]));
    }

    #[test]
    fn test_gender_filter() {
        assert!(gender_compatible(&[(GenderPreference::Any, "f"), (GenderPreference::Any, "m")]));
        assert!(!gender_compatible(&[(GenderPreference::Same, "f"), (GenderPreference::Any, "m")]));
        assert!(!gender_compatible(&[(GenderPreference::Any, "f"), (GenderPreference::Same, "m")]));
        assert!(gender_compatible(&[(GenderPreference::Same, "F"), (GenderPreference::Any, "f")]));
    }

    #[test]
    fn test_time_filter() {
        let a = TimeWindow::from_hm((7, 30), (8, 15));
        let b = TimeWindow::from_hm((7, 40), (8, 20));
        let c = TimeWindow::from_hm((8, 10), (9, 0));
        assert_eq!(time_compatible(&[a, b], 10), Some(35));
        assert_eq!(time_compatible(&[a, c], 10), None);
        assert_eq!(time_compatible(&[a, b, c], 5), Some(5));
    }

    #[test]
    fn test_composite_uses_default_weights() {
        let score = Scorer::default().score(0.5, 1.0 / 3.0, 35);
        let expected = 0.8 * 0.5 + 0.2 / 3.0;
        assert!((score.composite - expected).abs() < 1e-12);
        assert_eq!(score.time_overlap_minutes, 35);
    }
}
