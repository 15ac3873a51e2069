//! Bounded top-k collection with deterministic ordering.
//!
//! Results are ordered by descending score; equal scores are broken by the
//! smaller item id so that identical inputs always rank identically.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::vector::{ItemId, Score};

/// A ranked search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub item_id: ItemId,
    pub score: Score,
    /// 1-based position in the result list.
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    score: Score,
    item_id: ItemId,
}

impl Ord for Candidate {
    /// Greater means better: higher score, then smaller id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.item_id.cmp(&self.item_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Keeps the `k` best candidates seen so far.
///
/// The heap's top is the worst kept candidate, so each offer costs
/// O(log k) and memory stays at k entries however many are scanned.
#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
}

impl TopK {
    #[must_use]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    /// Offers a candidate; it is kept if it beats the current worst.
    pub fn push(&mut self, item_id: ItemId, score: Score) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate { score, item_id };
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
            return;
        }
        let beats_worst = match self.heap.peek() {
            Some(Reverse(worst)) => candidate > *worst,
            None => true,
        };
        if beats_worst {
            self.heap.pop();
            self.heap.push(Reverse(candidate));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// True once `k` candidates are held; later offers only replace.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Consumes the collector, returning results best first with ranks.
    #[must_use]
    pub fn into_results(self) -> Vec<SearchResult> {
        // Ascending order of Reverse<_> is best first.
        self.heap
            .into_sorted_vec()
            .into_iter()
            .enumerate()
            .map(|(i, Reverse(candidate))| SearchResult {
                item_id: candidate.item_id,
                score: candidate.score,
                rank: i + 1,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ItemId {
        ItemId::new(n).unwrap()
    }

    fn score(v: f32) -> Score {
        Score::from_similarity(v)
    }

    #[test]
    fn test_keeps_best_k_in_order() {
        let mut topk = TopK::new(3);
        for (n, s) in [(1, 0.1), (2, 0.9), (3, 0.5), (4, 0.7), (5, -0.2)] {
            topk.push(id(n), score(s));
        }
        let results = topk.into_results();
        let ids: Vec<u64> = results.iter().map(|r| r.item_id.get()).collect();
        assert_eq!(ids, vec![2, 4, 3]);
        let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_ties_prefer_smaller_id() {
        let mut topk = TopK::new(2);
        topk.push(id(9), score(0.5));
        topk.push(id(3), score(0.5));
        topk.push(id(7), score(0.5));
        let ids: Vec<u64> = topk.into_results().iter().map(|r| r.item_id.get()).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn test_fewer_candidates_than_k() {
        let mut topk = TopK::new(10);
        topk.push(id(1), score(0.2));
        topk.push(id(2), score(0.4));
        assert_eq!(topk.len(), 2);
        let results = topk.into_results();
        assert_eq!(results[0].item_id, id(2));
    }

    #[test]
    fn test_zero_k() {
        let mut topk = TopK::new(0);
        topk.push(id(1), score(1.0));
        assert!(topk.is_empty());
        assert!(topk.into_results().is_empty());
    }
}
