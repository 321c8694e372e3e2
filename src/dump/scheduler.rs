//! Write-order scheduling
//!
//! Pending objects are held in four buckets. Objects with no weighted
//! referrer wait in the zero bucket and are only served once every
//! weighted bucket is empty. Objects with exactly one weighted referrer
//! sit in the normal or strong bucket; new entries go to the head and,
//! because the cursor only advances, the head is always the best entry
//! in its bucket. Objects with several weighted referrers move to the
//! fancy bucket, which is rescanned in full on every dequeue.
//!
//! Entries left behind when an object changes bucket are stale and are
//! dropped when they reach a head.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use log::warn;
use ordered_float::OrderedFloat;

use super::settings::DumpSettings;

/// Locality hint attached to a reference
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Weight {
    None,
    Normal,
    Strong,
}

/// Scoring constants
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ScoreTuning {
    pub exponent: f64,
    pub normal: u32,
    pub strong: u32,
}

impl Default for ScoreTuning {
    fn default() -> Self {
        ScoreTuning::from(&DumpSettings::default())
    }
}

impl From<&DumpSettings> for ScoreTuning {
    fn from(settings: &DumpSettings) -> Self {
        ScoreTuning {
            exponent: settings.score_exponent,
            normal: settings.normal_weight,
            strong: settings.strong_weight,
        }
    }
}

impl ScoreTuning {
    fn weight_value(&self, weight: Weight) -> u32 {
        match weight {
            Weight::None => 0,
            Weight::Normal => self.normal,
            Weight::Strong => self.strong,
        }
    }

    /// Score of an object whose weighted referrers were recorded at
    /// the given bases, evaluated with the cursor at `position`
    pub fn score(&self, links: &[(usize, Weight)], position: usize) -> f64 {
        links
            .iter()
            .map(|&(basis, weight)| {
                let distance = position.saturating_sub(basis) as f64;
                let power = self.weight_value(weight) as f64 / 1000.0;
                distance.powf(self.exponent).powf(power)
            })
            .sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Bucket {
    Zero,
    Normal,
    Strong,
    Fancy,
}

#[derive(Debug)]
struct Pending {
    seqno: u64,
    bucket: Bucket,
    links: Vec<(usize, Weight)>,
}

impl Pending {
    fn classify(&self) -> Bucket {
        match self.links.as_slice() {
            [] => Bucket::Zero,
            [(_, Weight::Strong)] => Bucket::Strong,
            [_] => Bucket::Normal,
            _ => Bucket::Fancy,
        }
    }
}

#[derive(Debug)]
pub struct Scheduler<K> {
    tuning: ScoreTuning,
    next_seqno: u64,
    pending: HashMap<K, Pending>,
    zero: VecDeque<K>,
    normal: VecDeque<K>,
    strong: VecDeque<K>,
    fancy: Vec<K>,
    fancy_warn: usize,
    fancy_warned: bool,
}

impl<K: Copy + Eq + Hash> Scheduler<K> {
    pub fn new(tuning: ScoreTuning, fancy_warn: usize) -> Self {
        Scheduler {
            tuning,
            next_seqno: 0,
            pending: HashMap::new(),
            zero: VecDeque::new(),
            normal: VecDeque::new(),
            strong: VecDeque::new(),
            fancy: vec![],
            fancy_warn,
            fancy_warned: false,
        }
    }

    pub fn tuning(&self) -> &ScoreTuning {
        &self.tuning
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Add `key` or record another referrer for it
    pub fn enqueue(&mut self, key: K, basis: usize, weight: Weight) {
        let seqno = self.next_seqno;
        let entry = self.pending.entry(key).or_insert_with(|| Pending {
            seqno,
            bucket: Bucket::Zero,
            links: vec![],
        });
        let fresh = entry.seqno == seqno;
        if fresh {
            self.next_seqno += 1;
        }
        if weight != Weight::None {
            entry.links.push((basis, weight));
        }

        let bucket = entry.classify();
        if fresh || bucket != entry.bucket {
            entry.bucket = bucket;
            match bucket {
                Bucket::Zero => self.zero.push_front(key),
                Bucket::Normal => self.normal.push_front(key),
                Bucket::Strong => self.strong.push_front(key),
                Bucket::Fancy => {
                    self.fancy.push(key);
                    if self.fancy.len() > self.fancy_warn && !self.fancy_warned {
                        warn!(
                            "{} objects pending with multiple weighted referrers",
                            self.fancy.len()
                        );
                        self.fancy_warned = true;
                    }
                }
            }
        }
    }

    fn is_live(&self, key: &K, bucket: Bucket) -> bool {
        matches!(self.pending.get(key), Some(p) if p.bucket == bucket)
    }

    fn trim_head(&mut self, bucket: Bucket) {
        loop {
            let queue = match bucket {
                Bucket::Zero => &self.zero,
                Bucket::Normal => &self.normal,
                Bucket::Strong => &self.strong,
                Bucket::Fancy => return,
            };
            match queue.front() {
                Some(k) if !self.is_live(k, bucket) => {}
                _ => return,
            }
            match bucket {
                Bucket::Zero => self.zero.pop_front(),
                Bucket::Normal => self.normal.pop_front(),
                _ => self.strong.pop_front(),
            };
        }
    }

    /// Remove and return the best pending object with the cursor at
    /// `position`
    pub fn dequeue(&mut self, position: usize) -> Option<K> {
        self.trim_head(Bucket::Normal);
        self.trim_head(Bucket::Strong);
        self.trim_head(Bucket::Zero);
        let pending = &self.pending;
        self.fancy
            .retain(|k| matches!(pending.get(k), Some(p) if p.bucket == Bucket::Fancy));

        // (score, seqno, bucket, index in fancy)
        let mut best: Option<(OrderedFloat<f64>, u64, Bucket, usize)> = None;
        let candidates = self
            .normal
            .front()
            .map(|k| (*k, Bucket::Normal, 0))
            .into_iter()
            .chain(self.strong.front().map(|k| (*k, Bucket::Strong, 0)))
            .chain(
                self.fancy
                    .iter()
                    .enumerate()
                    .map(|(i, k)| (*k, Bucket::Fancy, i)),
            );
        for (key, bucket, index) in candidates {
            if let Some(p) = self.pending.get(&key) {
                let score = OrderedFloat(self.tuning.score(&p.links, position));
                let better = match best {
                    None => true,
                    Some((s, seq, _, _)) => score > s || (score == s && p.seqno < seq),
                };
                if better {
                    best = Some((score, p.seqno, bucket, index));
                }
            }
        }

        let key = match best {
            Some((_, _, Bucket::Normal, _)) => self.normal.pop_front(),
            Some((_, _, Bucket::Strong, _)) => self.strong.pop_front(),
            Some((_, _, _, index)) => Some(self.fancy.swap_remove(index)),
            None => self.zero.pop_front(),
        }?;
        self.pending.remove(&key);
        Some(key)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scheduler() -> Scheduler<u32> {
        Scheduler::new(ScoreTuning::default(), 100)
    }

    #[test]
    pub fn test_zero_bucket_is_lifo() {
        let mut s = scheduler();
        s.enqueue(1, 0, Weight::None);
        s.enqueue(2, 0, Weight::None);
        assert_eq!(s.dequeue(100), Some(2));
        assert_eq!(s.dequeue(100), Some(1));
        assert_eq!(s.dequeue(100), None);
        assert!(s.is_empty());
    }

    #[test]
    pub fn test_weighted_before_zero() {
        let mut s = scheduler();
        s.enqueue(1, 0, Weight::None);
        s.enqueue(2, 0, Weight::Normal);
        assert_eq!(s.dequeue(1000), Some(2));
        assert_eq!(s.dequeue(1000), Some(1));
    }

    #[test]
    pub fn test_nearer_referrer_wins() {
        let mut s = scheduler();
        s.enqueue(1, 100, Weight::Normal);
        s.enqueue(2, 900, Weight::Normal);
        assert_eq!(s.dequeue(1000), Some(2));
    }

    #[test]
    pub fn test_weight_is_a_power_on_the_distance_term() {
        let mut s = scheduler();
        s.enqueue(1, 500, Weight::Normal);
        s.enqueue(2, 500, Weight::Strong);
        let tuning = ScoreTuning::default();
        assert!(
            tuning.score(&[(500, Weight::Strong)], 1000)
                < tuning.score(&[(500, Weight::Normal)], 1000)
        );
        // distance^-0.2 < 1 so the stronger power shrinks it
        assert_eq!(s.dequeue(1000), Some(1));
    }

    #[test]
    pub fn test_multiply_referenced_object_outranks_unweighted() {
        let tuning = ScoreTuning::default();
        let mut s = scheduler();
        // A at 0 refers to B strongly, C at 400 refers to B normally
        s.enqueue('B' as u32, 0, Weight::Strong);
        s.enqueue('Z' as u32, 400, Weight::None);
        s.enqueue('B' as u32, 400, Weight::Normal);
        let b_score = tuning.score(&[(0, Weight::Strong), (400, Weight::Normal)], 800);
        assert!(b_score > tuning.score(&[], 800));
        assert_eq!(s.dequeue(800), Some('B' as u32));
        assert_eq!(s.dequeue(800), Some('Z' as u32));
    }

    #[test]
    pub fn test_stale_entries_are_skipped() {
        let mut s = scheduler();
        s.enqueue(1, 0, Weight::None);
        s.enqueue(1, 10, Weight::Normal);
        s.enqueue(1, 20, Weight::Normal);
        assert_eq!(s.len(), 1);
        assert_eq!(s.dequeue(100), Some(1));
        assert_eq!(s.dequeue(100), None);
    }

    #[test]
    pub fn test_ties_go_to_first_enqueued() {
        let mut s = scheduler();
        s.enqueue(7, 0, Weight::Normal);
        s.enqueue(7, 50, Weight::Normal);
        s.enqueue(3, 0, Weight::Normal);
        s.enqueue(3, 50, Weight::Normal);
        assert_eq!(s.dequeue(100), Some(7));
        assert_eq!(s.dequeue(100), Some(3));
    }

    #[test]
    pub fn test_distance_zero_scores_infinite() {
        let tuning = ScoreTuning::default();
        assert!(tuning.score(&[(64, Weight::Normal)], 64).is_infinite());
        assert_eq!(tuning.score(&[], 64), 0.0);
    }

    fn weight() -> impl Strategy<Value = Weight> {
        prop_oneof![Just(Weight::None), Just(Weight::Normal), Just(Weight::Strong)]
    }

    proptest! {
        #[test]
        fn prop_dequeue_is_deterministic_and_complete(
            ops in prop::collection::vec((0u32..20, 0usize..4096, weight()), 1..60)
        ) {
            let run = || {
                let mut s = scheduler();
                for (k, basis, w) in &ops {
                    s.enqueue(*k, *basis, *w);
                }
                let mut out = vec![];
                while let Some(k) = s.dequeue(8192) {
                    out.push(k);
                }
                out
            };
            let first = run();
            prop_assert_eq!(&first, &run());

            let mut keys: Vec<u32> = ops.iter().map(|(k, _, _)| *k).collect();
            keys.sort_unstable();
            keys.dedup();
            let mut seen = first.clone();
            seen.sort_unstable();
            prop_assert_eq!(seen, keys);
        }
    }
}
