use std::hash::BuildHasher;

use access_log::{CommonLog, PerUserSummary};
use fnv::FnvBuildHasher;
use hashbrown::HashTable;
use hashbrown::hash_table::Entry;
use itertools::Itertools;
use log::trace;

use crate::accumulator::Accumulator;
use crate::error::{AggregateError, Overflow};

/// Per-record outcomes that did not reach an accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub folded: u64,
    pub invalid_keys: u64,
    pub overflowed: u64,
}

impl Diagnostics {
    pub fn merge(&mut self, other: &Diagnostics) {
        self.folded += other.folded;
        self.invalid_keys += other.invalid_keys;
        self.overflowed += other.overflowed;
    }

    pub fn skipped(&self) -> u64 {
        self.invalid_keys + self.overflowed
    }
}

// Hash is kept next to the key so merging never rehashes user ids.
#[derive(Debug, Clone)]
struct Slot {
    key: String,
    hash: u64,
    acc: Accumulator,
}

/// Maps each user id to its [`Accumulator`].
///
/// One instance is owned by each worker. Entries are created on the first fold for a key, so an
/// aggregator never holds an empty accumulator.
#[derive(Debug, Clone)]
pub struct KeyedAggregator<S = FnvBuildHasher> {
    table: HashTable<Slot>,
    diagnostics: Diagnostics,
    bh: S,
}

impl KeyedAggregator<FnvBuildHasher> {
    pub fn new() -> Self {
        Self::with_hasher(FnvBuildHasher::default())
    }
}

impl Default for KeyedAggregator<FnvBuildHasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BuildHasher> KeyedAggregator<S> {
    pub fn with_hasher(bh: S) -> Self {
        Self {
            table: HashTable::new(),
            diagnostics: Diagnostics::default(),
            bh,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn get(&self, key: &str) -> Option<&Accumulator> {
        let hash = self.bh.hash_one(key);
        self.table
            .find(hash, |slot| slot.key == key)
            .map(|slot| &slot.acc)
    }

    /// Folds one record into the accumulator for its `user_id`.
    ///
    /// Records with an empty key, or whose bytes would overflow the running totals, are counted in
    /// [`Diagnostics`] and leave every accumulator unchanged.
    pub fn apply(&mut self, record: &CommonLog) -> Result<(), AggregateError> {
        let hash = self.bh.hash_one(record.user_id.as_str());
        self.apply_hashed(hash, record)
    }

    /// Same as [`apply`](Self::apply) with the key hash already computed by the router. The hash
    /// must come from an equivalent hasher.
    pub(crate) fn apply_hashed(&mut self, hash: u64, record: &CommonLog) -> Result<(), AggregateError> {
        debug_assert_eq!(hash, self.bh.hash_one(record.user_id.as_str()), "key hashed by a different hasher");
        if record.user_id.is_empty() {
            self.diagnostics.invalid_keys += 1;
            trace!("Skipping record with empty user_id from {}", record.ip);
            return Err(AggregateError::InvalidKey);
        }

        let folded = match self.table.entry(hash, |slot| slot.key == record.user_id, |slot| slot.hash) {
            Entry::Occupied(mut occupied) => occupied.get_mut().acc.fold(record.num_bytes),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    key: record.user_id.clone(),
                    hash,
                    acc: Accumulator::from_value(record.num_bytes),
                });
                Ok(())
            }
        };

        match folded {
            Ok(()) => {
                self.diagnostics.folded += 1;
                Ok(())
            }
            Err(Overflow) => {
                self.diagnostics.overflowed += 1;
                Err(AggregateError::NumericOverflow { key: record.user_id.clone() })
            }
        }
    }

    /// Merges every accumulator of `other` into this aggregator, consuming `other`.
    ///
    /// Both aggregators must use equivalent hashers. The smaller table is folded into the larger
    /// one. On overflow the aggregator is left partially merged and should be discarded.
    pub fn merge_from(&mut self, mut other: KeyedAggregator<S>) -> Result<(), AggregateError> {
        if other.table.len() > self.table.len() {
            std::mem::swap(&mut self.table, &mut other.table);
        }
        self.diagnostics.merge(&other.diagnostics);

        for slot in other.table {
            match self.table.entry(slot.hash, |s| s.key == slot.key, |s| s.hash) {
                Entry::Occupied(mut occupied) => {
                    occupied
                        .get_mut()
                        .acc
                        .merge(&slot.acc)
                        .map_err(|_| AggregateError::NumericOverflow { key: slot.key.clone() })?;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                }
            }
        }
        Ok(())
    }

    /// Current state as `(key, accumulator)` pairs, in no particular order.
    pub fn snapshot(&self) -> Vec<(String, Accumulator)> {
        self.table
            .iter()
            .map(|slot| (slot.key.clone(), slot.acc))
            .collect_vec()
    }

    pub fn into_summaries(self) -> impl Iterator<Item = PerUserSummary> {
        self.table.into_iter().map(|slot| summarise(slot.key, &slot.acc))
    }
}

pub(crate) fn summarise(user_id: String, acc: &Accumulator) -> PerUserSummary {
    // Stored accumulators always hold at least one fold, so max and min are set.
    PerUserSummary {
        user_id,
        page_views: acc.count,
        total_bytes: acc.sum,
        max_bytes: acc.max.unwrap_or_default(),
        min_bytes: acc.min.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use fastrand::Rng;
    use itertools::Itertools;

    use super::*;

    fn record(user_id: &str, num_bytes: u64) -> CommonLog {
        CommonLog::new(user_id, num_bytes)
    }

    fn sorted(agg: &KeyedAggregator) -> Vec<(String, Accumulator)> {
        agg.snapshot()
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect_vec()
    }

    fn random_records(rng: &mut Rng, len: usize, keys: u32) -> Vec<CommonLog> {
        (0..len)
            .map(|_| record(&format!("user-{}", rng.u32(0..keys)), rng.u64(0..100_000)))
            .collect_vec()
    }

    #[test]
    fn apply_creates_keys_lazily() {
        let mut agg = KeyedAggregator::new();
        assert!(agg.is_empty());
        assert!(agg.get("u1").is_none());

        agg.apply(&record("u1", 100)).unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.get("u1"), Some(&Accumulator::from_value(100)));

        agg.apply(&record("u1", 50)).unwrap();
        assert_eq!(agg.len(), 1);
        agg.apply(&record("u2", 200)).unwrap();
        assert_eq!(agg.len(), 2);

        let u1 = agg.get("u1").unwrap();
        assert_eq!((u1.count, u1.sum, u1.max, u1.min), (2, 150, Some(100), Some(50)));
        assert_eq!(agg.diagnostics().folded, 3);
    }

    #[test]
    fn empty_key_is_skipped_and_counted() {
        let mut agg = KeyedAggregator::new();
        agg.apply(&record("u1", 10)).unwrap();
        assert_eq!(agg.apply(&record("", 999)), Err(AggregateError::InvalidKey));

        assert_eq!(agg.len(), 1);
        assert_eq!(agg.get("u1"), Some(&Accumulator::from_value(10)));
        assert_eq!(agg.diagnostics().invalid_keys, 1);
        assert_eq!(agg.diagnostics().folded, 1);
    }

    #[test]
    fn overflow_is_skipped_and_counted() {
        let mut agg = KeyedAggregator::new();
        agg.apply(&record("big", u64::MAX)).unwrap();
        assert_eq!(
            agg.apply(&record("big", 1)),
            Err(AggregateError::NumericOverflow { key: "big".into() })
        );
        assert_eq!(agg.get("big"), Some(&Accumulator::from_value(u64::MAX)));
        assert_eq!(agg.diagnostics().overflowed, 1);
    }

    #[test]
    fn snapshot_is_idempotent() {
        let mut rng = Rng::with_seed(1);
        let mut agg = KeyedAggregator::new();
        for r in random_records(&mut rng, 1_000, 50) {
            agg.apply(&r).unwrap();
        }
        assert_eq!(sorted(&agg), sorted(&agg));
        assert_eq!(agg.snapshot().len(), agg.len());
    }

    #[test]
    fn merge_from_combines_shared_keys_and_moves_new_ones() {
        let mut left = KeyedAggregator::new();
        left.apply(&record("u1", 100)).unwrap();
        left.apply(&record("", 1)).unwrap_err();

        let mut right = KeyedAggregator::new();
        right.apply(&record("u1", 50)).unwrap();
        right.apply(&record("u2", 200)).unwrap();
        right.apply(&record("u3", 5)).unwrap();

        left.merge_from(right).unwrap();

        assert_eq!(left.len(), 3);
        let u1 = left.get("u1").unwrap();
        assert_eq!((u1.count, u1.sum, u1.max, u1.min), (2, 150, Some(100), Some(50)));
        assert_eq!(left.get("u2"), Some(&Accumulator::from_value(200)));
        assert_eq!(left.diagnostics().folded, 4);
        assert_eq!(left.diagnostics().invalid_keys, 1);
    }

    #[test]
    fn merge_overflow_names_key() {
        let mut left = KeyedAggregator::new();
        left.apply(&record("big", u64::MAX)).unwrap();
        let mut right = KeyedAggregator::new();
        right.apply(&record("big", 1)).unwrap();

        assert_eq!(
            left.merge_from(right),
            Err(AggregateError::NumericOverflow { key: "big".into() })
        );
    }

    #[test]
    fn partitioned_folds_match_sequential_fold() {
        let mut rng = Rng::with_seed(42);
        for partitions in [1, 2, 3, 7, 16] {
            let records = random_records(&mut rng, 2_000, 100);

            let mut sequential = KeyedAggregator::new();
            records.iter().for_each(|r| sequential.apply(r).unwrap());

            // Arbitrary assignment: the same key lands in several partitions.
            let mut parts = (0..partitions).map(|_| KeyedAggregator::new()).collect_vec();
            for r in records.iter() {
                parts[rng.usize(0..partitions)].apply(r).unwrap();
            }
            let mut parts = parts.into_iter();
            let mut merged = parts.next().unwrap();
            for part in parts {
                merged.merge_from(part).unwrap();
            }

            assert_eq!(sorted(&merged), sorted(&sequential));
            assert_eq!(merged.diagnostics(), sequential.diagnostics());
        }
    }

    #[test]
    fn merge_grouping_does_not_matter() {
        let mut rng = Rng::with_seed(9);
        let build = |records: &[CommonLog]| {
            let mut agg = KeyedAggregator::new();
            records.iter().for_each(|r| agg.apply(r).unwrap());
            agg
        };
        let a = random_records(&mut rng, 300, 20);
        let b = random_records(&mut rng, 300, 20);
        let c = random_records(&mut rng, 300, 20);

        let mut left = build(&a);
        left.merge_from(build(&b)).unwrap();
        left.merge_from(build(&c)).unwrap();

        let mut inner = build(&b);
        inner.merge_from(build(&c)).unwrap();
        let mut right = build(&a);
        right.merge_from(inner).unwrap();

        let mut swapped = build(&c);
        swapped.merge_from(build(&a)).unwrap();
        swapped.merge_from(build(&b)).unwrap();

        assert_eq!(sorted(&left), sorted(&right));
        assert_eq!(sorted(&left), sorted(&swapped));
    }

    #[test]
    fn into_summaries_reports_every_key() {
        let mut agg = KeyedAggregator::new();
        agg.apply(&record("u1", 100)).unwrap();
        agg.apply(&record("u1", 50)).unwrap();
        agg.apply(&record("u2", 200)).unwrap();

        let summaries = agg.into_summaries().sorted().collect_vec();
        assert_eq!(
            summaries,
            [
                PerUserSummary { user_id: "u1".into(), page_views: 2, total_bytes: 150, max_bytes: 100, min_bytes: 50 },
                PerUserSummary { user_id: "u2".into(), page_views: 1, total_bytes: 200, max_bytes: 200, min_bytes: 200 },
            ]
        );
    }
}
