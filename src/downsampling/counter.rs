//! Counters that decide which value has been active "most of the time"

use crate::chunk::{HistoryEnumOrdinal, HistoryEnumSet, ReferenceEntryId};
use std::collections::HashMap;

/// Counts how often each enum ordinal has been active within a slot
#[derive(Debug, Clone)]
pub struct EnumOrdinalCounter {
    counts: [u32; HistoryEnumSet::MAX_ORDINAL as usize + 1],
}

impl Default for EnumOrdinalCounter {
    fn default() -> Self {
        Self {
            counts: [0; HistoryEnumSet::MAX_ORDINAL as usize + 1],
        }
    }
}

impl EnumOrdinalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts every ordinal contained in the set
    pub fn add(&mut self, set: HistoryEnumSet) {
        for ordinal in set.ordinals() {
            self.counts[ordinal.0 as usize] += 1;
        }
    }

    /// The ordinal with the highest count. Ties are won by the lower ordinal.
    pub fn winner(&self) -> Option<HistoryEnumOrdinal> {
        let mut best: Option<(usize, u32)> = None;
        for (ordinal, count) in self.counts.iter().copied().enumerate() {
            if count == 0 {
                continue;
            }
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((ordinal, count));
            }
        }
        best.map(|(ordinal, _)| HistoryEnumOrdinal(ordinal as u16))
    }

    pub fn reset(&mut self) {
        self.counts = [0; HistoryEnumSet::MAX_ORDINAL as usize + 1];
    }
}

/// Counts reference entry ids within a slot.
///
/// Measured samples are counted directly. Samples of down sampled buckets
/// already carry the number of different ids of their slot; these counts are
/// summed up, assuming that an id seen at the end of one slot is the same one
/// that is seen at the start of the next slot.
#[derive(Debug, Clone, Default)]
pub struct ReferenceEntryCounter {
    /// Count per id, used for "most of the time". Never contains zeros.
    counts_per_id: HashMap<ReferenceEntryId, u32>,
    /// Sum of the different ids counts. Only set when calculated samples have been added.
    calculated_different_ids: Option<u32>,
    /// The id of the last calculated sample
    last_id: Option<ReferenceEntryId>,
}

impl ReferenceEntryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sample. `different_ids_count` is `Some` for samples of down sampled buckets.
    pub fn add(&mut self, id: ReferenceEntryId, different_ids_count: Option<u32>) {
        match different_ids_count {
            None => self.add_measured(id),
            Some(count) => self.add_calculated(id, count),
        }
    }

    /// Adds a recorded sample
    pub fn add_measured(&mut self, id: ReferenceEntryId) {
        *self.counts_per_id.entry(id).or_insert(0) += 1;
    }

    /// Adds a sample of a down sampled bucket.
    ///
    /// The id only counts once for "most of the time", regardless of `different_ids_count`.
    pub fn add_calculated(&mut self, id: ReferenceEntryId, different_ids_count: u32) {
        let sum = match (self.calculated_different_ids, self.last_id) {
            (Some(sum), Some(last_id)) if sum > 0 => {
                if last_id == id {
                    // The id continues from the previous sample
                    sum + different_ids_count.saturating_sub(1)
                } else {
                    sum + different_ids_count
                }
            }
            _ => different_ids_count,
        };

        self.calculated_different_ids = Some(sum);
        self.last_id = Some(id);
        *self.counts_per_id.entry(id).or_insert(0) += 1;
    }

    /// Number of different ids, `None` if nothing has been added
    pub fn different_ids_count(&self) -> Option<u32> {
        if let Some(sum) = self.calculated_different_ids {
            return Some(sum);
        }
        if self.counts_per_id.is_empty() {
            return None;
        }
        Some(self.counts_per_id.len() as u32)
    }

    /// The id that has been seen most often. Ties are won by the lower id.
    pub fn winner_most_of_the_time(&self) -> Option<ReferenceEntryId> {
        self.counts_per_id
            .iter()
            .max_by(|(id_a, count_a), (id_b, count_b)| {
                count_a.cmp(count_b).then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, _)| *id)
    }

    pub fn reset(&mut self) {
        self.counts_per_id.clear();
        self.calculated_different_ids = None;
        self.last_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ordinals: &[u16]) -> HistoryEnumSet {
        ordinals
            .iter()
            .map(|ordinal| HistoryEnumSet::for_ordinal(HistoryEnumOrdinal(*ordinal)))
            .fold(HistoryEnumSet::default(), HistoryEnumSet::union)
    }

    #[test]
    fn test_enum_winner() {
        let mut counter = EnumOrdinalCounter::new();
        assert_eq!(counter.winner(), None);

        counter.add(set(&[1]));
        counter.add(set(&[1, 3]));
        counter.add(set(&[3]));
        counter.add(set(&[3]));
        assert_eq!(counter.winner(), Some(HistoryEnumOrdinal(3)));

        counter.reset();
        counter.add(set(&[5, 2]));
        assert_eq!(counter.winner(), Some(HistoryEnumOrdinal(2)));
    }

    #[test]
    fn test_measured_counts() {
        let mut counter = ReferenceEntryCounter::new();
        assert_eq!(counter.different_ids_count(), None);
        assert_eq!(counter.winner_most_of_the_time(), None);

        for id in [7, 7, 3, 7, 9] {
            counter.add(ReferenceEntryId(id), None);
        }
        assert_eq!(counter.different_ids_count(), Some(3));
        assert_eq!(counter.winner_most_of_the_time(), Some(ReferenceEntryId(7)));
    }

    #[test]
    fn test_measured_tie_prefers_lower_id() {
        let mut counter = ReferenceEntryCounter::new();
        counter.add_measured(ReferenceEntryId(9));
        counter.add_measured(ReferenceEntryId(4));
        assert_eq!(counter.winner_most_of_the_time(), Some(ReferenceEntryId(4)));
    }

    #[test]
    fn test_calculated_counts() {
        let mut counter = ReferenceEntryCounter::new();

        counter.add(ReferenceEntryId(1), Some(3));
        assert_eq!(counter.different_ids_count(), Some(3));

        // Same id continues: one of the two ids is already counted
        counter.add(ReferenceEntryId(1), Some(2));
        assert_eq!(counter.different_ids_count(), Some(4));

        // Different id: all ids are new
        counter.add(ReferenceEntryId(2), Some(2));
        assert_eq!(counter.different_ids_count(), Some(6));

        // Most of the time counts each sample once
        assert_eq!(counter.winner_most_of_the_time(), Some(ReferenceEntryId(1)));
    }

    #[test]
    fn test_calculated_single_id_repeated() {
        let mut counter = ReferenceEntryCounter::new();
        for _ in 0..10 {
            counter.add_calculated(ReferenceEntryId(5), 1);
        }
        assert_eq!(counter.different_ids_count(), Some(1));
    }

    #[test]
    fn test_reset() {
        let mut counter = ReferenceEntryCounter::new();
        counter.add_calculated(ReferenceEntryId(5), 4);
        counter.reset();
        assert_eq!(counter.different_ids_count(), None);

        counter.add_calculated(ReferenceEntryId(5), 2);
        assert_eq!(counter.different_ids_count(), Some(2));
    }
}
