// sv_history.rs — ring of entity states shared by every client snapshot
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::q_shared::EntityState;

/// The write counter may never reach this value.
pub const MAX_HISTORY_COUNTER: u64 = 0x7FFF_FFFE;

/// Position of one entity state in the history.
///
/// `seq` counts every state ever written in the current epoch; the
/// epoch changes when the ring is reset, so indices taken before a reset
/// can never alias states written after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryIndex {
    pub epoch: u32,
    pub seq: u64,
}

impl HistoryIndex {
    pub fn offset(self, n: usize) -> Self {
        Self {
            epoch: self.epoch,
            seq: self.seq + n as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("entity history {index} overwritten, oldest retained is {oldest}")]
    Overwritten { index: u64, oldest: u64 },
    #[error("entity history {index} not written yet, next is {next}")]
    NotWritten { index: u64, next: u64 },
    #[error("entity history index from epoch {epoch}, current epoch is {current}")]
    StaleEpoch { epoch: u32, current: u32 },
}

pub struct EntityHistory {
    states: Vec<EntityState>,
    epoch: u32,
    next: u64,
    limit: u64,
}

impl EntityHistory {
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, MAX_HISTORY_COUNTER)
    }

    /// A ring whose write counter is fatal at `limit` instead of the
    /// default.
    pub fn with_limit(capacity: usize, limit: u64) -> Self {
        assert!(capacity > 0, "EntityHistory: zero capacity");
        Self {
            states: vec![EntityState::default(); capacity],
            epoch: 0,
            next: 0,
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// The index the next write will use.
    pub fn next_index(&self) -> HistoryIndex {
        HistoryIndex {
            epoch: self.epoch,
            seq: self.next,
        }
    }

    /// Oldest sequence still stored.
    pub fn oldest(&self) -> u64 {
        self.next.saturating_sub(self.states.len() as u64)
    }

    /// True while a frame starting at `first` may still be used as a delta
    /// source: `next - capacity < first <= next`.
    pub fn is_retained(&self, first: HistoryIndex) -> bool {
        first.epoch == self.epoch && first.seq + self.states.len() as u64 > self.next && first.seq <= self.next
    }

    /// Appends a state and returns where it went.
    pub fn push(&mut self, state: EntityState) -> HistoryIndex {
        let index = self.next_index();
        let slot = (self.next % self.states.len() as u64) as usize;
        self.states[slot] = state;
        self.next += 1;
        if self.next >= self.limit {
            panic!("svs.nextSnapshotEntities wrapped");
        }
        index
    }

    fn check(&self, index: HistoryIndex) -> Result<usize, HistoryError> {
        if index.epoch != self.epoch {
            return Err(HistoryError::StaleEpoch {
                epoch: index.epoch,
                current: self.epoch,
            });
        }
        if index.seq >= self.next {
            return Err(HistoryError::NotWritten {
                index: index.seq,
                next: self.next,
            });
        }
        if index.seq < self.oldest() {
            return Err(HistoryError::Overwritten {
                index: index.seq,
                oldest: self.oldest(),
            });
        }
        Ok((index.seq % self.states.len() as u64) as usize)
    }

    pub fn get(&self, index: HistoryIndex) -> Result<&EntityState, HistoryError> {
        self.check(index).map(|slot| &self.states[slot])
    }

    /// The `count` states starting at `first`, checked as a whole.
    pub fn range(
        &self,
        first: HistoryIndex,
        count: usize,
    ) -> Result<impl Iterator<Item = &EntityState> + '_, HistoryError> {
        if count > 0 {
            self.check(first)?;
            self.check(first.offset(count - 1))?;
        } else if !self.is_retained(first) {
            self.check(first)?;
        }
        let capacity = self.states.len() as u64;
        Ok((0..count as u64).map(move |i| &self.states[((first.seq + i) % capacity) as usize]))
    }

    /// Starts a new epoch; every index handed out before is stale.
    pub fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.next = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic_and_counts_writes() {
        let mut history = EntityHistory::new(8);
        let mut last = history.next_index();
        let mut written = 0u64;
        for build in 0..5 {
            for n in 0..(build + 1) {
                let idx = history.push(EntityState::with_number(n));
                assert!(idx >= last);
                last = idx;
                written += 1;
            }
        }
        assert_eq!(history.next_index().seq, written);
    }

    #[test]
    fn overwritten_reads_are_errors() {
        let mut history = EntityHistory::new(4);
        let first = history.push(EntityState::with_number(1));
        for n in 2..=4 {
            history.push(EntityState::with_number(n));
        }
        assert_eq!(history.get(first).map(|e| e.number), Ok(1));

        history.push(EntityState::with_number(5));
        assert_eq!(
            history.get(first),
            Err(HistoryError::Overwritten { index: 0, oldest: 1 })
        );
        assert!(!history.is_retained(first));
    }

    #[test]
    fn retention_horizon_is_strict() {
        let mut history = EntityHistory::new(4);
        let first = history.push(EntityState::with_number(1));
        for n in 2..=3 {
            history.push(EntityState::with_number(n));
        }
        assert!(history.is_retained(first));

        // first == next - capacity: still stored, no longer a delta source
        history.push(EntityState::with_number(4));
        assert_eq!(history.get(first).map(|e| e.number), Ok(1));
        assert!(!history.is_retained(first));
        assert!(history.is_retained(first.offset(1)));
    }

    #[test]
    fn unwritten_reads_are_errors() {
        let history = EntityHistory::new(4);
        assert_eq!(
            history.get(history.next_index()),
            Err(HistoryError::NotWritten { index: 0, next: 0 })
        );
    }

    #[test]
    fn range_wraps_around_the_ring() {
        let mut history = EntityHistory::new(4);
        for n in 0..3 {
            history.push(EntityState::with_number(n));
        }
        let first = history.next_index();
        for n in 10..13 {
            history.push(EntityState::with_number(n));
        }
        let numbers: Vec<i32> = history.range(first, 3).unwrap().map(|e| e.number).collect();
        assert_eq!(numbers, vec![10, 11, 12]);
        assert!(history.range(HistoryIndex::default(), 3).is_err());
    }

    #[test]
    fn empty_range_at_next_is_valid() {
        let history = EntityHistory::new(4);
        assert_eq!(history.range(history.next_index(), 0).unwrap().count(), 0);
    }

    #[test]
    fn reset_makes_old_indices_stale() {
        let mut history = EntityHistory::new(4);
        let idx = history.push(EntityState::with_number(7));
        history.reset();
        history.push(EntityState::with_number(8));
        assert_eq!(
            history.get(idx),
            Err(HistoryError::StaleEpoch { epoch: 0, current: 1 })
        );
        assert!(!history.is_retained(idx));
    }

    #[test]
    #[should_panic(expected = "wrapped")]
    fn counter_limit_is_fatal() {
        let mut history = EntityHistory::with_limit(4, 3);
        for n in 0..3 {
            history.push(EntityState::with_number(n));
        }
    }
}
