use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::TimePoint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("group_count must be at least 1")]
    EmptyGroup,
    #[error("a tracking batch is already in flight")]
    BatchInFlight,
    #[error("no tracking batch in flight to commit")]
    NothingInFlight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    BatchInFlight,
    Advanced,
}

/// One tracking invocation: read-only context followed by the snapshots to track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackingBatch<P> {
    pub index: usize,
    pub context: Vec<(TimePoint, P)>,
    pub group: Vec<(TimePoint, P)>,
}

impl<P: Clone> TrackingBatch<P> {
    /// Context first, then the group, all in time order.
    pub fn inputs(&self) -> Vec<P> {
        self.context.iter().chain(self.group.iter()).map(|(_, p)| p.clone()).collect()
    }

    pub fn span(&self) -> Option<(TimePoint, TimePoint)> {
        Some((self.group.first()?.0, self.group.last()?.0))
    }
}

/// Sliding window over tracked snapshots.
///
/// Untracked snapshots are consumed in time order, `group_count` at a time. Each batch
/// carries the last `overlap_count` snapshots of the cumulative tracked set as context
/// so identities continue across batches. A committed group becomes part of the tracked
/// set and is never handed out again.
#[derive(Debug)]
pub struct TrackingWindow<P> {
    overlap_count: usize,
    group_count: usize,
    tracked: Vec<(TimePoint, P)>,
    pending: VecDeque<(TimePoint, P)>,
    in_flight: Option<Vec<(TimePoint, P)>>,
    batches: usize,
    state: WindowState,
}

impl<P: Clone> TrackingWindow<P> {
    pub fn new(
        overlap_count: usize,
        group_count: usize,
        tracked: impl IntoIterator<Item = (TimePoint, P)>,
        untracked: impl IntoIterator<Item = (TimePoint, P)>,
    ) -> Result<Self, WindowError> {
        if group_count == 0 {
            return Err(WindowError::EmptyGroup);
        }
        let mut tracked: Vec<_> = tracked.into_iter().collect();
        tracked.sort_by_key(|(t, _)| *t);
        let mut pending: Vec<_> = untracked.into_iter().collect();
        pending.sort_by_key(|(t, _)| *t);

        Ok(Self {
            overlap_count,
            group_count,
            tracked,
            pending: pending.into(),
            in_flight: None,
            batches: 0,
            state: WindowState::Idle,
        })
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn tracked(&self) -> &[(TimePoint, P)] {
        &self.tracked
    }

    /// Hand out the next batch, or `None` once every untracked snapshot is committed.
    pub fn next_batch(&mut self) -> Result<Option<TrackingBatch<P>>, WindowError> {
        if self.in_flight.is_some() {
            return Err(WindowError::BatchInFlight);
        }
        if self.pending.is_empty() {
            return Ok(None);
        }

        let take = self.group_count.min(self.pending.len());
        let group: Vec<_> = self.pending.drain(..take).collect();
        let skip = self.tracked.len().saturating_sub(self.overlap_count);
        let context = self.tracked[skip..].to_vec();

        self.in_flight = Some(group.clone());
        self.state = WindowState::BatchInFlight;
        let index = self.batches;
        self.batches += 1;

        Ok(Some(TrackingBatch { index, context, group }))
    }

    /// Append the in-flight group to the tracked set.
    pub fn commit(&mut self) -> Result<(), WindowError> {
        let group = self.in_flight.take().ok_or(WindowError::NothingInFlight)?;
        self.tracked.extend(group);
        self.state = WindowState::Advanced;
        Ok(())
    }

    pub fn into_tracked(self) -> BTreeMap<TimePoint, P> {
        self.tracked.into_iter().collect()
    }
}
