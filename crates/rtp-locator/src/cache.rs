use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use rtp_core::TimePoint;

/// Memo key: a time point plus the selection parameters used to render the pattern.
pub type SelectionKey = (TimePoint, BTreeMap<String, String>);

/// Memoized selections, including negative ones. Unbounded unless a capacity is set,
/// in which case the oldest insertion is evicted first.
#[derive(Debug, Default)]
pub struct SelectionCache {
    capacity: Option<usize>,
    entries: BTreeMap<SelectionKey, Option<PathBuf>>,
    order: VecDeque<SelectionKey>,
}

impl SelectionCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self { capacity, ..Self::default() }
    }

    pub fn get(&self, key: &SelectionKey) -> Option<&Option<PathBuf>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: SelectionKey, selected: Option<PathBuf>) {
        if self.capacity == Some(0) {
            return;
        }
        if self.entries.insert(key.clone(), selected).is_none() {
            self.order.push_back(key);
        }
        while self.capacity.is_some_and(|cap| self.entries.len() > cap) {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
