use std::collections::BTreeMap;

use chrono::Duration;

use crate::TimePoint;

/// Outcome of the lifespan gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Retention<T> {
    pub finalizable: BTreeMap<TimePoint, T>,
    pub deferred: BTreeMap<TimePoint, T>,
}

/// Pure lifespan gate.
///
/// A snapshot is finalizable iff `t < end - min_lifespan` (strict); anything at or after
/// the cutoff is deferred and seeds the next incremental run.
pub fn partition_by_lifespan<T>(
    tracked: BTreeMap<TimePoint, T>,
    end: TimePoint,
    min_lifespan: Duration,
) -> Retention<T> {
    let cutoff = end.checked_sub(min_lifespan);
    let mut finalizable = BTreeMap::new();
    let mut deferred = BTreeMap::new();
    for (t, snapshot) in tracked {
        match cutoff {
            Some(c) if t < c => {
                finalizable.insert(t, snapshot);
            }
            _ => {
                deferred.insert(t, snapshot);
            }
        }
    }
    Retention { finalizable, deferred }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_is_deferred() {
        let end = TimePoint::parse_iso("2020-01-10T00:00:00").unwrap();
        let d = Duration::days(3);
        let cutoff = end.checked_sub(d).unwrap();
        let tracked: BTreeMap<_, _> = [
            (cutoff.checked_sub(Duration::seconds(1)).unwrap(), "before"),
            (cutoff, "at"),
            (cutoff.checked_add(Duration::seconds(1)).unwrap(), "after"),
        ]
        .into_iter()
        .collect();

        let r = partition_by_lifespan(tracked, end, d);
        assert_eq!(r.finalizable.values().copied().collect::<Vec<_>>(), vec!["before"]);
        assert_eq!(r.deferred.values().copied().collect::<Vec<_>>(), vec!["at", "after"]);
    }

    #[test]
    fn zero_lifespan_finalizes_everything_before_end() {
        let end = TimePoint::parse_iso("2020-01-10T00:00:00").unwrap();
        let early = TimePoint::parse_iso("2020-01-01T00:00:00").unwrap();
        let r = partition_by_lifespan(BTreeMap::from([(early, 1), (end, 2)]), end, Duration::zero());
        assert_eq!(r.finalizable.len(), 1);
        assert_eq!(r.deferred.len(), 1);
    }
}
