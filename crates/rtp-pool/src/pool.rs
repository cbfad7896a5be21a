use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;

#[derive(Debug, PartialEq, Eq)]
pub enum ItemFailure<E> {
    Failed(E),
    Panicked(String),
}

impl<E: fmt::Display> fmt::Display for ItemFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemFailure::Failed(e) => write!(f, "{e}"),
            ItemFailure::Panicked(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

/// Partial success of one stage: every input key lands in exactly one of the two maps.
#[derive(Debug)]
pub struct ParallelOutcome<K, O, E> {
    pub results: BTreeMap<K, O>,
    pub failures: BTreeMap<K, ItemFailure<E>>,
}

/// Fans independent per-key work out over a fixed number of worker threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundedParallelMap {
    workers: usize,
}

impl BoundedParallelMap {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }

    pub fn from_available_parallelism() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Apply `op` to every item. Never fails as a whole: errors and panics are confined to their key.
    pub fn run<K, I, O, E, F>(&self, stage: &str, items: BTreeMap<K, I>, op: F) -> ParallelOutcome<K, O, E>
    where
        K: Ord + Send + fmt::Display,
        I: Send,
        O: Send,
        E: Send + fmt::Display,
        F: Fn(&K, I) -> Result<O, E> + Sync,
    {
        let submitted = items.len();
        let attempted: Vec<(K, Result<O, ItemFailure<E>>)> =
            match rayon::ThreadPoolBuilder::new().num_threads(self.workers).build() {
                Ok(pool) => pool.install(|| {
                    items
                        .into_par_iter()
                        .map(|(k, item)| {
                            let r = attempt(&op, &k, item);
                            (k, r)
                        })
                        .collect()
                }),
                Err(e) => {
                    tracing::warn!(stage, error = %e, "could not build worker pool; running on the driver thread");
                    items
                        .into_iter()
                        .map(|(k, item)| {
                            let r = attempt(&op, &k, item);
                            (k, r)
                        })
                        .collect()
                }
            };

        let mut outcome = ParallelOutcome { results: BTreeMap::new(), failures: BTreeMap::new() };
        for (k, r) in attempted {
            match r {
                Ok(o) => {
                    outcome.results.insert(k, o);
                }
                Err(failure) => {
                    tracing::warn!(stage, key = %k, error = %failure, "item failed");
                    outcome.failures.insert(k, failure);
                }
            }
        }
        tracing::info!(
            stage,
            submitted,
            succeeded = outcome.results.len(),
            failed = outcome.failures.len(),
            workers = self.workers,
            "stage complete"
        );
        outcome
    }
}

impl Default for BoundedParallelMap {
    fn default() -> Self {
        Self::from_available_parallelism()
    }
}

fn attempt<K, I, O, E, F>(op: &F, k: &K, item: I) -> Result<O, ItemFailure<E>>
where
    F: Fn(&K, I) -> Result<O, E>,
{
    match catch_unwind(AssertUnwindSafe(|| op(k, item))) {
        Ok(Ok(o)) => Ok(o),
        Ok(Err(e)) => Err(ItemFailure::Failed(e)),
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(ItemFailure::Panicked(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn one_failure_is_isolated() {
        let items: BTreeMap<u32, u32> = (0..10).map(|k| (k, k * 10)).collect();
        let out = BoundedParallelMap::new(3).run("square", items, |k, v| if *k == 4 { Err(format!("bad {k}")) } else { Ok(v + 1) });
        assert_eq!(out.results.len(), 9);
        assert!(!out.results.contains_key(&4));
        assert_eq!(out.failures.keys().copied().collect::<Vec<_>>(), vec![4]);
        assert_eq!(out.failures[&4], ItemFailure::Failed("bad 4".to_string()));
        assert_eq!(out.results[&9], 91);
    }

    #[test]
    fn panics_are_isolated() {
        let items: BTreeMap<u32, ()> = (0..4).map(|k| (k, ())).collect();
        let out = BoundedParallelMap::new(2).run("panicky", items, |k, _| -> Result<u32, String> {
            if *k == 2 {
                panic!("worker blew up");
            }
            Ok(*k)
        });
        assert_eq!(out.results.len(), 3);
        assert_eq!(out.failures[&2], ItemFailure::Panicked("worker blew up".to_string()));
    }

    #[test]
    fn concurrency_is_bounded() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: BTreeMap<u32, ()> = (0..16).map(|k| (k, ())).collect();
        let out = BoundedParallelMap::new(2).run("bounded", items, |_, _| -> Result<(), String> {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(out.results.len(), 16);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn empty_input_and_zero_workers() {
        let pool = BoundedParallelMap::new(0);
        assert_eq!(pool.workers(), 1);
        let out = pool.run("empty", BTreeMap::<u32, ()>::new(), |_, _| Ok::<_, String>(()));
        assert!(out.results.is_empty() && out.failures.is_empty());
    }
}
