use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metriken::{Metric, Value};

/// Number of shards per group. Threads are assigned shards round-robin,
/// so contention only appears beyond this many concurrent writers.
const SHARDS: usize = 64;

/// Counter slots per shard. One shard spans two cache lines.
pub(crate) const SLOTS: usize = 16;

#[repr(align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

impl Shard {
    const fn new() -> Self {
        Shard {
            slots: [const { AtomicU64::new(0) }; SLOTS],
        }
    }
}

/// Sharded storage for a group of up to 16 counters.
///
/// A group is just storage; individual [`Counter`]s name a slot within it.
/// Grouping related counters amortizes the per-shard footprint.
pub struct CounterGroup {
    shards: [Shard; SHARDS],
}

impl CounterGroup {
    pub const fn new() -> Self {
        CounterGroup {
            shards: [const { Shard::new() }; SHARDS],
        }
    }

    #[inline]
    fn shard(&self) -> &Shard {
        &self.shards[thread_shard()]
    }

    fn sum(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

#[inline]
fn thread_shard() -> usize {
    THREAD_SHARD.with(|s| *s)
}

/// A monotonic counter referencing one slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Create a counter for `slot` of `group`. Out-of-range slots panic on
    /// first use.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Counter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.group.shard().slots[self.slot].fetch_add(n, Ordering::Relaxed);
    }

    /// Sum across all shards. Not a hot-path operation.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }
}

impl Metric for Counter {
    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }

    fn value(&self) -> Option<Value<'_>> {
        Some(Value::Counter(self.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GROUP: CounterGroup = CounterGroup::new();
    static A: Counter = Counter::new(&GROUP, 0);
    static B: Counter = Counter::new(&GROUP, 1);

    #[test]
    fn test_increment_and_sum() {
        A.increment();
        A.add(4);
        assert_eq!(A.value(), 5);
        assert_eq!(B.value(), 0);
    }

    #[test]
    fn test_cross_thread_sum() {
        static GROUP: CounterGroup = CounterGroup::new();
        static C: Counter = Counter::new(&GROUP, 0);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..1000 {
                        C.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(C.value(), 4000);
    }
}
