//! Sharded metrics with metriken integration.
//!
//! [`Counter`] and [`CounterGroup`] provide hot-path counters that avoid
//! cache-line contention: a group holds per-thread shards, and each thread
//! increments its own shard. Reads sum across shards and are intended for
//! the (cold) exposition path.
//!
//! A [`Counter`] references one slot of a group and implements
//! [`metriken::Metric`], so it can be registered with the `#[metric]`
//! attribute alongside plain metriken gauges.
//!
//! # Example
//!
//! ```
//! use metrics::{Counter, CounterGroup};
//!
//! mod slots {
//!     pub const PUBLISHED: usize = 0;
//!     pub const DROPPED: usize = 1;
//! }
//!
//! static EVENTS: CounterGroup = CounterGroup::new();
//!
//! static EVENTS_PUBLISHED: Counter = Counter::new(&EVENTS, slots::PUBLISHED);
//! static EVENTS_DROPPED: Counter = Counter::new(&EVENTS, slots::DROPPED);
//!
//! EVENTS_PUBLISHED.increment();
//! EVENTS_DROPPED.add(2);
//! assert_eq!(EVENTS_PUBLISHED.value(), 1);
//! ```

mod counter;

pub use counter::{Counter, CounterGroup};

// Re-export metriken for consumers that register metrics.
pub use metriken;
