//! Edge-side service-hosting platform.
//!
//! Multiplexes framed client traffic over a single-threaded reactor,
//! surfaces it as typed events on a flow engine, and routes payloads to
//! internal services through a topic-addressed message bus.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod signal;

pub use config::Config;
pub use service::EdgeHost;
