//! Host metrics.

use metrics::{Counter, CounterGroup};
use metriken::{Gauge, metric};

// Counter groups (sharded storage)
static CONNECTION: CounterGroup = CounterGroup::new();
static FRAME: CounterGroup = CounterGroup::new();
static EVENT: CounterGroup = CounterGroup::new();
static ROUTE: CounterGroup = CounterGroup::new();

/// Counter slot indices for connection metrics.
pub mod connection {
    pub const ACCEPTED: usize = 0;
    pub const CLOSED: usize = 1;
}

/// Counter slot indices for frame metrics.
pub mod frame {
    pub const DECODED: usize = 0;
    pub const PROTOCOL_ERRORS: usize = 1;
}

/// Counter slot indices for event metrics.
pub mod event {
    pub const PUBLISHED: usize = 0;
    pub const DROPPED: usize = 1;
}

/// Counter slot indices for routing metrics.
pub mod route {
    pub const ERRORS: usize = 0;
}

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(&CONNECTION, connection::ACCEPTED);

#[metric(
    name = "connections_closed",
    description = "Total number of connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new(&CONNECTION, connection::CLOSED);

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "frames_decoded", description = "Valid frames decoded")]
pub static FRAMES_DECODED: Counter = Counter::new(&FRAME, frame::DECODED);

#[metric(
    name = "protocol_errors",
    description = "Frames dropped for bad magic, version, size, or checksum"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new(&FRAME, frame::PROTOCOL_ERRORS);

#[metric(name = "events_published", description = "Events published to the flow")]
pub static EVENTS_PUBLISHED: Counter = Counter::new(&EVENT, event::PUBLISHED);

#[metric(
    name = "events_dropped",
    description = "Events rejected because the flow queue was full"
)]
pub static EVENTS_DROPPED: Counter = Counter::new(&EVENT, event::DROPPED);

#[metric(
    name = "routing_errors",
    description = "Messages that could not be routed to a channel"
)]
pub static ROUTING_ERRORS: Counter = Counter::new(&ROUTE, route::ERRORS);
