//! Topic-routed message bus.
//!
//! A [`Channel`] is a named transport endpoint; the [`ChannelManager`]
//! resolves topics to ordered lists of channels and fans messages out.
//! Filters are composable predicates applied before transmission; every
//! filter on a channel must accept a message for it to go out.
//!
//! The in-process transport ([`InProcChannel`]) mirrors the brokered
//! transports it stands in for: its receive side runs on a dedicated
//! thread, and the message callback is invoked on that thread.

pub mod channel;
pub mod filter;
pub mod manager;
pub mod message;

pub use channel::{Channel, ChannelCore, ChannelKind, InProcChannel};
pub use filter::{MessageFilter, SenderFilter, TopicFilter};
pub use manager::ChannelManager;
pub use message::{BusMessage, Priority};
