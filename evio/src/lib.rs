//! Single-threaded I/O reactor and the TCP layer built on top of it.
//!
//! One [`EventLoop`] owns one [`Poller`] and runs on exactly one OS thread.
//! Every [`Channel`], [`TcpConnection`], [`Acceptor`] and [`TcpServer`]
//! belongs to a loop and is only mutated from that loop's thread; other
//! threads hand work over through the loop's task queue, which rouses the
//! poller via an eventfd.
//!
//! The blocking points are exactly two: the poller's wait, and nothing else.
//! Connection handlers run cooperatively on the loop thread and must not
//! block.

pub mod acceptor;
pub mod addr;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod poller;
pub mod server;
pub mod socket;

pub use acceptor::Acceptor;
pub use addr::Address;
pub use buffer::Buffer;
pub use channel::{Channel, Ready};
pub use connection::{ConnState, TcpConnection};
pub use event_loop::{EventLoop, LoopHandle, TimerId};
pub use poller::Poller;
pub use server::TcpServer;
pub use socket::Socket;
