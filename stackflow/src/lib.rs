//! Typed event bus with a workflow engine.
//!
//! A [`StackFlow`] owns a bounded event queue drained by one worker thread.
//! Handlers registered per [`EventKind`] run on that thread in registration
//! order; after the handlers, every registered workflow is offered the
//! event, and its root step decides whether anything runs.
//!
//! Events are not durable: stopping the flow drops whatever is still
//! queued. A handler that blocks stalls every event behind it; that is the
//! contract, not an accident.

pub mod event;
pub mod flow;
pub mod handler;
pub mod workflow;

pub use event::{Event, EventKind};
pub use flow::{PublishError, StackFlow};
pub use handler::{EventHandler, FnHandler};
pub use workflow::{StepKind, StepStatus, WorkflowStep};
