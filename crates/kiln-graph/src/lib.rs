//! Kiln Graph
//!
//! The dynamic half of the engine. Every request for a type, given some
//! params, becomes a node keyed by the rule that satisfies it and the params
//! that rule actually uses. Nodes are memoized, shared between concurrent
//! requesters, cancelled when nobody wants them any more, and invalidated
//! when the sources they read change.

mod context;
mod events;
mod failure;
mod graph;
mod node;
mod scheduler;

pub use context::Context;
pub use events::{ChannelNotifier, CompositeNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use failure::{Cause, ErrorSource, Failure, Frame};
pub use node::{NodeKey, NodeState, SessionId};
pub use scheduler::{RuleFn, RuleFuture, Scheduler, SchedulerConfig, rule};
