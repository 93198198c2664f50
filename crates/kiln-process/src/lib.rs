//! Kiln Process
//!
//! Runs the side-effecting leaves of the graph: subprocesses described by a
//! [`ProcessRequest`]. Runners are layered:
//!
//! - [`CachingRunner`] answers from the action cache when it can
//! - [`BoundedRunner`] limits concurrency
//! - [`RemoteRunner`] dispatches to a remote executor, falling back to local
//! - [`LocalRunner`] runs the process in a fresh sandbox directory

mod caching;
mod error;
mod local;
mod named_caches;
mod remote;
mod request;
mod result;
mod runner;

pub use caching::CachingRunner;
pub use error::ProcessError;
pub use local::LocalRunner;
pub use named_caches::{CacheLease, NamedCaches};
pub use remote::{RemoteExecutor, RemoteRunner, RetryPolicy};
pub use request::{CacheScope, ExecutionMode, ProcessRequest};
pub use result::{FallibleProcessResult, ProcessResultMetadata, ResultSource};
pub use runner::{BoundedRunner, CommandRunner, RunContext};
