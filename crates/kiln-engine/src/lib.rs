//! Kiln Engine
//!
//! The request API of kiln. An [`Engine`] owns the content store, the
//! process runner stack and the scheduler, and serves typed requests:
//!
//! ```text
//! execute::<T>(params)
//!   └─ Scheduler::request        rule graph resolution, memoized nodes
//!        └─ rule bodies          user rules and the intrinsics below
//!             └─ CachingRunner   local + remote action cache
//!                  └─ BoundedRunner
//!                       └─ RemoteRunner (optional) ─ LocalRunner
//! ```
//!
//! Intrinsic rules every engine registers:
//!
//! | Input | Output |
//! |---|---|
//! | `ProcessRequest` | `FallibleProcessResult` |
//! | `ProcessRequest` | [`ProcessResult`] (non-zero exit fails) |
//! | [`SourceFile`] | [`FileContent`] |
//! | [`PathSnapshotRequest`] | [`Snapshot`] |
//! | [`EnvironmentVarsRequest`] | [`EnvironmentVars`] |
//!
//! Source reads are tracked, so [`Engine::invalidate`] and [`Engine::watch`]
//! recompute exactly the nodes whose sources changed.

mod engine;
mod error;
mod intrinsics;
mod leases;

pub use engine::{Engine, EngineBuilder, WatchHandle};
pub use error::EngineError;
pub use intrinsics::{
  EnvironmentVars, EnvironmentVarsRequest, FileContent, PathSnapshotRequest, ProcessResult,
  Snapshot, SourceFile,
};
