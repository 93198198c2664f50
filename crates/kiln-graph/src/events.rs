//! Execution events and notifiers.
//!
//! The scheduler and the engine emit events as requests run, nodes complete
//! and sources change. Consumers decide what to do with them: log them, lease
//! the digests a value references, stream them somewhere else.

use std::time::Duration;

use kiln_rules::Value;
use tokio::sync::mpsc;

/// Events emitted while requests execute.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
  /// A top-level request has started.
  RequestStarted { request_id: String, query: String },

  /// A top-level request produced a value.
  RequestCompleted {
    request_id: String,
    elapsed: Duration,
  },

  /// A top-level request failed.
  RequestFailed { request_id: String, error: String },

  /// A node has started running its rule.
  NodeStarted { node: String },

  /// A node has completed successfully and memoized `value`.
  NodeCompleted {
    node: String,
    value: Value,
    elapsed: Duration,
  },

  /// A node has failed and memoized the failure.
  NodeFailed { node: String, error: String },

  /// A memoized node was invalidated. `value` is the result it held.
  NodeCleared { node: String, value: Option<Value> },

  /// A subprocess finished, or a cached result was used in its place.
  ProcessFinished {
    description: String,
    source: String,
    exit_code: i32,
    elapsed: Duration,
  },

  /// A batch of source changes was applied.
  InvalidationApplied { files: usize, nodes: usize },
}

/// Receives execution events.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Sends events to an unbounded channel so they can be consumed
/// asynchronously without slowing the scheduler down.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // The receiver may have been dropped.
    let _ = self.sender.send(event);
  }
}

/// Fans events out to several notifiers in order.
#[derive(Default)]
pub struct CompositeNotifier {
  notifiers: Vec<std::sync::Arc<dyn ExecutionNotifier>>,
}

impl CompositeNotifier {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, notifier: std::sync::Arc<dyn ExecutionNotifier>) -> Self {
    self.notifiers.push(notifier);
    self
  }
}

impl ExecutionNotifier for CompositeNotifier {
  fn notify(&self, event: ExecutionEvent) {
    if let Some((last, rest)) = self.notifiers.split_last() {
      for notifier in rest {
        notifier.notify(event.clone());
      }
      last.notify(event);
    }
  }
}
