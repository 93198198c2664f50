use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_rules::{AnyValue, Params, Query, Rule, RuleGraph, RuleId, RuleSet, TypeKey, Value};
use kiln_watch::{ChangeSet, Invalidatable, LineRange};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::NodeFrame;
use crate::graph::{Completion, Graph, Lookup, Outcome, OutcomeReceiver, RunState};
use crate::node::EntryId;
use crate::{
  Cause, Context, ExecutionEvent, ExecutionNotifier, Failure, Frame, NodeKey, NodeState,
  SessionId,
};

pub type RuleFuture = BoxFuture<'static, Result<Value, Failure>>;

/// The body of a rule as the scheduler runs it.
pub type RuleFn = Arc<dyn Fn(Context) -> RuleFuture + Send + Sync>;

/// Build a rule producing `Out` from an async body.
///
/// ```ignore
/// let rule = kiln_graph::rule::<Greeting, _, _>("greet", |ctx| async move {
///   let name = ctx.input::<Name>()?;
///   Ok(Greeting(format!("hello {}", name.0)))
/// })
/// .input(TypeKey::of::<Name>());
/// ```
pub fn rule<Out, F, Fut>(id: impl Into<RuleId>, body: F) -> Rule<RuleFn>
where
  Out: AnyValue,
  F: Fn(Context) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Out, Failure>> + Send + 'static,
{
  let body: RuleFn = Arc::new(move |ctx| body(ctx).map(|result| result.map(Value::new)).boxed());
  Rule::new(id, TypeKey::of::<Out>(), body)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// How many times a node reruns because something it read was invalidated
  /// mid-run before it gives up.
  pub max_invalidation_retries: usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_invalidation_retries: 8,
    }
  }
}

struct Shared {
  rules: RuleGraph<RuleFn>,
  graph: Graph,
  notifier: Arc<dyn ExecutionNotifier>,
  config: SchedulerConfig,
  sessions: AtomicU64,
}

/// Runs requests against a rule set, memoizing every node.
///
/// Each distinct node runs at most once at a time no matter how many
/// requesters want it. A run whose requesters all go away is cancelled.
#[derive(Clone)]
pub struct Scheduler {
  inner: Arc<Shared>,
}

impl Scheduler {
  pub fn new(
    rules: RuleSet<RuleFn>,
    config: SchedulerConfig,
    notifier: Arc<dyn ExecutionNotifier>,
  ) -> Self {
    Self {
      inner: Arc::new(Shared {
        rules: RuleGraph::new(rules),
        graph: Graph::default(),
        notifier,
        config,
        sessions: AtomicU64::new(0),
      }),
    }
  }

  pub fn rule_graph(&self) -> &RuleGraph<RuleFn> {
    &self.inner.rules
  }

  pub fn new_session(&self) -> SessionId {
    SessionId(self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1)
  }

  /// Compute `output` from `params`.
  ///
  /// The request is resolved against the rule graph before anything runs, so
  /// an unsatisfiable request fails without side effects.
  #[instrument(name = "scheduler_request", skip(self, params), fields(params = %params))]
  pub async fn request(
    &self,
    output: TypeKey,
    params: Params,
    session: SessionId,
  ) -> Result<Value, Failure> {
    self
      .inner
      .rules
      .resolve(&Query::new(output, params.type_set()))?;
    let root = Context::root(self.clone(), params.clone(), session);
    root.fetch(output, params, None).await
  }

  /// Invalidate every node whose key matches `predicate`, and everything that
  /// depends on them.
  pub fn invalidate_matching(&self, predicate: impl Fn(&NodeKey) -> bool) -> usize {
    let (count, events) = self.inner.graph.invalidate_matching(predicate);
    self.publish_invalidation(0, count, events)
  }

  pub fn invalidate_all(&self) -> usize {
    self.invalidate_matching(|_| true)
  }

  pub fn state(&self, node: &NodeKey) -> Option<NodeState> {
    self.inner.graph.state(node)
  }

  /// Number of distinct nodes ever requested.
  pub fn node_count(&self) -> usize {
    self.inner.graph.len()
  }

  pub(crate) fn declare_source(&self, id: EntryId, path: &Path, lines: Option<LineRange>) {
    self.inner.graph.declare_source(id, path, lines);
  }

  pub(crate) fn notify(&self, event: ExecutionEvent) {
    self.inner.notifier.notify(event);
  }

  pub(crate) async fn get_node(
    &self,
    parent: Option<(EntryId, &RunState)>,
    node: NodeKey,
    session: SessionId,
    detach: Option<Arc<AtomicBool>>,
  ) -> Result<Value, Failure> {
    let (id, lookup) = self
      .inner
      .graph
      .lookup(&node, parent.map(|(id, _)| id), session);

    let outcome = match lookup {
      Lookup::Ready(outcome) => outcome,
      Lookup::Wait { receiver, run_id } => {
        Waiter::new(self.clone(), id, run_id, detach)
          .wait(receiver)
          .await?
      }
      Lookup::Start {
        receiver,
        run_id,
        cancel,
        cleared,
      } => {
        if cleared.is_some() {
          self.notify(ExecutionEvent::NodeCleared {
            node: node.to_string(),
            value: cleared,
          });
        }
        let waiter = Waiter::new(self.clone(), id, run_id, detach);
        tokio::spawn(self.clone().drive(id, node, session, run_id, cancel));
        waiter.wait(receiver).await?
      }
    };

    if let Some((_, run)) = parent {
      run.record(id, &outcome);
    }
    outcome.result
  }

  async fn drive(
    self,
    id: EntryId,
    node: NodeKey,
    session: SessionId,
    run_id: u64,
    cancel: CancellationToken,
  ) {
    let side_effecting = self
      .inner
      .rules
      .rule(&node.rule)
      .is_some_and(|rule| rule.side_effecting);
    let mut attempts = 0;

    loop {
      let started = Instant::now();
      debug!(node = %node, attempts, "node started");
      self.notify(ExecutionEvent::NodeStarted {
        node: node.to_string(),
      });

      let run = Arc::new(RunState::default());
      let body = AssertUnwindSafe(self.run_node(id, &node, session, run.clone())).catch_unwind();
      let result = tokio::select! {
        _ = cancel.cancelled() => {
          debug!(node = %node, "node cancelled");
          return;
        }
        result = body => result.unwrap_or_else(|_| {
          Err(Failure::msg(format!("rule {} panicked", node.rule)))
        }),
      };
      let result = result.map_err(|failure| failure.with_frame(Frame::of(&node)));

      let completion = self.inner.graph.complete(
        id,
        run_id,
        result,
        &run,
        session,
        side_effecting,
        attempts,
        self.inner.config.max_invalidation_retries,
      );
      match completion {
        Completion::Done(outcome) => {
          let elapsed = started.elapsed();
          let event = match outcome.result {
            Ok(value) => {
              debug!(node = %node, elapsed_ms = elapsed.as_millis() as u64, "node completed");
              ExecutionEvent::NodeCompleted {
                node: node.to_string(),
                value,
                elapsed,
              }
            }
            Err(failure) => {
              debug!(node = %node, error = %failure.cause(), "node failed");
              ExecutionEvent::NodeFailed {
                node: node.to_string(),
                error: failure.to_string(),
              }
            }
          };
          self.notify(event);
          return;
        }
        Completion::Retry => {
          attempts += 1;
          warn!(node = %node, attempts, "node invalidated while running, retrying");
        }
        Completion::Abandoned => return,
      }
    }
  }

  async fn run_node(
    &self,
    id: EntryId,
    node: &NodeKey,
    session: SessionId,
    run: Arc<RunState>,
  ) -> Result<Value, Failure> {
    let rule = self
      .inner
      .rules
      .rule(&node.rule)
      .cloned()
      .ok_or_else(|| Failure::msg(format!("unknown rule {}", node.rule)))?;
    if rule.side_effecting {
      run.mark_scoped();
    }

    let frame = Arc::new(NodeFrame {
      id,
      node: node.clone(),
      rule: rule.clone(),
      run,
    });
    let ctx = Context::for_node(self.clone(), frame, session);
    let inputs = futures::future::try_join_all(
      rule
        .inputs
        .iter()
        .map(|input| ctx.fetch(*input, node.params.clone(), None)),
    )
    .await?;

    let value = (rule.body)(ctx.with_inputs(inputs)).await?;
    if value.type_key() != rule.output {
      return Err(Failure::new(Cause::TypeMismatch {
        expected: rule.output,
        actual: value.type_key(),
      }));
    }
    Ok(value)
  }

  fn publish_invalidation(
    &self,
    files: usize,
    nodes: usize,
    events: Vec<ExecutionEvent>,
  ) -> usize {
    for event in events {
      self.notify(event);
    }
    if nodes > 0 {
      info!(files, nodes, "nodes invalidated");
      self.notify(ExecutionEvent::InvalidationApplied { files, nodes });
    }
    nodes
  }
}

impl Invalidatable for Scheduler {
  fn invalidate(&self, changes: &ChangeSet) -> usize {
    let (count, events) = self.inner.graph.invalidate_changes(changes);
    self.publish_invalidation(changes.len(), count, events)
  }
}

/// One requester waiting on a run. Dropping it before the run finishes
/// withdraws the requester, and the last one out cancels the run.
struct Waiter {
  scheduler: Scheduler,
  id: EntryId,
  run_id: u64,
  detach: Option<Arc<AtomicBool>>,
  armed: bool,
}

impl Waiter {
  fn new(scheduler: Scheduler, id: EntryId, run_id: u64, detach: Option<Arc<AtomicBool>>) -> Self {
    Self {
      scheduler,
      id,
      run_id,
      detach,
      armed: true,
    }
  }

  async fn wait(mut self, mut receiver: OutcomeReceiver) -> Result<Outcome, Failure> {
    let outcome = receiver
      .wait_for(Option::is_some)
      .await
      .map(|outcome| (*outcome).clone());
    self.armed = false;
    match outcome {
      Ok(Some(outcome)) => Ok(outcome),
      _ => Err(Failure::cancelled()),
    }
  }
}

impl Drop for Waiter {
  fn drop(&mut self) {
    let detached = self
      .detach
      .as_ref()
      .is_some_and(|detach| detach.load(Ordering::SeqCst));
    if !self.armed || detached {
      return;
    }
    if self.scheduler.inner.graph.release(self.id, self.run_id) {
      debug!(run_id = self.run_id, "last requester gone, run cancelled");
    }
  }
}
