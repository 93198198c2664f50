use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use kiln_rules::{AnyValue, DependencyKey, Params, Query, ResolveError, Rule, Selection, TypeKey, Value};
use kiln_watch::LineRange;

use crate::graph::RunState;
use crate::node::EntryId;
use crate::{Cause, ExecutionEvent, Failure, NodeKey, RuleFn, Scheduler, SessionId};

/// The node a context belongs to.
pub(crate) struct NodeFrame {
  pub id: EntryId,
  pub node: NodeKey,
  pub rule: Arc<Rule<RuleFn>>,
  pub run: Arc<RunState>,
}

/// What a rule body sees while it runs: its params, its inputs, and the
/// ability to request further values.
///
/// Every value requested through a context is recorded as a dependency of the
/// running node, so invalidating it invalidates the node too.
#[derive(Clone)]
pub struct Context {
  scheduler: Scheduler,
  frame: Option<Arc<NodeFrame>>,
  params: Params,
  inputs: Arc<Vec<Value>>,
  session: SessionId,
}

impl Context {
  pub(crate) fn root(scheduler: Scheduler, params: Params, session: SessionId) -> Self {
    Self {
      scheduler,
      frame: None,
      params,
      inputs: Arc::new(Vec::new()),
      session,
    }
  }

  pub(crate) fn for_node(
    scheduler: Scheduler,
    frame: Arc<NodeFrame>,
    session: SessionId,
  ) -> Self {
    Self {
      scheduler,
      params: frame.node.params.clone(),
      frame: Some(frame),
      inputs: Arc::new(Vec::new()),
      session,
    }
  }

  pub(crate) fn with_inputs(mut self, inputs: Vec<Value>) -> Self {
    self.inputs = Arc::new(inputs);
    self
  }

  pub fn params(&self) -> &Params {
    &self.params
  }

  pub fn session(&self) -> SessionId {
    self.session
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.scheduler
  }

  /// The declared input of type `T`.
  pub fn input<T: Any + Send + Sync>(&self) -> Result<Arc<T>, Failure> {
    self
      .inputs
      .iter()
      .find_map(|value| value.downcast::<T>())
      .ok_or_else(|| {
        Failure::msg(format!(
          "no input of type {} in {}",
          TypeKey::of::<T>(),
          self.describe()
        ))
      })
  }

  /// Request `Out` with `input` added to this node's params.
  pub async fn get<Out, In>(&self, input: In) -> Result<Arc<Out>, Failure>
  where
    Out: Any + Send + Sync,
    In: AnyValue,
  {
    self.get_with::<Out>(Params::of(input)).await
  }

  /// Request `Out` with several provided params at once.
  pub async fn get_with<Out>(&self, provided: Params) -> Result<Arc<Out>, Failure>
  where
    Out: Any + Send + Sync,
  {
    let value = self.get_value(TypeKey::of::<Out>(), provided, None).await?;
    downcast(value)
  }

  /// Request one `Out` per input, concurrently. Every request runs to
  /// completion and each result is reported in input order.
  pub async fn get_all<Out, In>(
    &self,
    inputs: impl IntoIterator<Item = In>,
  ) -> Vec<Result<Arc<Out>, Failure>>
  where
    Out: Any + Send + Sync,
    In: AnyValue,
  {
    let requests = inputs
      .into_iter()
      .map(|input| self.get::<Out, In>(input));
    futures::future::join_all(requests).await
  }

  /// Like [`Context::get_all`], but returns the first failure as soon as it
  /// arrives. Requests still in flight keep running for anyone else who
  /// wants them; this context just stops waiting.
  pub async fn try_get_all<Out, In>(
    &self,
    inputs: impl IntoIterator<Item = In>,
  ) -> Result<Vec<Arc<Out>>, Failure>
  where
    Out: Any + Send + Sync,
    In: AnyValue,
  {
    let detach = Arc::new(AtomicBool::new(false));
    let mut pending: FuturesUnordered<_> = inputs
      .into_iter()
      .enumerate()
      .map(|(index, input)| {
        let detach = detach.clone();
        async move {
          let value = self
            .get_value(TypeKey::of::<Out>(), Params::of(input), Some(detach))
            .await;
          (index, value)
        }
      })
      .collect();

    let mut results: Vec<Option<Arc<Out>>> = vec![None; pending.len()];
    while let Some((index, value)) = pending.next().await {
      match value.and_then(downcast::<Out>) {
        Ok(value) => results[index] = Some(value),
        Err(failure) => {
          detach.store(true, Ordering::SeqCst);
          return Err(failure);
        }
      }
    }
    Ok(results.into_iter().flatten().collect())
  }

  /// Request a value by type key. The request must match a dependency the
  /// running rule declared.
  pub async fn get_value(
    &self,
    output: TypeKey,
    provided: Params,
    detach: Option<Arc<AtomicBool>>,
  ) -> Result<Value, Failure> {
    if let Some(frame) = &self.frame {
      let key = DependencyKey::new(output, provided.type_set());
      if !frame.rule.declares(&key) {
        return Err(Failure::from(ResolveError::UndeclaredGet {
          rule: frame.rule.id.clone(),
          key,
        }));
      }
    }
    let mut params = self.params.clone();
    params.extend(&provided);
    self.fetch(output, params, detach).await
  }

  /// Resolve `output` from exactly `params` and obtain it from the graph.
  pub(crate) fn fetch(
    &self,
    output: TypeKey,
    params: Params,
    detach: Option<Arc<AtomicBool>>,
  ) -> BoxFuture<'_, Result<Value, Failure>> {
    async move {
      let query = Query::new(output, params.type_set());
      match self.scheduler.rule_graph().select(&query)? {
        Selection::Param(key) => params
          .get_value(key)
          .cloned()
          .ok_or_else(|| Failure::msg(format!("missing param {}", key))),
        Selection::Rule { rule, used_params } => {
          let node = NodeKey {
            rule,
            params: params.restrict(&used_params),
          };
          let parent = self.frame.as_deref().map(|frame| (frame.id, &*frame.run));
          self
            .scheduler
            .get_node(parent, node, self.session, detach)
            .await
        }
      }
    }
    .boxed()
  }

  /// Record that the running node read `path`, or only `lines` of it. A later
  /// change to those lines invalidates the node.
  pub fn declare_source(&self, path: &Path, lines: Option<LineRange>) {
    if let Some(frame) = &self.frame {
      self.scheduler.declare_source(frame.id, path, lines);
    }
  }

  /// Make the running node's result valid only within the current session.
  pub fn set_session_scoped(&self) {
    if let Some(frame) = &self.frame {
      frame.run.mark_scoped();
    }
  }

  pub fn notify(&self, event: ExecutionEvent) {
    self.scheduler.notify(event);
  }

  fn describe(&self) -> String {
    match &self.frame {
      Some(frame) => frame.node.to_string(),
      None => "request".to_string(),
    }
  }
}

fn downcast<T: Any + Send + Sync>(value: Value) -> Result<Arc<T>, Failure> {
  let actual = value.type_key();
  value.downcast::<T>().ok_or_else(|| {
    Failure::new(Cause::TypeMismatch {
      expected: TypeKey::of::<T>(),
      actual,
    })
  })
}
