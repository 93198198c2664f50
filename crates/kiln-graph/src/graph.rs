use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_rules::Value;
use kiln_watch::{ChangeSet, LineRange};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::node::EntryId;
use crate::{Cause, ExecutionEvent, Failure, NodeKey, NodeState, SessionId};

/// A finished run as handed to every waiter.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
  pub result: Result<Value, Failure>,
  pub generation: u64,
  /// Valid only within the session that produced it.
  pub scoped: bool,
}

pub(crate) type OutcomeSender = watch::Sender<Option<Outcome>>;
pub(crate) type OutcomeReceiver = watch::Receiver<Option<Outcome>>;

/// What a caller must do to obtain a node's result.
pub(crate) enum Lookup {
  Ready(Outcome),
  Wait {
    receiver: OutcomeReceiver,
    run_id: u64,
  },
  /// The caller owns a fresh run and must spawn it.
  Start {
    receiver: OutcomeReceiver,
    run_id: u64,
    cancel: CancellationToken,
    cleared: Option<Value>,
  },
}

pub(crate) enum Completion {
  Done(Outcome),
  /// Something the run read changed underneath it. Run the body again.
  Retry,
  /// The run was cancelled or superseded. Drop the result.
  Abandoned,
}

/// What one run of a node observed.
#[derive(Default)]
pub(crate) struct RunState {
  reads: Mutex<Vec<(EntryId, u64)>>,
  scoped: AtomicBool,
}

impl RunState {
  pub fn record(&self, id: EntryId, outcome: &Outcome) {
    if outcome.scoped {
      self.mark_scoped();
    }
    let mut reads = self.reads.lock().unwrap_or_else(|e| e.into_inner());
    if !reads.iter().any(|(read, _)| *read == id) {
      reads.push((id, outcome.generation));
    }
  }

  pub fn mark_scoped(&self) {
    self.scoped.store(true, Ordering::SeqCst);
  }

  fn reads(&self) -> Vec<(EntryId, u64)> {
    self.reads.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn is_scoped(&self) -> bool {
    self.scoped.load(Ordering::SeqCst)
  }
}

enum EntryState {
  NotStarted {
    previous: Option<Result<Value, Failure>>,
  },
  Running {
    run_id: u64,
    /// Invalidated since the run began.
    dirty: bool,
    waiters: usize,
    cancel: CancellationToken,
    sender: OutcomeSender,
    previous: Option<Result<Value, Failure>>,
  },
  Completed {
    result: Result<Value, Failure>,
    session: Option<SessionId>,
  },
}

struct Entry {
  node: NodeKey,
  state: EntryState,
  /// Bumped whenever a run completes with a result different from the last.
  generation: u64,
  runs: u64,
  dependents: HashSet<EntryId>,
  dependencies: Vec<EntryId>,
  sources: Vec<(PathBuf, Option<LineRange>)>,
}

impl Entry {
  fn new(node: NodeKey) -> Self {
    Self {
      node,
      state: EntryState::NotStarted { previous: None },
      generation: 0,
      runs: 0,
      dependents: HashSet::new(),
      dependencies: Vec::new(),
      sources: Vec::new(),
    }
  }
}

#[derive(Default)]
struct Nodes {
  entries: Vec<Entry>,
  index: HashMap<NodeKey, EntryId>,
  sources: HashMap<PathBuf, Vec<(EntryId, Option<LineRange>)>>,
}

impl Nodes {
  fn entry_for(&mut self, node: &NodeKey) -> EntryId {
    if let Some(id) = self.index.get(node) {
      return *id;
    }
    let id = EntryId(self.entries.len());
    self.entries.push(Entry::new(node.clone()));
    self.index.insert(node.clone(), id);
    id
  }

  fn forget_sources(&mut self, id: EntryId) {
    for (path, _) in std::mem::take(&mut self.entries[id.0].sources) {
      if let Some(list) = self.sources.get_mut(&path) {
        list.retain(|(entry, _)| *entry != id);
        if list.is_empty() {
          self.sources.remove(&path);
        }
      }
    }
  }
}

/// The memo table: one entry per node key, with the edges between them.
///
/// All bookkeeping happens under a single lock that is never held across an
/// await.
#[derive(Default)]
pub(crate) struct Graph {
  nodes: Mutex<Nodes>,
}

impl Graph {
  /// Find or create the entry for `node` and decide how `session` gets its
  /// result. The dependency edge from `parent` is recorded before anything
  /// is awaited, so an invalidation racing with the run still reaches it.
  pub fn lookup(
    &self,
    node: &NodeKey,
    parent: Option<EntryId>,
    session: SessionId,
  ) -> (EntryId, Lookup) {
    let mut nodes = self.lock();
    let id = nodes.entry_for(node);
    if let Some(parent) = parent {
      nodes.entries[id.0].dependents.insert(parent);
    }

    let entry = &mut nodes.entries[id.0];
    match &mut entry.state {
      EntryState::Completed {
        result,
        session: scope,
      } if scope.is_none_or(|owner| owner == session) => {
        let outcome = Outcome {
          result: result.clone(),
          generation: entry.generation,
          scoped: scope.is_some(),
        };
        return (id, Lookup::Ready(outcome));
      }
      EntryState::Running {
        sender,
        waiters,
        run_id,
        ..
      } => {
        *waiters += 1;
        let lookup = Lookup::Wait {
          receiver: sender.subscribe(),
          run_id: *run_id,
        };
        return (id, lookup);
      }
      _ => {}
    }

    let (previous, cleared) = match std::mem::replace(
      &mut entry.state,
      EntryState::NotStarted { previous: None },
    ) {
      // A result from another session: rerun, but keep it for comparison.
      EntryState::Completed { result, .. } => {
        let cleared = result.as_ref().ok().cloned();
        (Some(result), cleared)
      }
      EntryState::NotStarted { previous } | EntryState::Running { previous, .. } => {
        (previous, None)
      }
    };

    entry.runs += 1;
    let run_id = entry.runs;
    let cancel = CancellationToken::new();
    let (sender, receiver) = watch::channel(None);
    entry.state = EntryState::Running {
      run_id,
      dirty: false,
      waiters: 1,
      cancel: cancel.clone(),
      sender,
      previous,
    };
    if cleared.is_some() {
      nodes.forget_sources(id);
    }

    (
      id,
      Lookup::Start {
        receiver,
        run_id,
        cancel,
        cleared,
      },
    )
  }

  /// Record the result of run `run_id`. The result is only accepted if
  /// nothing it read changed while it ran; otherwise the caller retries,
  /// until `max_retries` is exhausted and the node fails instead.
  #[allow(clippy::too_many_arguments)]
  pub fn complete(
    &self,
    id: EntryId,
    run_id: u64,
    mut result: Result<Value, Failure>,
    run: &RunState,
    session: SessionId,
    side_effecting: bool,
    attempts: usize,
    max_retries: usize,
  ) -> Completion {
    let mut nodes = self.lock();
    let reads = run.reads();
    let stale = reads.iter().any(|(dep, generation)| {
      let dep = &nodes.entries[dep.0];
      !matches!(dep.state, EntryState::Completed { .. }) || dep.generation != *generation
    });

    let entry = &mut nodes.entries[id.0];
    let (sender, previous) = match std::mem::replace(
      &mut entry.state,
      EntryState::NotStarted { previous: None },
    ) {
      EntryState::Running {
        run_id: current,
        dirty,
        waiters,
        cancel,
        sender,
        previous,
      } if current == run_id => {
        if dirty || stale {
          if attempts < max_retries {
            entry.state = EntryState::Running {
              run_id,
              dirty: false,
              waiters,
              cancel,
              sender,
              previous,
            };
            // The next attempt declares its own sources.
            nodes.forget_sources(id);
            return Completion::Retry;
          }
          result = Err(Failure::new(Cause::InvalidationRace {
            node: entry.node.to_string(),
            attempts: attempts + 1,
          }));
        }
        (sender, previous)
      }
      other => {
        entry.state = other;
        return Completion::Abandoned;
      }
    };

    let unchanged = matches!((&previous, &result), (Some(Ok(old)), Ok(new)) if old == new);
    if !unchanged {
      entry.generation += 1;
    }
    let scoped = side_effecting || run.is_scoped();
    let outcome = Outcome {
      result: result.clone(),
      generation: entry.generation,
      scoped,
    };
    entry.state = EntryState::Completed {
      result,
      session: scoped.then_some(session),
    };

    let current: Vec<EntryId> = reads.iter().map(|(dep, _)| *dep).collect();
    let old = std::mem::replace(&mut entry.dependencies, current.clone());
    for dropped in old.into_iter().filter(|dep| !current.contains(dep)) {
      nodes.entries[dropped.0].dependents.remove(&id);
    }

    sender.send_replace(Some(outcome.clone()));
    Completion::Done(outcome)
  }

  /// A waiter on run `run_id` went away. When the last one leaves, the run is
  /// cancelled and the node returns to not started. Returns whether that
  /// happened.
  pub fn release(&self, id: EntryId, run_id: u64) -> bool {
    let mut nodes = self.lock();
    let entry = &mut nodes.entries[id.0];
    match std::mem::replace(
      &mut entry.state,
      EntryState::NotStarted { previous: None },
    ) {
      EntryState::Running {
        run_id: current,
        dirty,
        waiters,
        cancel,
        sender,
        previous,
      } if current == run_id => {
        if waiters > 1 {
          entry.state = EntryState::Running {
            run_id,
            dirty,
            waiters: waiters - 1,
            cancel,
            sender,
            previous,
          };
          return false;
        }
        cancel.cancel();
        entry.state = EntryState::NotStarted { previous };
        true
      }
      other => {
        entry.state = other;
        false
      }
    }
  }

  /// Note that the running node `id` read `path`, or only `lines` of it.
  pub fn declare_source(&self, id: EntryId, path: &Path, lines: Option<LineRange>) {
    let mut nodes = self.lock();
    let dependency = (path.to_path_buf(), lines);
    if nodes.entries[id.0].sources.contains(&dependency) {
      return;
    }
    nodes.entries[id.0].sources.push(dependency);
    nodes
      .sources
      .entry(path.to_path_buf())
      .or_default()
      .push((id, lines));
  }

  /// Invalidate every node that declared a source touched by `changes`, and
  /// everything that transitively depends on them.
  ///
  /// A whole-path source on a directory is touched by any change beneath it,
  /// so a file appearing in or leaving a directory reaches its listings.
  pub fn invalidate_changes(&self, changes: &ChangeSet) -> (usize, Vec<ExecutionEvent>) {
    let roots: Vec<EntryId> = {
      let nodes = self.lock();
      let mut roots = Vec::new();
      for (path, change) in changes.iter() {
        if let Some(readers) = nodes.sources.get(path) {
          roots.extend(
            readers
              .iter()
              .filter(|(_, lines)| change.affects(lines.as_ref()))
              .map(|(id, _)| *id),
          );
        }
        for dir in enclosing_dirs(path) {
          if let Some(readers) = nodes.sources.get(&dir) {
            roots.extend(
              readers
                .iter()
                .filter(|(_, lines)| lines.is_none())
                .map(|(id, _)| *id),
            );
          }
        }
      }
      roots
    };
    self.invalidate(roots)
  }

  /// Invalidate nodes matching `predicate` and their dependents.
  pub fn invalidate_matching(
    &self,
    predicate: impl Fn(&NodeKey) -> bool,
  ) -> (usize, Vec<ExecutionEvent>) {
    let roots: Vec<EntryId> = {
      let nodes = self.lock();
      nodes
        .entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| predicate(&entry.node))
        .map(|(index, _)| EntryId(index))
        .collect()
    };
    self.invalidate(roots)
  }

  fn invalidate(&self, roots: Vec<EntryId>) -> (usize, Vec<ExecutionEvent>) {
    let mut nodes = self.lock();
    let mut stack = roots;
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    let mut invalidated = 0;

    while let Some(id) = stack.pop() {
      if !seen.insert(id) {
        continue;
      }
      let entry = &mut nodes.entries[id.0];
      stack.extend(entry.dependents.iter().copied());
      match std::mem::replace(
        &mut entry.state,
        EntryState::NotStarted { previous: None },
      ) {
        EntryState::Completed { result, .. } => {
          invalidated += 1;
          events.push(ExecutionEvent::NodeCleared {
            node: entry.node.to_string(),
            value: result.as_ref().ok().cloned(),
          });
          entry.state = EntryState::NotStarted {
            previous: Some(result),
          };
          nodes.forget_sources(id);
        }
        EntryState::Running {
          run_id,
          waiters,
          cancel,
          sender,
          previous,
          ..
        } => {
          invalidated += 1;
          entry.state = EntryState::Running {
            run_id,
            dirty: true,
            waiters,
            cancel,
            sender,
            previous,
          };
        }
        not_started => entry.state = not_started,
      }
    }

    (invalidated, events)
  }

  pub fn state(&self, node: &NodeKey) -> Option<NodeState> {
    let nodes = self.lock();
    let id = nodes.index.get(node)?;
    Some(match nodes.entries[id.0].state {
      EntryState::NotStarted { .. } => NodeState::NotStarted,
      EntryState::Running { .. } => NodeState::Running,
      EntryState::Completed { .. } => NodeState::Completed,
    })
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Nodes> {
    self.nodes.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Directories containing `path`, innermost first. The workspace root is `.`.
fn enclosing_dirs(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
  path.ancestors().skip(1).map(|dir| {
    if dir.as_os_str().is_empty() {
      PathBuf::from(".")
    } else {
      dir.to_path_buf()
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use kiln_rules::{Params, RuleId};

  fn key(rule: &str) -> NodeKey {
    NodeKey {
      rule: RuleId::new(rule),
      params: Params::new(),
    }
  }

  const SESSION: SessionId = SessionId(1);

  fn start(graph: &Graph, node: &NodeKey, parent: Option<EntryId>) -> (EntryId, u64) {
    match graph.lookup(node, parent, SESSION) {
      (id, Lookup::Start { run_id, .. }) => (id, run_id),
      _ => panic!("expected a fresh run"),
    }
  }

  fn finish(graph: &Graph, id: EntryId, run_id: u64, value: u32, run: &RunState) -> bool {
    matches!(
      graph.complete(id, run_id, Ok(Value::new(value)), run, SESSION, false, 0, 0),
      Completion::Done(_)
    )
  }

  #[test]
  fn test_completed_node_is_ready() {
    let graph = Graph::default();
    let node = key("a");
    let (id, run_id) = start(&graph, &node, None);
    assert_eq!(graph.state(&node), Some(NodeState::Running));
    assert!(finish(&graph, id, run_id, 7, &RunState::default()));

    match graph.lookup(&node, None, SESSION) {
      (_, Lookup::Ready(outcome)) => {
        assert_eq!(outcome.result.unwrap().downcast_ref::<u32>(), Some(&7));
      }
      _ => panic!("expected a memoized result"),
    }
  }

  #[test]
  fn test_second_requester_waits() {
    let graph = Graph::default();
    let node = key("a");
    let (id, run_id) = start(&graph, &node, None);
    assert!(matches!(
      graph.lookup(&node, None, SESSION),
      (_, Lookup::Wait { .. })
    ));

    // Two waiters: the first release keeps the run alive.
    assert!(!graph.release(id, run_id));
    assert!(graph.release(id, run_id));
    assert_eq!(graph.state(&node), Some(NodeState::NotStarted));
  }

  #[test]
  fn test_invalidation_reaches_dependents() {
    let graph = Graph::default();
    let child = key("child");
    let parent = key("parent");

    let (parent_id, parent_run) = start(&graph, &parent, None);
    let (child_id, child_run) = start(&graph, &child, Some(parent_id));
    let child_state = RunState::default();
    assert!(finish(&graph, child_id, child_run, 1, &child_state));

    let parent_state = RunState::default();
    let (_, Lookup::Ready(outcome)) = graph.lookup(&child, Some(parent_id), SESSION) else {
      panic!("child should be ready");
    };
    parent_state.record(child_id, &outcome);
    assert!(finish(&graph, parent_id, parent_run, 2, &parent_state));

    let (count, events) = graph.invalidate_matching(|node| node.rule.as_str() == "child");
    assert_eq!(count, 2);
    assert_eq!(events.len(), 2);
    assert_eq!(graph.state(&parent), Some(NodeState::NotStarted));
  }

  #[test]
  fn test_dirty_run_retries_then_fails() {
    let graph = Graph::default();
    let node = key("a");
    let (id, run_id) = start(&graph, &node, None);
    graph.invalidate_matching(|_| true);

    let run = RunState::default();
    let outcome = graph.complete(id, run_id, Ok(Value::new(1u32)), &run, SESSION, false, 0, 1);
    assert!(matches!(outcome, Completion::Retry));

    graph.invalidate_matching(|_| true);
    let outcome = graph.complete(id, run_id, Ok(Value::new(1u32)), &run, SESSION, false, 1, 1);
    let Completion::Done(outcome) = outcome else {
      panic!("expected the run to give up");
    };
    assert!(matches!(
      outcome.result.unwrap_err().cause(),
      Cause::InvalidationRace { attempts: 2, .. }
    ));
  }

  #[test]
  fn test_source_invalidation_respects_lines() {
    let graph = Graph::default();
    let block = key("block");
    let (id, run_id) = start(&graph, &block, None);
    graph.declare_source(id, Path::new("big.txt"), Some(LineRange::new(10, 20)));
    assert!(finish(&graph, id, run_id, 1, &RunState::default()));

    let mut outside = ChangeSet::new();
    outside.lines("big.txt", vec![LineRange::new(25, 26)]);
    assert_eq!(graph.invalidate_changes(&outside).0, 0);

    let mut inside = ChangeSet::new();
    inside.lines("big.txt", vec![LineRange::new(15, 16)]);
    assert_eq!(graph.invalidate_changes(&inside).0, 1);
  }

  #[test]
  fn test_session_scoped_result_reruns_in_new_session() {
    let graph = Graph::default();
    let node = key("effect");
    let (id, run_id) = start(&graph, &node, None);
    let run = RunState::default();
    let outcome = graph.complete(id, run_id, Ok(Value::new(1u32)), &run, SESSION, true, 0, 0);
    assert!(matches!(outcome, Completion::Done(Outcome { scoped: true, .. })));

    assert!(matches!(graph.lookup(&node, None, SESSION), (_, Lookup::Ready(_))));
    assert!(matches!(
      graph.lookup(&node, None, SessionId(2)),
      (_, Lookup::Start { cleared: Some(_), .. })
    ));
  }

  #[test]
  fn test_directory_sources_see_changes_beneath_them() {
    let graph = Graph::default();
    let listing = key("listing");
    let (id, run_id) = start(&graph, &listing, None);
    graph.declare_source(id, Path::new("src"), None);
    graph.declare_source(id, Path::new("src/a.txt"), None);
    assert!(finish(&graph, id, run_id, 1, &RunState::default()));

    let mut elsewhere = ChangeSet::new();
    elsewhere.whole("docs/new.txt");
    assert_eq!(graph.invalidate_changes(&elsewhere).0, 0);

    let mut created = ChangeSet::new();
    created.whole("src/nested/new.txt");
    assert_eq!(graph.invalidate_changes(&created).0, 1);
  }

  #[test]
  fn test_workspace_root_source_sees_every_change() {
    let graph = Graph::default();
    let everything = key("everything");
    let (id, run_id) = start(&graph, &everything, None);
    graph.declare_source(id, Path::new("."), None);
    assert!(finish(&graph, id, run_id, 1, &RunState::default()));

    let mut created = ChangeSet::new();
    created.whole("top.txt");
    assert_eq!(graph.invalidate_changes(&created).0, 1);
  }

  #[test]
  fn test_retry_drops_sources_of_the_abandoned_attempt() {
    let graph = Graph::default();
    let node = key("reader");
    let (id, run_id) = start(&graph, &node, None);
    graph.declare_source(id, Path::new("stale.txt"), None);
    graph.invalidate_matching(|_| true);

    let run = RunState::default();
    let outcome = graph.complete(id, run_id, Ok(Value::new(1u32)), &run, SESSION, false, 0, 1);
    assert!(matches!(outcome, Completion::Retry));
    graph.declare_source(id, Path::new("fresh.txt"), None);
    let outcome = graph.complete(id, run_id, Ok(Value::new(2u32)), &run, SESSION, false, 1, 1);
    assert!(matches!(outcome, Completion::Done(_)));

    let mut stale = ChangeSet::new();
    stale.whole("stale.txt");
    assert_eq!(graph.invalidate_changes(&stale).0, 0);

    let mut fresh = ChangeSet::new();
    fresh.whole("fresh.txt");
    assert_eq!(graph.invalidate_changes(&fresh).0, 1);
  }
}
