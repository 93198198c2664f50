use std::fmt;

use kiln_rules::{Params, RuleId};

/// The identity of a memoized computation: a rule applied to the params it
/// actually uses.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
  pub rule: RuleId,
  pub params: Params,
}

impl fmt::Debug for NodeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self)
  }
}

impl fmt::Display for NodeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.rule, self.params)
  }
}

/// Identifies one top-level session of requests. Session-scoped results are
/// only reused within the session that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "session-{}", self.0)
  }
}

/// Observable lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  NotStarted,
  Running,
  Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(pub(crate) usize);
