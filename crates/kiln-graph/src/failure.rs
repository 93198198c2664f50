use std::fmt;
use std::sync::Arc;

use kiln_rules::{ResolveError, TypeKey};

use crate::NodeKey;

/// The original error behind a failure, kept so callers can downcast it.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Why a node failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Cause {
  /// A rule body returned an error.
  #[error("{message}")]
  Failed {
    message: String,
    #[source]
    source: Option<ErrorSource>,
  },

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("{node} kept being invalidated while running ({attempts} attempts)")]
  InvalidationRace { node: String, attempts: usize },

  #[error("request cancelled")]
  Cancelled,

  #[error("expected a {expected}, got a {actual}")]
  TypeMismatch { expected: TypeKey, actual: TypeKey },
}

/// One rule on the path from a request down to the node that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub rule: String,
  pub params: String,
}

impl Frame {
  pub(crate) fn of(node: &NodeKey) -> Self {
    Self {
      rule: node.rule.to_string(),
      params: node.params.to_string(),
    }
  }
}

impl fmt::Display for Frame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.rule, self.params)
  }
}

/// A rule failure as seen by whoever requested the node.
///
/// Failures are values: they are memoized like successes and shared between
/// every requester, so they are cheap to clone. Each node the failure passes
/// through on the way up prepends its [`Frame`], so `frames()` reads from the
/// outermost rule down to the one that failed.
#[derive(Debug, Clone)]
pub struct Failure {
  cause: Cause,
  frames: Vec<Frame>,
}

impl Failure {
  pub fn new(cause: Cause) -> Self {
    Self {
      cause,
      frames: Vec::new(),
    }
  }

  /// A failure with a plain message.
  pub fn msg(message: impl Into<String>) -> Self {
    Self::new(Cause::Failed {
      message: message.into(),
      source: None,
    })
  }

  /// A failure wrapping a typed error, recoverable with
  /// [`Failure::downcast_source`].
  pub fn from_error<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::new(Cause::Failed {
      message: error.to_string(),
      source: Some(Arc::new(error)),
    })
  }

  pub fn cancelled() -> Self {
    Self::new(Cause::Cancelled)
  }

  pub fn cause(&self) -> &Cause {
    &self.cause
  }

  pub fn frames(&self) -> &[Frame] {
    &self.frames
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.cause, Cause::Cancelled)
  }

  /// The typed error a rule failed with, if it was `E`.
  pub fn downcast_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
    match &self.cause {
      Cause::Failed {
        source: Some(source),
        ..
      } => source.downcast_ref::<E>(),
      _ => None,
    }
  }

  pub(crate) fn with_frame(mut self, frame: Frame) -> Self {
    self.frames.insert(0, frame);
    self
  }
}

impl fmt::Display for Failure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.cause)?;
    if !self.frames.is_empty() {
      write!(f, "\n  while running:")?;
      for frame in &self.frames {
        write!(f, "\n    {}", frame)?;
      }
    }
    Ok(())
  }
}

impl std::error::Error for Failure {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.cause)
  }
}

impl From<ResolveError> for Failure {
  fn from(error: ResolveError) -> Self {
    Self::new(Cause::Resolve(error))
  }
}

impl From<Cause> for Failure {
  fn from(cause: Cause) -> Self {
    Self::new(cause)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use kiln_rules::{Params, RuleId};

  #[derive(Debug, thiserror::Error, PartialEq)]
  #[error("disk on fire")]
  struct DiskError;

  #[test]
  fn test_frames_read_outermost_first() {
    let inner = NodeKey {
      rule: RuleId::new("parse"),
      params: Params::of(3u32),
    };
    let outer = NodeKey {
      rule: RuleId::new("build"),
      params: Params::new(),
    };
    let failure = Failure::msg("bad input")
      .with_frame(Frame::of(&inner))
      .with_frame(Frame::of(&outer));

    let rules: Vec<&str> = failure.frames().iter().map(|f| f.rule.as_str()).collect();
    assert_eq!(rules, vec!["build", "parse"]);
    assert!(failure.to_string().starts_with("bad input"));
  }

  #[test]
  fn test_downcast_source() {
    let failure = Failure::from_error(DiskError);
    assert_eq!(failure.downcast_source::<DiskError>(), Some(&DiskError));
    assert!(Failure::msg("x").downcast_source::<DiskError>().is_none());
    assert!(Failure::cancelled().is_cancelled());
  }
}
