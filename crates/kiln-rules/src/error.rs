use thiserror::Error;

use crate::{DependencyKey, RuleId, TypeKey};

/// Errors raised while building or resolving the rule graph.
///
/// These are configuration errors and are reported before any rule runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  /// Two rules were registered under the same id.
  #[error("duplicate rule id: {rule}")]
  DuplicateRule { rule: RuleId },

  /// A rule's declaration is malformed.
  #[error("invalid rule {rule}: {message}")]
  InvalidRule { rule: RuleId, message: String },

  /// More than one rule can produce the requested type from the same params.
  #[error(
    "ambiguous rules for {output} given [{}]: {}",
    join(params),
    join(candidates)
  )]
  Ambiguous {
    output: TypeKey,
    params: Vec<TypeKey>,
    candidates: Vec<RuleId>,
  },

  /// No composition of rules produces the requested type from the params.
  #[error("no rule produces {output} given [{}]{}", join(params), render_reasons(reasons))]
  Unsatisfiable {
    output: TypeKey,
    params: Vec<TypeKey>,
    reasons: Vec<String>,
  },

  /// Rule dependencies loop back on themselves.
  #[error("rule cycle: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },

  /// A side-effecting rule was reached from a rule that is not one.
  #[error("rule {rule} depends on side-effecting rule {dependency}")]
  SideEffectInGet { rule: RuleId, dependency: RuleId },

  /// A rule body requested a dependency it did not declare.
  #[error("rule {rule} requested undeclared dependency {key}")]
  UndeclaredGet { rule: RuleId, key: DependencyKey },
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
  items
    .iter()
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join(", ")
}

fn render_reasons(reasons: &[String]) -> String {
  if reasons.is_empty() {
    String::new()
  } else {
    format!(" ({})", reasons.join("; "))
  }
}
