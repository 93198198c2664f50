use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::{ResolveError, TypeKey};

/// Stable name of a rule, unique within a [`RuleSet`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(Arc<str>);

impl RuleId {
  pub fn new(name: impl AsRef<str>) -> Self {
    Self(Arc::from(name.as_ref()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Debug for RuleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Display for RuleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RuleId {
  fn from(name: &str) -> Self {
    Self::new(name)
  }
}

/// A dependency a rule body may request at run time: an output type, computed
/// with the rule's own params plus values of the `provided` types.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
  pub output: TypeKey,
  pub provided: Vec<TypeKey>,
}

impl DependencyKey {
  pub fn new(output: TypeKey, provided: impl IntoIterator<Item = TypeKey>) -> Self {
    let mut provided: Vec<TypeKey> = provided.into_iter().collect();
    provided.sort();
    provided.dedup();
    Self { output, provided }
  }

  /// `Get(Output, Input)`.
  pub fn of<Output: 'static, Input: 'static>() -> Self {
    Self::new(TypeKey::of::<Output>(), [TypeKey::of::<Input>()])
  }
}

impl fmt::Debug for DependencyKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl fmt::Display for DependencyKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let provided: Vec<&str> = self.provided.iter().map(|key| key.short_name()).collect();
    write!(f, "Get({}, [{}])", self.output, provided.join(", "))
  }
}

/// A computation step: declares the types it consumes and the one it
/// produces. `B` is the body the execution layer runs.
pub struct Rule<B> {
  pub id: RuleId,
  pub output: TypeKey,
  /// Values the rule receives before its body runs.
  pub inputs: Vec<TypeKey>,
  /// Dependencies the body may request while it runs.
  pub gets: Vec<DependencyKey>,
  /// Side-effecting rules may only be selected for root queries.
  pub side_effecting: bool,
  pub body: B,
}

impl<B> Rule<B> {
  pub fn new(id: impl Into<RuleId>, output: TypeKey, body: B) -> Self {
    Self {
      id: id.into(),
      output,
      inputs: Vec::new(),
      gets: Vec::new(),
      side_effecting: false,
      body,
    }
  }

  pub fn input(mut self, key: TypeKey) -> Self {
    self.inputs.push(key);
    self
  }

  pub fn get(mut self, key: DependencyKey) -> Self {
    self.gets.push(key);
    self
  }

  pub fn side_effecting(mut self) -> Self {
    self.side_effecting = true;
    self
  }

  /// Whether the body declared `key` as a run-time dependency.
  pub fn declares(&self, key: &DependencyKey) -> bool {
    self.gets.contains(key)
  }
}

impl<B> fmt::Debug for Rule<B> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Rule")
      .field("id", &self.id)
      .field("output", &self.output)
      .field("inputs", &self.inputs)
      .field("gets", &self.gets)
      .field("side_effecting", &self.side_effecting)
      .finish()
  }
}

/// Collects rules before the rule set is closed.
pub struct RuleRegistry<B> {
  rules: Vec<Rule<B>>,
}

impl<B> Default for RuleRegistry<B> {
  fn default() -> Self {
    Self { rules: Vec::new() }
  }
}

impl<B> RuleRegistry<B> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, rule: Rule<B>) -> &mut Self {
    self.rules.push(rule);
    self
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Close the registry. No rules can be added afterwards.
  pub fn build(self) -> Result<RuleSet<B>, ResolveError> {
    let mut by_id = BTreeMap::new();
    let mut by_output: BTreeMap<TypeKey, Vec<RuleId>> = BTreeMap::new();

    for rule in self.rules {
      let mut seen = BTreeSet::new();
      for input in &rule.inputs {
        if !seen.insert(*input) {
          return Err(ResolveError::InvalidRule {
            rule: rule.id.clone(),
            message: format!("input type {} is declared twice", input),
          });
        }
      }
      if rule.inputs.contains(&rule.output) {
        return Err(ResolveError::InvalidRule {
          rule: rule.id.clone(),
          message: format!("rule consumes its own output type {}", rule.output),
        });
      }
      if by_id.contains_key(&rule.id) {
        return Err(ResolveError::DuplicateRule {
          rule: rule.id.clone(),
        });
      }
      by_output
        .entry(rule.output)
        .or_default()
        .push(rule.id.clone());
      by_id.insert(rule.id.clone(), Arc::new(rule));
    }

    Ok(RuleSet { by_id, by_output })
  }
}

/// A closed, immutable set of rules indexed by id and output type.
pub struct RuleSet<B> {
  by_id: BTreeMap<RuleId, Arc<Rule<B>>>,
  by_output: BTreeMap<TypeKey, Vec<RuleId>>,
}

impl<B> RuleSet<B> {
  pub fn get(&self, id: &RuleId) -> Option<&Arc<Rule<B>>> {
    self.by_id.get(id)
  }

  /// Rules producing `output`, in id order.
  pub fn producers(&self, output: TypeKey) -> impl Iterator<Item = &Arc<Rule<B>>> {
    self
      .by_output
      .get(&output)
      .into_iter()
      .flatten()
      .filter_map(|id| self.by_id.get(id))
  }

  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule<B>>> {
    self.by_id.values()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Source;
  struct Lines;

  #[test]
  fn test_duplicate_rule_ids_are_rejected() {
    let mut registry = RuleRegistry::new();
    registry
      .register(Rule::new("count", TypeKey::of::<Lines>(), ()))
      .register(Rule::new("count", TypeKey::of::<Lines>(), ()));
    assert!(matches!(
      registry.build(),
      Err(ResolveError::DuplicateRule { .. })
    ));
  }

  #[test]
  fn test_producers_are_indexed_by_output() {
    let mut registry = RuleRegistry::new();
    registry.register(Rule::new("count", TypeKey::of::<Lines>(), ()).input(TypeKey::of::<Source>()));
    let rules = registry.build().unwrap();
    let producers: Vec<_> = rules.producers(TypeKey::of::<Lines>()).collect();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].id.as_str(), "count");
    assert_eq!(rules.producers(TypeKey::of::<Source>()).count(), 0);
  }

  #[test]
  fn test_dependency_key_sorts_provided_types() {
    let a = DependencyKey::new(TypeKey::of::<Lines>(), [TypeKey::of::<Source>(), TypeKey::of::<u8>()]);
    let b = DependencyKey::new(TypeKey::of::<Lines>(), [TypeKey::of::<u8>(), TypeKey::of::<Source>()]);
    assert_eq!(a, b);
  }
}
