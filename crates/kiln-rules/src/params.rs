use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::{AnyValue, TypeKey, Value};

/// The concrete values bound to a rule invocation, at most one per type.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(BTreeMap<TypeKey, Value>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Params holding a single value.
  pub fn of<T: AnyValue>(value: T) -> Self {
    Self::new().with(value)
  }

  /// Add a value, replacing any existing value of the same type.
  pub fn with<T: AnyValue>(mut self, value: T) -> Self {
    self.insert(Value::new(value));
    self
  }

  /// Insert a value, returning the one it replaced.
  pub fn insert(&mut self, value: Value) -> Option<Value> {
    self.0.insert(value.type_key(), value)
  }

  /// Overlay `other` on top of these params. Values in `other` win.
  pub fn extend(&mut self, other: &Params) {
    for value in other.0.values() {
      self.insert(value.clone());
    }
  }

  pub fn get<T: 'static>(&self) -> Option<&T> {
    self
      .0
      .get(&TypeKey::of::<T>())
      .and_then(|value| value.downcast_ref::<T>())
  }

  pub fn get_value(&self, key: TypeKey) -> Option<&Value> {
    self.0.get(&key)
  }

  pub fn contains(&self, key: TypeKey) -> bool {
    self.0.contains_key(&key)
  }

  pub fn type_set(&self) -> BTreeSet<TypeKey> {
    self.0.keys().copied().collect()
  }

  pub fn values(&self) -> impl Iterator<Item = &Value> {
    self.0.values()
  }

  /// Keep only the values whose types are in `keep`.
  pub fn restrict(&self, keep: &BTreeSet<TypeKey>) -> Params {
    Params(
      self
        .0
        .iter()
        .filter(|(key, _)| keep.contains(key))
        .map(|(key, value)| (*key, value.clone()))
        .collect(),
    )
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl FromIterator<Value> for Params {
  fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
    let mut params = Params::new();
    for value in iter {
      params.insert(value);
    }
    params
  }
}

impl fmt::Debug for Params {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.0.values()).finish()
  }
}

impl fmt::Display for Params {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rendered: Vec<String> = self.0.values().map(|v| format!("{:?}", v)).collect();
    write!(f, "{}", rendered.join(", "))
  }
}
