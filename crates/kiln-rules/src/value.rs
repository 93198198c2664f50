use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifies the Rust type of a value flowing through the rule graph.
///
/// Equality and hashing use the `TypeId`; the name is kept for messages.
#[derive(Clone, Copy)]
pub struct TypeKey {
  id: TypeId,
  name: &'static str,
}

impl TypeKey {
  pub fn of<T: 'static>() -> Self {
    Self {
      id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
    }
  }

  pub fn id(&self) -> TypeId {
    self.id
  }

  /// Fully qualified type name.
  pub fn name(&self) -> &'static str {
    self.name
  }

  /// Type name without its module path.
  pub fn short_name(&self) -> &'static str {
    let base = self.name.split('<').next().unwrap_or(self.name);
    let start = base.rfind("::").map(|i| i + 2).unwrap_or(0);
    &self.name[start..]
  }
}

impl PartialEq for TypeKey {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

impl PartialOrd for TypeKey {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for TypeKey {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .name
      .cmp(other.name)
      .then_with(|| self.id.cmp(&other.id))
  }
}

impl fmt::Debug for TypeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.short_name())
  }
}

impl fmt::Display for TypeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.short_name())
  }
}

/// Object-safe view of a value that can be compared, hashed and downcast.
///
/// Implemented for every `Any + Send + Sync + Debug + Eq + Hash` type.
pub trait AnyValue: Any + Send + Sync + fmt::Debug {
  fn as_any(&self) -> &dyn Any;

  fn type_key(&self) -> TypeKey;

  fn dyn_eq(&self, other: &dyn AnyValue) -> bool;

  fn dyn_hash(&self, state: &mut dyn Hasher);

  fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyValue for T
where
  T: Any + Send + Sync + fmt::Debug + Eq + Hash,
{
  fn as_any(&self) -> &dyn Any {
    self
  }

  fn type_key(&self) -> TypeKey {
    TypeKey::of::<T>()
  }

  fn dyn_eq(&self, other: &dyn AnyValue) -> bool {
    other.as_any().downcast_ref::<T>() == Some(self)
  }

  fn dyn_hash(&self, mut state: &mut dyn Hasher) {
    self.hash(&mut state);
  }

  fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

/// A shared, type-erased value: a param, a rule input or a rule output.
#[derive(Clone)]
pub struct Value(Arc<dyn AnyValue>);

impl Value {
  pub fn new<T: AnyValue>(value: T) -> Self {
    Self(Arc::new(value))
  }

  pub fn type_key(&self) -> TypeKey {
    self.0.type_key()
  }

  pub fn is<T: 'static>(&self) -> bool {
    self.0.as_any().is::<T>()
  }

  pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
    self.0.as_any().downcast_ref::<T>()
  }

  /// Get a shared handle to the concrete value.
  pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.0.clone().into_any_arc().downcast::<T>().ok()
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0) || self.0.dyn_eq(other.0.as_ref())
  }
}

impl Eq for Value {}

impl Hash for Value {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.type_key().hash(state);
    self.0.dyn_hash(state);
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.0, f)
  }
}
