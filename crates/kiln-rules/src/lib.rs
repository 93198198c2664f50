//! Kiln Rules
//!
//! The static half of the engine: a closed set of rules, each declaring the
//! types it consumes and the type it produces, and a resolver that decides,
//! purely from types, which rule satisfies a request shape.
//!
//! Rules are generic over their body `B` so that this crate knows nothing
//! about how bodies are run.

mod error;
mod graph;
mod params;
mod rule;
mod value;

pub use error::ResolveError;
pub use graph::{Plan, Query, RuleGraph, Selection, dependency_queries};
pub use params::Params;
pub use rule::{DependencyKey, Rule, RuleId, RuleRegistry, RuleSet};
pub use value::{AnyValue, TypeKey, Value};
