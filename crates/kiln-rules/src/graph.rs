use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{ResolveError, Rule, RuleId, RuleSet, TypeKey};

/// A request shape: an output type and the types of the available params.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
  pub output: TypeKey,
  pub params: BTreeSet<TypeKey>,
}

impl Query {
  pub fn new(output: TypeKey, params: impl IntoIterator<Item = TypeKey>) -> Self {
    Self {
      output,
      params: params.into_iter().collect(),
    }
  }

  fn param_list(&self) -> Vec<TypeKey> {
    self.params.iter().copied().collect()
  }
}

impl fmt::Debug for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl fmt::Display for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params: Vec<&str> = self.params.iter().map(|key| key.short_name()).collect();
    write!(f, "{} given [{}]", self.output, params.join(", "))
  }
}

/// How a query is satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
  /// Directly by the param of the requested type.
  Param(TypeKey),
  /// By running a rule. `used_params` is the subset of the available param
  /// types the rule and everything beneath it actually consume.
  Rule {
    rule: RuleId,
    used_params: BTreeSet<TypeKey>,
  },
}

impl Selection {
  pub fn used_params(&self) -> BTreeSet<TypeKey> {
    match self {
      Selection::Param(key) => BTreeSet::from([*key]),
      Selection::Rule { used_params, .. } => used_params.clone(),
    }
  }

  pub fn rule(&self) -> Option<&RuleId> {
    match self {
      Selection::Param(_) => None,
      Selection::Rule { rule, .. } => Some(rule),
    }
  }
}

/// The resolved composition for one root query: the root selection plus the
/// selection for every query reachable from it.
#[derive(Debug, Clone)]
pub struct Plan {
  pub query: Query,
  pub root: Selection,
  pub entries: BTreeMap<Query, Selection>,
}

impl Plan {
  /// Every rule the plan can run.
  pub fn rules(&self) -> BTreeSet<&RuleId> {
    self
      .entries
      .values()
      .filter_map(Selection::rule)
      .collect()
  }
}

impl fmt::Display for Plan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "{}", self.query)?;
    for (query, selection) in &self.entries {
      match selection {
        Selection::Param(key) => writeln!(f, "  {} <- param {}", query, key)?,
        Selection::Rule { rule, .. } => writeln!(f, "  {} <- {}", query, rule)?,
      }
    }
    Ok(())
  }
}

type Resolved = Result<Selection, ResolveError>;

/// Type-directed resolver over a closed [`RuleSet`].
///
/// Resolution results are cached per query, so each distinct request shape is
/// resolved once.
pub struct RuleGraph<B> {
  rules: RuleSet<B>,
  selections: Mutex<HashMap<Query, Resolved>>,
  plans: Mutex<HashMap<Query, Arc<Plan>>>,
}

impl<B> RuleGraph<B> {
  pub fn new(rules: RuleSet<B>) -> Self {
    Self {
      rules,
      selections: Mutex::new(HashMap::new()),
      plans: Mutex::new(HashMap::new()),
    }
  }

  pub fn rules(&self) -> &RuleSet<B> {
    &self.rules
  }

  pub fn rule(&self, id: &RuleId) -> Option<&Arc<Rule<B>>> {
    self.rules.get(id)
  }

  /// Select how to satisfy one query.
  pub fn select(&self, query: &Query) -> Result<Selection, ResolveError> {
    let mut cache = self.selections.lock().unwrap_or_else(|e| e.into_inner());
    let mut stack = Vec::new();
    self.resolve_in(&mut cache, query, &mut stack)
  }

  /// Resolve a root query into a full plan.
  pub fn resolve(&self, query: &Query) -> Result<Arc<Plan>, ResolveError> {
    {
      let plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
      if let Some(plan) = plans.get(query) {
        return Ok(plan.clone());
      }
    }

    let root = self.select(query)?;
    let plan = Arc::new(Plan {
      query: query.clone(),
      root: root.clone(),
      entries: self.reachable(query, root)?,
    });
    debug!(query = %query, entries = plan.entries.len(), "rule graph resolved");

    let mut plans = self.plans.lock().unwrap_or_else(|e| e.into_inner());
    Ok(plans.entry(query.clone()).or_insert(plan).clone())
  }

  /// Resolve all `queries` up front, failing on the first error.
  pub fn validate(&self, queries: &[Query]) -> Result<(), ResolveError> {
    for query in queries {
      self.resolve(query)?;
    }
    Ok(())
  }

  fn reachable(
    &self,
    query: &Query,
    root: Selection,
  ) -> Result<BTreeMap<Query, Selection>, ResolveError> {
    let mut entries = BTreeMap::new();
    let mut pending = vec![(query.clone(), root)];
    while let Some((query, selection)) = pending.pop() {
      if entries.contains_key(&query) {
        continue;
      }
      if let Selection::Rule { rule, .. } = &selection
        && let Some(rule) = self.rules.get(rule)
      {
        for dependency in dependency_queries(rule, &query.params) {
          let selected = self.select(&dependency)?;
          pending.push((dependency, selected));
        }
      }
      entries.insert(query, selection);
    }
    Ok(entries)
  }

  fn resolve_in(
    &self,
    cache: &mut HashMap<Query, Resolved>,
    query: &Query,
    stack: &mut Vec<Query>,
  ) -> Resolved {
    if let Some(done) = cache.get(query) {
      return done.clone();
    }
    if let Some(position) = stack.iter().position(|q| q == query) {
      let mut path: Vec<String> = stack[position..].iter().map(ToString::to_string).collect();
      path.push(query.to_string());
      return Err(ResolveError::Cycle { path });
    }

    stack.push(query.clone());
    let result = self.resolve_uncached(cache, query, stack);
    stack.pop();

    cache.insert(query.clone(), result.clone());
    result
  }

  fn resolve_uncached(
    &self,
    cache: &mut HashMap<Query, Resolved>,
    query: &Query,
    stack: &mut Vec<Query>,
  ) -> Resolved {
    if query.params.contains(&query.output) {
      return Ok(Selection::Param(query.output));
    }

    let mut satisfied = Vec::new();
    let mut reasons = Vec::new();
    for rule in self.rules.producers(query.output) {
      match self.resolve_rule(cache, rule, &query.params, stack) {
        Ok(used_params) => satisfied.push((rule.id.clone(), used_params)),
        Err(error @ ResolveError::Unsatisfiable { .. }) => {
          reasons.push(format!("{}: {}", rule.id, error));
        }
        Err(error) => return Err(error),
      }
    }

    match satisfied.len() {
      0 => Err(ResolveError::Unsatisfiable {
        output: query.output,
        params: query.param_list(),
        reasons,
      }),
      1 => {
        let (rule, used_params) = satisfied.remove(0);
        Ok(Selection::Rule { rule, used_params })
      }
      _ => Err(ResolveError::Ambiguous {
        output: query.output,
        params: query.param_list(),
        candidates: satisfied.into_iter().map(|(rule, _)| rule).collect(),
      }),
    }
  }

  /// Check every input and get of `rule` against the available params and
  /// return the param types the rule consumes.
  fn resolve_rule(
    &self,
    cache: &mut HashMap<Query, Resolved>,
    rule: &Rule<B>,
    available: &BTreeSet<TypeKey>,
    stack: &mut Vec<Query>,
  ) -> Result<BTreeSet<TypeKey>, ResolveError> {
    let mut used = BTreeSet::new();

    for input in &rule.inputs {
      let query = Query {
        output: *input,
        params: available.clone(),
      };
      let selection = self.resolve_in(cache, &query, stack)?;
      self.check_effects(rule, &selection)?;
      used.extend(selection.used_params());
    }

    for get in &rule.gets {
      let mut params = available.clone();
      params.extend(get.provided.iter().copied());
      let query = Query {
        output: get.output,
        params,
      };
      let selection = self.resolve_in(cache, &query, stack)?;
      self.check_effects(rule, &selection)?;
      used.extend(
        selection
          .used_params()
          .into_iter()
          .filter(|key| !get.provided.contains(key)),
      );
    }

    Ok(used)
  }

  fn check_effects(&self, rule: &Rule<B>, selection: &Selection) -> Result<(), ResolveError> {
    if rule.side_effecting {
      return Ok(());
    }
    if let Some(dependency) = selection.rule()
      && self
        .rules
        .get(dependency)
        .is_some_and(|dependency| dependency.side_effecting)
    {
      return Err(ResolveError::SideEffectInGet {
        rule: rule.id.clone(),
        dependency: dependency.clone(),
      });
    }
    Ok(())
  }
}

/// Queries a rule issues when run with `available` params.
pub fn dependency_queries<B>(rule: &Rule<B>, available: &BTreeSet<TypeKey>) -> Vec<Query> {
  let inputs = rule.inputs.iter().map(|input| Query {
    output: *input,
    params: available.clone(),
  });
  let gets = rule.gets.iter().map(|get| {
    let mut params = available.clone();
    params.extend(get.provided.iter().copied());
    Query {
      output: get.output,
      params,
    }
  });
  inputs.chain(gets).collect()
}
