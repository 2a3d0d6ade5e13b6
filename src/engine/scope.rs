use rand::rngs::StdRng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    engine::{distribution::Distribution, units::Units, value::EngineValue},
    error::{EngineError, VeldResult},
    entity::EntityRef,
};

/// RNG handle threaded through scopes so handlers can sample distributions
/// deterministically.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Names the runtime claims for itself. User attributes may not shadow them.
pub const RESERVED_NAMES: [&str; 4] = ["prior", "current", "here", "meta"];

pub fn is_reserved(name: &str) -> bool {
    let head = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES.contains(&head)
}

/// Variable resolution surface handed to compiled callables and selectors.
pub trait Scope {
    fn get(&self, name: &str) -> VeldResult<EngineValue>;

    fn has(&self, name: &str) -> bool;

    /// The attribute names this scope exposes, for discovery and debugging.
    fn attributes(&self) -> Vec<String>;

    /// RNG for sampling; absent outside a running simulation.
    fn rng(&self) -> Option<SharedRng> {
        None
    }

    /// Creates `count` organisms of `type_name` at the evaluation site.
    /// Only the shadowing scope of a running simulation can do this.
    fn spawn(&self, type_name: &str, count: usize) -> VeldResult<EngineValue> {
        let _ = count;
        Err(EngineError::UnknownEntity(type_name.to_string()).into())
    }

    /// The program's conversion graph, for unit-aware arithmetic inside
    /// compiled expressions. Absent outside a program context.
    fn converter(&self) -> Option<Arc<crate::engine::convert::Converter>> {
        None
    }
}

/// Exposes exactly one name: `current`.
#[derive(Debug, Clone)]
pub struct SingleValueScope {
    value: EngineValue,
}

impl SingleValueScope {
    pub fn new(value: EngineValue) -> Self {
        Self { value }
    }
}

impl Scope for SingleValueScope {
    fn get(&self, name: &str) -> VeldResult<EngineValue> {
        if name == "current" {
            Ok(self.value.clone())
        } else {
            Err(EngineError::UnknownName(name.to_string()).into())
        }
    }

    fn has(&self, name: &str) -> bool {
        name == "current"
    }

    fn attributes(&self) -> Vec<String> {
        vec!["current".to_string()]
    }
}

/// Exposes an entity's attribute names, reading the current value when the
/// substep has produced one and the frozen prior otherwise.
#[derive(Debug, Clone)]
pub struct EntityScope {
    entity: EntityRef,
}

impl EntityScope {
    pub fn new(entity: EntityRef) -> Self {
        Self { entity }
    }
}

impl Scope for EntityScope {
    fn get(&self, name: &str) -> VeldResult<EngineValue> {
        self.entity.peek_attribute(name)
    }

    fn has(&self, name: &str) -> bool {
        self.entity.has_attribute(name)
    }

    fn attributes(&self) -> Vec<String> {
        self.entity.attribute_names()
    }
}

/// Projects a named attribute across a collection of entities, yielding a
/// realized distribution of the member values.
#[derive(Debug, Clone)]
pub struct DistributionScope {
    entities: Vec<EntityRef>,
}

impl DistributionScope {
    pub fn new(entities: Vec<EntityRef>) -> Self {
        Self { entities }
    }
}

impl Scope for DistributionScope {
    fn get(&self, name: &str) -> VeldResult<EngineValue> {
        let mut samples = Vec::with_capacity(self.entities.len());
        let mut units: Option<Units> = None;

        for entity in &self.entities {
            let value = entity.peek_attribute(name)?;
            let value_units = value
                .units()
                .cloned()
                .ok_or_else(|| crate::engine::value::type_mismatch("number", &value))?;
            match &units {
                None => units = Some(value_units),
                Some(expected) if *expected == value_units => {}
                Some(expected) => {
                    return Err(EngineError::UnitMismatch {
                        left: expected.to_string(),
                        right: value_units.to_string(),
                    }
                    .into());
                }
            }
            samples.push(value.as_real()?);
        }

        Ok(EngineValue::Distribution(Distribution::realized(
            samples,
            units.unwrap_or_else(Units::empty),
        )))
    }

    fn has(&self, name: &str) -> bool {
        self.entities.iter().any(|e| e.has_attribute(name))
    }

    fn attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entities
            .iter()
            .flat_map(|e| e.attribute_names())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Immutable-constant overlay on a containing scope. Constants are defined
/// once; redefinition is an error.
pub struct LocalScope<'a> {
    parent: &'a dyn Scope,
    constants: HashMap<String, EngineValue>,
}

impl<'a> LocalScope<'a> {
    pub fn new(parent: &'a dyn Scope) -> Self {
        Self {
            parent,
            constants: HashMap::new(),
        }
    }

    pub fn define(&mut self, name: &str, value: EngineValue) -> VeldResult<()> {
        if self.constants.contains_key(name) {
            return Err(EngineError::ImmutableConstant(name.to_string()).into());
        }
        self.constants.insert(name.to_string(), value);
        Ok(())
    }
}

impl Scope for LocalScope<'_> {
    fn get(&self, name: &str) -> VeldResult<EngineValue> {
        match self.constants.get(name) {
            Some(value) => Ok(value.clone()),
            None => self.parent.get(name),
        }
    }

    fn has(&self, name: &str) -> bool {
        self.constants.contains_key(name) || self.parent.has(name)
    }

    fn attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constants.keys().cloned().collect();
        names.extend(self.parent.attributes());
        names.sort();
        names.dedup();
        names
    }

    fn rng(&self) -> Option<SharedRng> {
        self.parent.rng()
    }

    fn spawn(&self, type_name: &str, count: usize) -> VeldResult<EngineValue> {
        self.parent.spawn(type_name, count)
    }

    fn converter(&self) -> Option<Arc<crate::engine::convert::Converter>> {
        self.parent.converter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("prior"));
        assert!(is_reserved("meta.stepCount"));
        assert!(!is_reserved("age"));
        assert!(!is_reserved("priority"), "prefix match is not enough");
    }

    #[test]
    fn test_single_value_scope() {
        let scope = SingleValueScope::new(EngineValue::count(5));
        assert!(scope.has("current"));
        assert!(!scope.has("other"));
        assert!(scope.get("current").unwrap().approx_eq(&EngineValue::count(5)));
        assert!(scope.get("other").is_err());
    }

    #[test]
    fn test_local_scope_overlays_and_rejects_redefinition() {
        let base = SingleValueScope::new(EngineValue::count(1));
        let mut local = LocalScope::new(&base);
        local.define("k", EngineValue::count(10)).unwrap();

        assert!(local.get("k").unwrap().approx_eq(&EngineValue::count(10)));
        assert!(local.get("current").unwrap().approx_eq(&EngineValue::count(1)));

        let err = local.define("k", EngineValue::count(11)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Engine(EngineError::ImmutableConstant(_))
        ));
    }
}
