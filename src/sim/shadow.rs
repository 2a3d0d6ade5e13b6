use itertools::Itertools;
use std::{
    cell::RefCell,
    sync::{Arc, atomic::{AtomicU64, Ordering}},
};

use crate::{
    engine::{
        scope::{DistributionScope, Scope, SharedRng},
        value::EngineValue,
    },
    entity::{EntityKind, EntityRef, EntityState, Substep, program::Program},
    error::{EngineError, VeldResult},
    geom::GeoKey,
    sim::{Replicate, StepCount},
};

/// Synthetic `meta` values visible to every handler during a timestep.
#[derive(Debug, Clone)]
pub struct MetaState {
    pub step_count: StepCount,
    pub year: i64,
    pub replicate: Replicate,
    pub patch_count: usize,
}

/// Everything a substep resolution needs besides the entity itself: the
/// program, the enclosing patch (`here`), `meta`, the patch RNG, and the
/// sequence counter for spawned organisms.
pub struct StepContext {
    pub(crate) program: Arc<Program>,
    pub(crate) here: Option<EntityRef>,
    pub(crate) meta: MetaState,
    pub(crate) rng: SharedRng,
    pub(crate) sequence: Arc<AtomicU64>,
}

/// The per-entity shadowing view for one substep.
///
/// `prior.X` reads the frozen snapshot; `current.X` and bare names resolve
/// on demand within this substep (memoized, cycle-checked); `here` reaches
/// the enclosing patch and `meta` the step counters. The entity's lock is
/// held by the caller for the whole resolution, so interior access goes
/// through a `RefCell` instead of re-locking.
pub struct ShadowScope<'a> {
    entity: &'a EntityRef,
    state: RefCell<&'a mut EntityState>,
    substep: Substep,
    ctx: &'a StepContext,
}

/// Resolves every attribute the entity's type names, in deterministic
/// order, for one substep. The entity lock is held for the duration.
pub(crate) fn resolve_substep(
    entity: &EntityRef,
    substep: Substep,
    ctx: &StepContext,
) -> VeldResult<()> {
    let attrs: Vec<Arc<str>> = entity.prototype().all_attributes().cloned().collect();
    let mut guard = entity.lock();
    guard.begin_substep();
    let scope = ShadowScope {
        entity,
        state: RefCell::new(&mut *guard),
        substep,
        ctx,
    };
    for attr in &attrs {
        scope.resolve_opt(attr)?;
    }
    Ok(())
}

impl ShadowScope<'_> {
    fn resolve(&self, name: &str) -> VeldResult<EngineValue> {
        let attr: Arc<str> = Arc::from(name);
        self.resolve_opt(&attr)?
            .ok_or_else(|| EngineError::AttributeUnset(name.to_string()).into())
    }

    /// The resolution algorithm for one attribute in the active substep.
    ///
    /// `None` means the attribute is unset: no handler produced a value and
    /// neither the timestep nor the frozen snapshot carries one.
    fn resolve_opt(&self, attr: &Arc<str>) -> VeldResult<Option<EngineValue>> {
        {
            let state = self.state.borrow();
            if state.resolved.contains(attr) {
                return Ok(state.current.get(attr).cloned());
            }
            if state.in_flight.iter().any(|a| a == attr) {
                let chain = state
                    .in_flight
                    .iter()
                    .map(|a| a.as_ref())
                    .chain(std::iter::once(attr.as_ref()))
                    .join(" -> ");
                return Err(EngineError::CyclicDependency(chain).into());
            }
        }

        let prototype = self.entity.prototype().clone();

        // Fast path: statically known to have no handler in this substep.
        // Must stay observationally identical to running an empty group.
        if prototype.is_fast_path(attr, self.substep) {
            return Ok(self.fallback(attr));
        }

        let state_name = self.state.borrow().state_name.clone();
        let group = prototype
            .active_group(attr, self.substep, state_name.as_ref())
            .cloned();
        let Some(group) = group else {
            return Ok(self.fallback(attr));
        };

        self.state.borrow_mut().in_flight.push(attr.clone());
        let outcome = group.fire_first(self);
        self.state.borrow_mut().in_flight.pop();

        match outcome? {
            Some(value) => {
                let mut state = self.state.borrow_mut();
                state.current.insert(attr.clone(), value.clone());
                state.resolved.insert(attr.clone());
                // A handler returning a new string for `state` moves the
                // state machine within its substep.
                if attr.as_ref() == "state"
                    && let EngineValue::Str(next_state) = &value
                {
                    state.state_name = Some(Arc::from(next_state.as_str()));
                }
                Ok(Some(value))
            }
            // No selector fired: copy the prior value forward. Conditional
            // handlers never cause attribute loss.
            None => Ok(self.fallback(attr)),
        }
    }

    /// Carry-forward: the value set earlier this timestep wins, then the
    /// frozen prior. Marks the attribute resolved either way.
    fn fallback(&self, attr: &Arc<str>) -> Option<EngineValue> {
        let mut state = self.state.borrow_mut();
        state.resolved.insert(attr.clone());
        if let Some(value) = state.current.get(attr) {
            return Some(value.clone());
        }
        if let Some(value) = state.prior.get(attr).cloned() {
            state.current.insert(attr.clone(), value.clone());
            return Some(value);
        }
        None
    }

    fn meta_value(&self, field: &str) -> VeldResult<EngineValue> {
        let meta = &self.ctx.meta;
        match field {
            "stepCount" => Ok(EngineValue::count(meta.step_count.0 as i64)),
            "year" => Ok(EngineValue::count(meta.year)),
            "replicate" => Ok(EngineValue::count(meta.replicate.0 as i64)),
            "patchCount" => Ok(EngineValue::count(meta.patch_count as i64)),
            other => Err(EngineError::UnknownName(format!("meta.{other}")).into()),
        }
    }

    fn here(&self) -> VeldResult<&EntityRef> {
        self.ctx
            .here
            .as_ref()
            .ok_or_else(|| EngineError::UnknownName("here".to_string()).into())
    }

    /// Reads `rest` on the enclosing patch, routing through the resolver
    /// when `here` is the entity under evaluation (its lock is already
    /// held).
    fn here_attribute(&self, rest: &str) -> VeldResult<EngineValue> {
        let here = self.here()?;
        if here.same(self.entity) {
            self.resolve(rest)
        } else {
            here.peek_attribute(rest)
        }
    }

    /// `X.Y` where `X` is an attribute: projects `Y` over an entity
    /// collection, or reads `Y` on a single referenced entity.
    fn projected(&self, head: &str, rest: &str) -> VeldResult<EngineValue> {
        match self.resolve(head)? {
            EngineValue::Entities(refs) => DistributionScope::new(refs).get(rest),
            EngineValue::Entity(entity) => {
                if entity.same(self.entity) {
                    self.resolve(rest)
                } else {
                    entity.peek_attribute(rest)
                }
            }
            other => Err(crate::engine::value::type_mismatch("entity or entities", &other)),
        }
    }
}

impl Scope for ShadowScope<'_> {
    fn get(&self, name: &str) -> VeldResult<EngineValue> {
        if let Some(rest) = name.strip_prefix("prior.") {
            let key: Arc<str> = Arc::from(rest);
            return self
                .state
                .borrow()
                .prior
                .get(&key)
                .cloned()
                .ok_or_else(|| EngineError::AttributeUnset(name.to_string()).into());
        }
        if let Some(rest) = name.strip_prefix("current.") {
            return self.resolve(rest);
        }
        if let Some(rest) = name.strip_prefix("meta.") {
            return self.meta_value(rest);
        }
        if name == "here" {
            return Ok(EngineValue::Entity(self.here()?.clone()));
        }
        if let Some(rest) = name.strip_prefix("here.") {
            return self.here_attribute(rest);
        }
        if let Some((head, rest)) = name.split_once('.') {
            return self.projected(head, rest);
        }
        self.resolve(name)
    }

    fn has(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    fn attributes(&self) -> Vec<String> {
        self.entity
            .prototype()
            .all_attributes()
            .map(|a| a.to_string())
            .collect()
    }

    fn rng(&self) -> Option<SharedRng> {
        Some(self.ctx.rng.clone())
    }

    fn converter(&self) -> Option<Arc<crate::engine::convert::Converter>> {
        Some(self.ctx.program.converter().clone())
    }

    /// Creates organisms at the enclosing patch's location. The new
    /// entities carry their seeds; their `init` pass runs once the owning
    /// patch's substep resolution has finished.
    fn spawn(&self, type_name: &str, count: usize) -> VeldResult<EngineValue> {
        let prototype = self.ctx.program.prototype(type_name)?.clone();
        if prototype.kind() == EntityKind::Simulation {
            return Err(EngineError::UnknownEntity(type_name.to_string()).into());
        }

        let site = self
            .ctx
            .here
            .as_ref()
            .unwrap_or(self.entity)
            .geo_key();

        let refs = (0..count)
            .map(|_| {
                let sequence = self.ctx.sequence.fetch_add(1, Ordering::Relaxed);
                EntityRef::new(
                    prototype.clone(),
                    GeoKey::new(site.lat(), site.lon(), sequence),
                    None,
                )
            })
            .collect();
        Ok(EngineValue::Entities(refs))
    }
}
