pub mod handler;
pub mod program;
pub mod prototype;

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use strum::{Display, EnumIter, IntoStaticStr};
use strum_macros::EnumString;

use crate::{
    engine::value::EngineValue,
    entity::prototype::EntityPrototype,
    error::{EngineError, VeldResult},
    geom::{GeoKey, Geometry},
    sorted_vec_map::SortedVecMap,
};

/// What an entity is within the simulation's ownership forest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Simulation,
    Patch,
    Organism,
}

/// A phase within a timestep. `Init` runs once at timestep 0 before `Start`;
/// the remaining phases run in declaration order every timestep.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Substep {
    Init,
    Start,
    Step,
    End,
}

impl Substep {
    /// The phases run every timestep, in order.
    pub const PHASES: [Substep; 3] = [Substep::Start, Substep::Step, Substep::End];
}

/// Key addressing one event-handler group: attribute, substep, and the
/// optional state scoping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub attribute: Arc<str>,
    pub substep: Substep,
    pub state: Option<Arc<str>>,
}

impl EventKey {
    pub fn new(attribute: &str, substep: Substep) -> Self {
        Self {
            attribute: Arc::from(attribute),
            substep,
            state: None,
        }
    }

    pub fn in_state(attribute: &str, substep: Substep, state: &str) -> Self {
        Self {
            attribute: Arc::from(attribute),
            substep,
            state: Some(Arc::from(state)),
        }
    }
}

/// Per-entity mutable state: the in-progress `current` map, the frozen
/// `prior` snapshot, the state-machine position, and the bookkeeping the
/// resolver uses for memoization and cycle detection within one substep.
#[derive(Debug)]
pub struct EntityState {
    pub(crate) current: SortedVecMap<Arc<str>, EngineValue>,
    pub(crate) prior: Arc<SortedVecMap<Arc<str>, EngineValue>>,
    pub(crate) state_name: Option<Arc<str>>,
    pub(crate) resolved: HashSet<Arc<str>>,
    pub(crate) in_flight: Vec<Arc<str>>,
    /// False until the entity's `init` pass has run. Organisms spawned
    /// mid-run start false; the stepper initializes them once their owning
    /// patch's substep resolution has released its lock.
    pub(crate) initialized: bool,
}

impl EntityState {
    fn seeded(prototype: &EntityPrototype) -> Self {
        let mut prior = SortedVecMap::new();
        for (name, value) in prototype.seeds() {
            prior.insert(name.clone(), value.clone());
        }
        Self {
            current: SortedVecMap::new(),
            prior: Arc::new(prior),
            state_name: prototype.initial_state().cloned(),
            resolved: HashSet::new(),
            in_flight: Vec::new(),
            initialized: false,
        }
    }

    /// Starts a new timestep: `current` begins empty so the resolver can
    /// tell fresh assignments from carried-over priors.
    pub(crate) fn begin_timestep(&mut self) {
        self.current.clear();
        self.resolved.clear();
        self.in_flight.clear();
    }

    /// Starts a new substep: memoization resets, assignments persist.
    pub(crate) fn begin_substep(&mut self) {
        self.resolved.clear();
        self.in_flight.clear();
    }

    /// Freezes the timestep's results into the new prior snapshot.
    /// Untouched attributes carry their old prior value forward.
    pub(crate) fn freeze(&mut self) {
        let mut next: SortedVecMap<Arc<str>, EngineValue> = (*self.prior).clone();
        for (name, value) in self.current.iter() {
            next.insert(name.clone(), value.clone());
        }
        self.prior = Arc::new(next);
    }
}

struct EntityCell {
    prototype: Arc<EntityPrototype>,
    geo_key: GeoKey,
    geometry: Option<Geometry>,
    mutable: Mutex<EntityState>,
}

/// Shared reference to a live entity.
///
/// Cloning is cheap; the mutable state behind the entity's own lock is held
/// for the duration of a single substep resolution on that entity.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    pub fn new(
        prototype: Arc<EntityPrototype>,
        geo_key: GeoKey,
        geometry: Option<Geometry>,
    ) -> Self {
        let state = EntityState::seeded(&prototype);
        Self(Arc::new(EntityCell {
            prototype,
            geo_key,
            geometry,
            mutable: Mutex::new(state),
        }))
    }

    pub fn kind(&self) -> EntityKind {
        self.0.prototype.kind()
    }

    pub fn type_name(&self) -> &str {
        self.0.prototype.type_name()
    }

    pub fn prototype(&self) -> &Arc<EntityPrototype> {
        &self.0.prototype
    }

    pub fn geo_key(&self) -> GeoKey {
        self.0.geo_key
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.0.geometry.as_ref()
    }

    /// Globally unique display name: type plus geo key.
    pub fn name(&self) -> String {
        format!("{}@{}", self.type_name(), self.geo_key())
    }

    pub fn same(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable identity for deduplication during discovery.
    pub fn ref_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn state_name(&self) -> Option<Arc<str>> {
        self.lock().state_name.clone()
    }

    /// Reads an attribute from outside the entity's own resolution: the
    /// current value when this timestep has produced one, the frozen prior
    /// otherwise.
    pub fn peek_attribute(&self, name: &str) -> VeldResult<EngineValue> {
        let key: Arc<str> = Arc::from(name);
        let state = self.lock();
        if let Some(value) = state.current.get(&key) {
            return Ok(value.clone());
        }
        if let Some(value) = state.prior.get(&key) {
            return Ok(value.clone());
        }
        Err(EngineError::AttributeUnset(name.to_string()).into())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        let key: Arc<str> = Arc::from(name);
        let state = self.lock();
        state.current.contains_key(&key) || state.prior.contains_key(&key)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let state = self.lock();
        let mut names: Vec<String> = state
            .current
            .keys()
            .chain(state.prior.keys())
            .map(|k| k.to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Frozen snapshot from the previous timestep.
    pub fn prior_snapshot(&self) -> Arc<SortedVecMap<Arc<str>, EngineValue>> {
        self.lock().prior.clone()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub(crate) fn mark_initialized(&self) {
        self.lock().initialized = true;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntityState> {
        self.0
            .mutable
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({})", self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        engine::units::Units,
        entity::prototype::PrototypeBuilder,
        geom::{Lat, Lon},
    };

    fn tree_prototype() -> Arc<EntityPrototype> {
        Arc::new(
            PrototypeBuilder::new(EntityKind::Organism, "Tree")
                .seed("age", EngineValue::int(0, Units::of("years").unwrap()))
                .build()
                .unwrap(),
        )
    }

    fn tree() -> EntityRef {
        EntityRef::new(tree_prototype(), GeoKey::new(Lat(1.0), Lon(2.0), 0), None)
    }

    #[test]
    fn test_seeds_land_in_prior() {
        let entity = tree();
        let age = entity.peek_attribute("age").unwrap();
        assert!(age.approx_eq(&EngineValue::int(0, Units::of("years").unwrap())));
    }

    #[test]
    fn test_peek_prefers_current_over_prior() {
        let entity = tree();
        {
            let mut state = entity.lock();
            state
                .current
                .insert(Arc::from("age"), EngineValue::int(3, Units::of("years").unwrap()));
        }
        let age = entity.peek_attribute("age").unwrap();
        assert!(age.approx_eq(&EngineValue::int(3, Units::of("years").unwrap())));
    }

    #[test]
    fn test_missing_attribute_is_unset() {
        let entity = tree();
        let err = entity.peek_attribute("height").unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Engine(EngineError::AttributeUnset(_))
        ));
    }

    #[test]
    fn test_freeze_carries_untouched_priors() {
        let entity = tree();
        {
            let mut state = entity.lock();
            state.begin_timestep();
            state
                .current
                .insert(Arc::from("height"), EngineValue::decimal(1.5, Units::of("m").unwrap()));
            state.freeze();
        }
        // age came from seeds and was never touched this timestep.
        assert!(entity.has_attribute("age"));
        assert!(entity.has_attribute("height"));
    }

    #[test]
    fn test_begin_timestep_clears_current_only() {
        let entity = tree();
        {
            let mut state = entity.lock();
            state
                .current
                .insert(Arc::from("age"), EngineValue::int(9, Units::of("years").unwrap()));
            state.freeze();
            state.begin_timestep();
        }
        // The frozen 9 survives in prior; current is empty again.
        let age = entity.peek_attribute("age").unwrap();
        assert!(age.approx_eq(&EngineValue::int(9, Units::of("years").unwrap())));
    }
}
