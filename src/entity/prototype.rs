use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use crate::{
    engine::{scope::is_reserved, value::EngineValue},
    entity::{
        EntityKind, EventKey, Substep,
        handler::{EventHandler, EventHandlerGroup},
    },
    error::{EngineError, VeldResult},
};

/// Per-type template: event-handler groups, the precomputed no-handler sets
/// per substep, default attribute seeds, and the initial state.
///
/// Prototypes are a deliberate flyweight — every instance of a type shares
/// one prototype; per-instance state lives on the entity.
pub struct EntityPrototype {
    kind: EntityKind,
    type_name: Arc<str>,
    handlers: HashMap<EventKey, EventHandlerGroup>,
    no_handler_by_substep: HashMap<Substep, HashSet<Arc<str>>>,
    all_attributes: BTreeSet<Arc<str>>,
    seeds: Vec<(Arc<str>, EngineValue)>,
    initial_state: Option<Arc<str>>,
}

impl EntityPrototype {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn type_name_arc(&self) -> Arc<str> {
        self.type_name.clone()
    }

    pub fn seeds(&self) -> &[(Arc<str>, EngineValue)] {
        &self.seeds
    }

    pub fn initial_state(&self) -> Option<&Arc<str>> {
        self.initial_state.as_ref()
    }

    /// Every attribute the type names anywhere: handlers or seeds.
    pub fn all_attributes(&self) -> impl Iterator<Item = &Arc<str>> {
        self.all_attributes.iter()
    }

    /// The active handler group for an attribute: the group scoped to the
    /// entity's current state when one exists, the default group otherwise.
    pub fn active_group(
        &self,
        attribute: &Arc<str>,
        substep: Substep,
        state: Option<&Arc<str>>,
    ) -> Option<&EventHandlerGroup> {
        if let Some(state) = state {
            let scoped = EventKey {
                attribute: attribute.clone(),
                substep,
                state: Some(state.clone()),
            };
            if let Some(group) = self.handlers.get(&scoped) {
                return Some(group);
            }
        }
        self.handlers.get(&EventKey {
            attribute: attribute.clone(),
            substep,
            state: None,
        })
    }

    /// Fast-path hint: no handler group (in any state) touches `attribute`
    /// during `substep`. Purely an optimization — the resolver's prior
    /// fallback makes it observationally equivalent to running an empty
    /// group.
    pub fn is_fast_path(&self, attribute: &Arc<str>, substep: Substep) -> bool {
        self.no_handler_by_substep
            .get(&substep)
            .is_some_and(|set| set.contains(attribute))
    }
}

impl std::fmt::Debug for EntityPrototype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EntityPrototype({} {}, {} attrs)",
            self.kind,
            self.type_name,
            self.all_attributes.len()
        )
    }
}

/// Collects a type's handlers and seeds during program build.
pub struct PrototypeBuilder {
    kind: EntityKind,
    type_name: Arc<str>,
    handlers: HashMap<EventKey, EventHandlerGroup>,
    seeds: Vec<(Arc<str>, EngineValue)>,
    initial_state: Option<Arc<str>>,
}

impl PrototypeBuilder {
    pub fn new(kind: EntityKind, type_name: &str) -> Self {
        Self {
            kind,
            type_name: Arc::from(type_name),
            handlers: HashMap::new(),
            seeds: Vec::new(),
            initial_state: None,
        }
    }

    /// Appends a handler to the default group for `(attribute, substep)`.
    pub fn handler(mut self, attribute: &str, substep: Substep, handler: EventHandler) -> Self {
        self.handlers
            .entry(EventKey::new(attribute, substep))
            .or_default()
            .push(handler);
        self
    }

    /// Appends a handler to a state-scoped group.
    pub fn state_handler(
        mut self,
        attribute: &str,
        substep: Substep,
        state: &str,
        handler: EventHandler,
    ) -> Self {
        self.handlers
            .entry(EventKey::in_state(attribute, substep, state))
            .or_default()
            .push(handler);
        self
    }

    /// Default value present in the prior snapshot before the first timestep.
    pub fn seed(mut self, attribute: &str, value: EngineValue) -> Self {
        self.seeds.push((Arc::from(attribute), value));
        self
    }

    pub fn initial_state(mut self, state: &str) -> Self {
        self.initial_state = Some(Arc::from(state));
        self
    }

    pub fn build(self) -> VeldResult<EntityPrototype> {
        let mut all_attributes: BTreeSet<Arc<str>> = BTreeSet::new();
        for key in self.handlers.keys() {
            all_attributes.insert(key.attribute.clone());
        }
        for (name, _) in &self.seeds {
            all_attributes.insert(name.clone());
        }

        for name in &all_attributes {
            if is_reserved(name) {
                return Err(EngineError::ReservedName(name.to_string()).into());
            }
        }

        // The no-handler set per substep, computed once at build time.
        let mut no_handler_by_substep: HashMap<Substep, HashSet<Arc<str>>> = HashMap::new();
        for substep in [Substep::Init, Substep::Start, Substep::Step, Substep::End] {
            let handled: HashSet<&Arc<str>> = self
                .handlers
                .keys()
                .filter(|k| k.substep == substep)
                .map(|k| &k.attribute)
                .collect();
            let unhandled = all_attributes
                .iter()
                .filter(|a| !handled.contains(*a))
                .cloned()
                .collect();
            no_handler_by_substep.insert(substep, unhandled);
        }

        Ok(EntityPrototype {
            kind: self.kind,
            type_name: self.type_name,
            handlers: self.handlers,
            no_handler_by_substep,
            all_attributes,
            seeds: self.seeds,
            initial_state: self.initial_state,
        })
    }
}
