use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex, atomic::AtomicU64},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    engine::{scope::SharedRng, value::EngineValue},
    entity::{EntityKind, EntityRef, Substep, program::Program},
    error::{SystemError, VeldResult},
    geom::{GeoKey, Lat, Lon},
    output::{OutputKind, RowSink, row::ExportRow},
    sim::{
        Replicate, StepCount,
        shadow::{MetaState, StepContext, resolve_substep},
    },
};

/// Run-wide knobs for the stepper.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of timesteps per replicate.
    pub steps: u64,
    /// Number of independent replicates.
    pub replicates: u32,
    /// Base seed; each replicate and patch derives its own stream.
    pub seed: u64,
    /// Calendar year reported as `meta.year` at timestep 0.
    pub start_year: i64,
    /// Cooperative cancellation, checked at substep boundaries.
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            steps: 1,
            replicates: 1,
            seed: 0,
            start_year: 0,
            cancel: CancellationToken::new(),
        }
    }
}

struct PatchSlot {
    patch: EntityRef,
    organisms: Vec<EntityRef>,
    rng: SharedRng,
}

/// The simulation driver.
///
/// Per timestep: run each substep in phase order across the simulation
/// entity, every patch (parallel), and each patch's living organisms; after
/// `step` (and again after `end`) re-read organism collections to refresh
/// the living set; freeze results into the prior snapshot; emit one export
/// row per entity.
pub struct Stepper {
    program: Arc<Program>,
}

impl Stepper {
    pub fn new(program: Arc<Program>) -> Self {
        Self { program }
    }

    /// Runs all replicates. Replicates are independent and run in parallel;
    /// the first failure per run surfaces.
    pub fn run(&self, simulation: &str, opts: &RunOptions, sink: &dyn RowSink) -> VeldResult<()> {
        self.program.simulation(simulation)?;
        if opts.replicates <= 1 {
            return self.run_replicate(simulation, Replicate(0), opts, sink);
        }
        (0..opts.replicates)
            .into_par_iter()
            .try_for_each(|r| self.run_replicate(simulation, Replicate(r), opts, sink))
    }

    /// Runs one replicate from `init` through the final timestep.
    pub fn run_replicate(
        &self,
        simulation: &str,
        replicate: Replicate,
        opts: &RunOptions,
        sink: &dyn RowSink,
    ) -> VeldResult<()> {
        let program = self.program.clone();
        let sim_prototype = program.simulation(simulation)?.clone();
        info!(simulation, replicate = replicate.0, steps = opts.steps, "replicate starting");

        let replicate_seed = derive_seed(opts.seed, &replicate.0);
        let sequence = Arc::new(AtomicU64::new(1));
        let sim_entity = EntityRef::new(
            sim_prototype,
            GeoKey::new(Lat(0.0), Lon(0.0), 0),
            None,
        );
        let sim_rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(replicate_seed)));

        let mut slots: Vec<PatchSlot> = Vec::new();
        for (proto_index, prototype) in program.patch_prototypes().into_iter().enumerate() {
            for (geo, geometry) in program.grid().cells() {
                // Sequence disambiguates co-located patches of different types.
                let geo = GeoKey::new(geo.lat(), geo.lon(), proto_index as u64);
                let patch = EntityRef::new(prototype.clone(), geo, Some(geometry));
                let rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(derive_seed(
                    replicate_seed,
                    &geo,
                ))));
                slots.push(PatchSlot {
                    patch,
                    organisms: Vec::new(),
                    rng,
                });
            }
        }
        let patch_count = slots.len();

        for t in 0..opts.steps {
            if opts.cancel.is_cancelled() {
                return Err(SystemError::Cancelled.into());
            }
            let meta = MetaState {
                step_count: StepCount(t),
                year: opts.start_year + t as i64,
                replicate,
                patch_count,
            };

            sim_entity.lock().begin_timestep();
            for slot in &slots {
                slot.patch.lock().begin_timestep();
                for organism in &slot.organisms {
                    organism.lock().begin_timestep();
                }
            }

            // Initialization pass runs once, at timestep 0, before start.
            if t == 0 {
                self.run_substep(Substep::Init, &sim_entity, &mut slots, &meta, &sequence, &sim_rng)?;
            }

            for substep in Substep::PHASES {
                if opts.cancel.is_cancelled() {
                    return Err(SystemError::Cancelled.into());
                }
                self.run_substep(substep, &sim_entity, &mut slots, &meta, &sequence, &sim_rng)?;
            }

            // Freeze the timestep into the new prior snapshot, then emit.
            sim_entity.lock().freeze();
            for slot in &slots {
                slot.patch.lock().freeze();
                for organism in &slot.organisms {
                    organism.lock().freeze();
                }
            }

            emit_entity(sink, &sim_entity, &self.program, &meta)?;
            for slot in &slots {
                emit_entity(sink, &slot.patch, &self.program, &meta)?;
                for organism in &slot.organisms {
                    emit_entity(sink, organism, &self.program, &meta)?;
                }
            }
            debug!(replicate = replicate.0, step = t, "timestep complete");
        }

        info!(simulation, replicate = replicate.0, "replicate complete");
        Ok(())
    }

    fn run_substep(
        &self,
        substep: Substep,
        sim_entity: &EntityRef,
        slots: &mut [PatchSlot],
        meta: &MetaState,
        sequence: &Arc<AtomicU64>,
        sim_rng: &SharedRng,
    ) -> VeldResult<()> {
        // The simulation entity resolves before the grid.
        let sim_ctx = StepContext {
            program: self.program.clone(),
            here: None,
            meta: meta.clone(),
            rng: sim_rng.clone(),
            sequence: sequence.clone(),
        };
        resolve_substep(sim_entity, substep, &sim_ctx)?;
        initialize_spawned(sim_entity, &sim_ctx)?;

        let program = &self.program;
        let process = |slot: &mut PatchSlot| -> VeldResult<()> {
            let ctx = StepContext {
                program: program.clone(),
                here: Some(slot.patch.clone()),
                meta: meta.clone(),
                rng: slot.rng.clone(),
                sequence: sequence.clone(),
            };

            resolve_substep(&slot.patch, substep, &ctx)?;
            initialize_spawned(&slot.patch, &ctx)?;

            // Organisms share their patch's attributes and resolve after it.
            for organism in &slot.organisms {
                resolve_substep(organism, substep, &ctx)?;
                initialize_spawned(organism, &ctx)?;
            }

            // Discovery: after step (mid-timestep) the collections define
            // the living set for downstream substeps; after end they define
            // the set carried into the next timestep.
            if matches!(substep, Substep::Step | Substep::End) {
                slot.organisms = discover_organisms(&slot.patch);
            }
            Ok(())
        };

        if slots.len() > 1 {
            slots.par_iter_mut().try_for_each(process)
        } else {
            slots.iter_mut().try_for_each(process)
        }
    }
}

/// Runs the `init` pass on organisms spawned during the owner's resolution,
/// once the owner's lock has been released. Marks before resolving so a
/// self-referential spawn cannot recurse forever.
fn initialize_spawned(owner: &EntityRef, ctx: &StepContext) -> VeldResult<()> {
    let referenced: Vec<EntityRef> = {
        let guard = owner.lock();
        guard
            .current
            .values()
            .flat_map(|value| match value {
                EngineValue::Entities(refs) => refs.clone(),
                EngineValue::Entity(entity) => vec![entity.clone()],
                _ => Vec::new(),
            })
            .collect()
    };

    for entity in referenced {
        if entity.kind() != EntityKind::Organism || entity.is_initialized() || entity.same(owner) {
            continue;
        }
        entity.mark_initialized();
        resolve_substep(&entity, Substep::Init, ctx)?;
        initialize_spawned(&entity, ctx)?;
    }
    Ok(())
}

/// Reads the patch's organism-collection attributes and returns the living
/// organisms, deduplicated, in first-reference order.
fn discover_organisms(patch: &EntityRef) -> Vec<EntityRef> {
    let guard = patch.lock();
    let mut seen: HashSet<usize> = HashSet::new();
    let mut organisms = Vec::new();
    for value in guard.current.values() {
        let refs: &[EntityRef] = match value {
            EngineValue::Entities(refs) => refs,
            EngineValue::Entity(entity) => std::slice::from_ref(entity),
            _ => continue,
        };
        for entity in refs {
            if entity.kind() == EntityKind::Organism && seen.insert(entity.ref_id()) {
                organisms.push(entity.clone());
            }
        }
    }
    organisms
}

fn emit_entity(
    sink: &dyn RowSink,
    entity: &EntityRef,
    program: &Program,
    meta: &MetaState,
) -> VeldResult<()> {
    let type_name = entity.type_name().to_string();
    let columns: Vec<Arc<str>> = match program.exports_for(&type_name) {
        Some(cols) => cols.to_vec(),
        None => entity.prototype().all_attributes().cloned().collect(),
    };

    let cells = columns
        .iter()
        .map(|attr| {
            let rendered = entity
                .peek_attribute(attr)
                .map(|value| value.to_string())
                .unwrap_or_default();
            (attr.to_string(), rendered)
        })
        .collect();

    let row = ExportRow {
        entity: entity.name(),
        type_name,
        step: meta.step_count,
        replicate: meta.replicate,
        cells,
    };
    sink.emit(OutputKind::from(entity.kind()), row)
}

fn derive_seed<T: Hash>(base: u64, salt: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish()
}
