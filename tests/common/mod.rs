#![allow(dead_code)]

use std::sync::Arc;

use veld::{
    EngineValue, VeldResult,
    engine::{
        callable::{CompiledCallable, CompiledSelector},
        scope::Scope,
        units::Units,
    },
    entity::{
        EntityKind, Substep,
        handler::EventHandler,
        prototype::{EntityPrototype, PrototypeBuilder},
    },
    output::{MemorySink, OutputKind, row::ExportRow},
};

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn years() -> Units {
    Units::of("years").unwrap()
}

pub fn callable<F>(f: F) -> Arc<dyn CompiledCallable>
where
    F: Fn(&dyn Scope) -> VeldResult<EngineValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn selector<F>(f: F) -> Arc<dyn CompiledSelector>
where
    F: Fn(&dyn Scope) -> VeldResult<bool> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler producing a constant integer count.
pub fn constant_count(n: i64) -> EventHandler {
    EventHandler::new(callable(move |_| Ok(EngineValue::count(n))))
}

/// An organism type aging by one year per step: `age.init = 0 years`,
/// `age.step = prior.age + 1 year`.
pub fn aging_organism(type_name: &str) -> EntityPrototype {
    PrototypeBuilder::new(EntityKind::Organism, type_name)
        .handler(
            "age",
            Substep::Init,
            EventHandler::new(callable(|_| Ok(EngineValue::int(0, years())))),
        )
        .handler(
            "age",
            Substep::Step,
            EventHandler::new(callable(|scope| {
                let conv = scope.converter().expect("simulation converter");
                let prior = scope.get("prior.age")?;
                prior.add(&EngineValue::int(1, years()), &conv)
            })),
        )
        .build()
        .unwrap()
}

/// An empty simulation prototype.
pub fn simulation(name: &str) -> EntityPrototype {
    PrototypeBuilder::new(EntityKind::Simulation, name)
        .build()
        .unwrap()
}

/// Organism rows of a given type at a given step.
pub fn organism_rows(sink: &MemorySink, type_name: &str, step: u64) -> Vec<ExportRow> {
    sink.rows()
        .into_iter()
        .filter(|(kind, row)| {
            *kind == OutputKind::Organism && row.type_name == type_name && row.step.0 == step
        })
        .map(|(_, row)| row)
        .collect()
}

/// All organism rows of a given type across the run.
pub fn all_organism_rows(sink: &MemorySink, type_name: &str) -> Vec<ExportRow> {
    sink.rows()
        .into_iter()
        .filter(|(kind, row)| *kind == OutputKind::Organism && row.type_name == type_name)
        .map(|(_, row)| row)
        .collect()
}
