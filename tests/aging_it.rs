mod common;

use std::{collections::HashMap, sync::Arc};

use common::{aging_organism, all_organism_rows, callable, organism_rows, simulation};
use veld::{
    ProgramBuilder, Stepper,
    entity::{EntityKind, Substep, handler::EventHandler, prototype::PrototypeBuilder},
    output::MemorySink,
    sim::stepper::RunOptions,
};

/// Basic aging: one patch, 10 organisms created at `init`, ages increment
/// by one year per step. Five timesteps yield 50 rows with ages 0 through 4
/// appearing 10 times each.
#[test]
fn test_basic_aging_five_steps() {
    common::init_test_logging();
    let program = ProgramBuilder::new()
        .simulation(simulation("Main"))
        .prototype(
            PrototypeBuilder::new(EntityKind::Patch, "Field")
                .handler(
                    "Trees",
                    Substep::Init,
                    EventHandler::new(callable(|scope| scope.spawn("Tree", 10))),
                )
                .build()
                .unwrap(),
        )
        .prototype(aging_organism("Tree"))
        .build()
        .unwrap();

    let sink = MemorySink::new();
    let stepper = Stepper::new(Arc::new(program));
    stepper
        .run(
            "Main",
            &RunOptions {
                steps: 5,
                ..Default::default()
            },
            &sink,
        )
        .unwrap();

    let rows = all_organism_rows(&sink, "Tree");
    assert_eq!(rows.len(), 50, "10 organisms x 5 timesteps");

    // Ages {0,1,2,3,4} appear 10 times each, and age == step.
    let mut age_counts: HashMap<String, usize> = HashMap::new();
    for row in &rows {
        let age = row.cell("age").expect("age column").to_string();
        assert_eq!(age, row.step.0.to_string(), "age equals timestep");
        *age_counts.entry(age).or_insert(0) += 1;
    }
    for age in ["0", "1", "2", "3", "4"] {
        assert_eq!(age_counts.get(age), Some(&10), "age {age} appears 10 times");
    }
}

/// Replicates are independent and tagged: two replicates double the rows
/// and every row carries its replicate number.
#[test]
fn test_replicates_are_tagged_and_independent() {
    let program = ProgramBuilder::new()
        .simulation(simulation("Main"))
        .prototype(
            PrototypeBuilder::new(EntityKind::Patch, "Field")
                .handler(
                    "Trees",
                    Substep::Init,
                    EventHandler::new(callable(|scope| scope.spawn("Tree", 4))),
                )
                .build()
                .unwrap(),
        )
        .prototype(aging_organism("Tree"))
        .build()
        .unwrap();

    let sink = MemorySink::new();
    Stepper::new(Arc::new(program))
        .run(
            "Main",
            &RunOptions {
                steps: 3,
                replicates: 2,
                ..Default::default()
            },
            &sink,
        )
        .unwrap();

    let rows = all_organism_rows(&sink, "Tree");
    assert_eq!(rows.len(), 24, "4 organisms x 3 steps x 2 replicates");

    for replicate in [0u32, 1] {
        let per_replicate = rows.iter().filter(|r| r.replicate.0 == replicate).count();
        assert_eq!(per_replicate, 12, "replicate {replicate} emits its own rows");
    }

    // Within a replicate, rows for one entity arrive in increasing step order.
    let mut last_step: HashMap<(u32, String), u64> = HashMap::new();
    for row in &rows {
        let key = (row.replicate.0, row.entity.clone());
        if let Some(prev) = last_step.get(&key) {
            assert!(row.step.0 > *prev, "steps increase per entity");
        }
        last_step.insert(key, row.step.0);
    }
}

/// Attributes with no handler in a substep carry their prior value; no
/// third state is observable.
#[test]
fn test_untouched_attribute_carries_prior() {
    let program = ProgramBuilder::new()
        .simulation(simulation("Main"))
        .prototype(
            PrototypeBuilder::new(EntityKind::Patch, "Field")
                .handler(
                    "Shrubs",
                    Substep::Init,
                    EventHandler::new(callable(|scope| scope.spawn("Shrub", 1))),
                )
                .build()
                .unwrap(),
        )
        .prototype({
            use veld::{EngineValue, engine::units::Units};
            PrototypeBuilder::new(EntityKind::Organism, "Shrub")
                .seed("label", EngineValue::Str("origin".to_string()))
                .seed(
                    "height",
                    EngineValue::decimal(1.25, Units::of("m").unwrap()),
                )
                .build()
                .unwrap()
        })
        .build()
        .unwrap();

    let sink = MemorySink::new();
    Stepper::new(Arc::new(program))
        .run(
            "Main",
            &RunOptions {
                steps: 4,
                ..Default::default()
            },
            &sink,
        )
        .unwrap();

    for step in 0..4 {
        let rows = organism_rows(&sink, "Shrub", step);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cell("label"), Some("origin"));
        assert_eq!(rows[0].cell("height"), Some("1.25"));
    }
}
