mod common;

use std::sync::Arc;

use common::{aging_organism, callable, organism_rows, selector, simulation};
use veld::{
    ProgramBuilder, Stepper,
    entity::{EntityKind, Substep, handler::EventHandler, prototype::PrototypeBuilder},
    output::MemorySink,
    sim::stepper::RunOptions,
};

/// Conditional creation: `Trees.step :if(meta.stepCount == 1) = create 10
/// of Tree`. Organisms created by the step-phase handler at the creation
/// step must be re-discovered at every subsequent step — the selector being
/// false afterwards must not lose the collection.
#[test]
fn test_conditionally_created_organisms_persist() {
    let program = ProgramBuilder::new()
        .simulation(simulation("Main"))
        .prototype(
            PrototypeBuilder::new(EntityKind::Patch, "Field")
                .handler(
                    "Trees",
                    Substep::Step,
                    EventHandler::guarded(
                        selector(|scope| Ok(scope.get("meta.stepCount")?.as_int()? == 1)),
                        callable(|scope| scope.spawn("Tree", 10)),
                    ),
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
                steps: 5,
                ..Default::default()
            },
            &sink,
        )
        .unwrap();

    // Step 0: selector false, nothing exists yet.
    assert_eq!(organism_rows(&sink, "Tree", 0).len(), 0);

    // Step 1: creation step, 10 fresh organisms at age 0.
    let created = organism_rows(&sink, "Tree", 1);
    assert_eq!(created.len(), 10, "creation step emits 10 Tree rows");
    assert!(created.iter().all(|r| r.cell("age") == Some("0")));

    // Steps 2-4: the selector is false again, yet all 10 organisms must
    // keep being discovered, aging by one year per step.
    for (step, expected_age) in [(2u64, "1"), (3, "2"), (4, "3")] {
        let rows = organism_rows(&sink, "Tree", step);
        assert_eq!(
            rows.len(),
            10,
            "step {step}: a false selector must not shrink the collection"
        );
        assert!(
            rows.iter().all(|r| r.cell("age") == Some(expected_age)),
            "step {step}: all ages are {expected_age}"
        );
    }
}

/// A handler whose selector is false for the entire run behaves exactly
/// like no handler at all: the attribute carries its prior (seeded) value
/// every step.
#[test]
fn test_always_false_selector_preserves_prior() {
    let program = ProgramBuilder::new()
        .simulation(simulation("Main"))
        .prototype(
            PrototypeBuilder::new(EntityKind::Patch, "Field")
                .seed("moisture", veld::EngineValue::count(7))
                .handler(
                    "moisture",
                    Substep::Step,
                    EventHandler::guarded(
                        selector(|_| Ok(false)),
                        callable(|_| Ok(veld::EngineValue::count(0))),
                    ),
                )
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let sink = MemorySink::new();
    Stepper::new(Arc::new(program))
        .run(
            "Main",
            &RunOptions {
                steps: 3,
                ..Default::default()
            },
            &sink,
        )
        .unwrap();

    let patch_rows: Vec<_> = sink
        .rows()
        .into_iter()
        .filter(|(kind, _)| *kind == veld::output::OutputKind::Patch)
        .map(|(_, row)| row)
        .collect();
    assert_eq!(patch_rows.len(), 3);
    for row in patch_rows {
        assert_eq!(
            row.cell("moisture"),
            Some("7"),
            "step {}: prior value carried, not unset",
            row.step.0
        );
    }
}
