use std::{ops::Range, path::PathBuf, sync::Arc};

use tracing::info;

use crate::{
    engine::units::Units,
    entity::program::{GridSpec, Program},
    error::{SystemError, VeldResult},
    external::{DataRequest, ExternalLayer},
    external::grid::{DataGrid, DataGridBuilder},
    output::combined::CombinedWriter,
    sim::stepper::{RunOptions, Stepper},
};

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub replicates: u32,
    pub steps: u64,
}

/// `run`: executes N replicates of a simulation, streaming rows to the
/// configured sinks. The stepper works on the blocking pool while the
/// writers drain on this runtime.
pub async fn run(
    program: Arc<Program>,
    simulation: &str,
    opts: RunOptions,
    mut writer: CombinedWriter,
) -> VeldResult<(RunSummary, CombinedWriter)> {
    let summary = RunSummary {
        replicates: opts.replicates,
        steps: opts.steps,
    };

    writer.start().await?;
    let shared = Arc::new(writer);

    let stepper = Stepper::new(program);
    let sink = shared.clone();
    let simulation_name = simulation.to_string();
    let run_result =
        tokio::task::spawn_blocking(move || stepper.run(&simulation_name, &opts, sink.as_ref()))
            .await
            .map_err(|e| SystemError::Join(e.to_string()))?;

    let mut writer = Arc::try_unwrap(shared)
        .map_err(|_| SystemError::InvariantViolation("writer still shared after run".into()))?;
    writer.join().await?;
    run_result?;

    info!(simulation, replicates = summary.replicates, "run complete");
    Ok((summary, writer))
}

/// `validate`: parse and build happen upstream; this confirms the program
/// names the requested simulation.
pub fn validate(program: &Program, simulation: &str) -> VeldResult<()> {
    program.simulation(simulation).map(|_| ())
}

/// Inputs for `preprocess`: sample an external source onto the simulation
/// grid for a range of timesteps and write a binary data grid.
#[derive(Debug, Clone)]
pub struct PreprocessSpec {
    pub source: String,
    pub variable: String,
    pub units: Units,
    pub grid: GridSpec,
    pub timesteps: Range<u64>,
    pub default_value: f64,
    pub out: PathBuf,
}

/// `preprocess`: converts external raster/point data into the internal
/// binary grid consumed by `run`.
pub fn preprocess(layer: &dyn ExternalLayer, spec: &PreprocessSpec) -> VeldResult<()> {
    let cells = spec.grid.cells();
    let rows = ((spec.grid.max_lat - spec.grid.min_lat) / spec.grid.cell_size).ceil() as usize;
    let cols = ((spec.grid.max_lon - spec.grid.min_lon) / spec.grid.cell_size).ceil() as usize;
    let timesteps = spec.timesteps.end.saturating_sub(spec.timesteps.start) as usize;

    let mut builder = DataGridBuilder::new(
        spec.grid.min_lat,
        spec.grid.min_lon,
        spec.grid.cell_size,
        timesteps,
        rows,
        cols,
        spec.default_value,
    );
    let variable = builder.variable(&spec.variable, spec.units.clone());

    for t in spec.timesteps.clone() {
        for (index, (_, geometry)) in cells.iter().enumerate() {
            let request = DataRequest::new(&spec.source, &spec.variable, t, geometry.clone())
                .with_default(spec.default_value);
            let value = layer.fulfill(&request)?.mean()?.to_f64();
            let (y, x) = (index / cols, index % cols);
            builder.set(variable, (t - spec.timesteps.start) as usize, x, y, value)?;
        }
    }

    builder.build().write(&spec.out)?;
    info!(out = %spec.out.display(), variable = %spec.variable, "preprocess complete");
    Ok(())
}

/// `inspect_jshd`: value at one grid coordinate; out-of-bounds is an error.
pub fn inspect_jshd(
    path: &PathBuf,
    variable: &str,
    timestep: usize,
    x: usize,
    y: usize,
) -> VeldResult<f64> {
    DataGrid::read(path)?.lookup(variable, timestep, x, y)
}

/// `discover_config`: sorted variable descriptions, one per line, formatted
/// `name` or `name(default)`.
pub fn discover_config(program: &Program) -> String {
    program
        .config_vars()
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        engine::distribution::Distribution,
        entity::{EntityKind, prototype::PrototypeBuilder},
        entity::program::ProgramBuilder,
    };

    struct Flat(f64);

    impl ExternalLayer for Flat {
        fn fulfill(&self, request: &DataRequest) -> VeldResult<Distribution> {
            Ok(Distribution::realized_f64(
                [self.0 + request.timestep as f64],
                Units::empty(),
            ))
        }
    }

    #[test]
    fn test_preprocess_then_inspect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("climate.jshd");
        let spec = PreprocessSpec {
            source: "flat".to_string(),
            variable: "temp".to_string(),
            units: Units::of("C").unwrap(),
            grid: GridSpec {
                min_lat: 0.0,
                min_lon: 0.0,
                max_lat: 2.0,
                max_lon: 2.0,
                cell_size: 1.0,
            },
            timesteps: 0..3,
            default_value: f64::NAN,
            out: out.clone(),
        };

        preprocess(&Flat(10.0), &spec).unwrap();

        assert_eq!(inspect_jshd(&out, "temp", 0, 0, 0).unwrap(), 10.0);
        assert_eq!(inspect_jshd(&out, "temp", 2, 1, 1).unwrap(), 12.0);
        assert!(inspect_jshd(&out, "temp", 0, 5, 5).is_err(), "out of bounds");
    }

    #[test]
    fn test_validate_checks_simulation_name() {
        let program = ProgramBuilder::new()
            .simulation(
                PrototypeBuilder::new(EntityKind::Simulation, "Main")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert!(validate(&program, "Main").is_ok());
        assert!(validate(&program, "Other").is_err());
    }

    #[test]
    fn test_discover_config_formatting() {
        let program = ProgramBuilder::new()
            .config_var("totalYears", Some("30 years"))
            .config_var("seedDensity", None)
            .build()
            .unwrap();
        assert_eq!(
            discover_config(&program),
            "seedDensity\ntotalYears(30 years)"
        );
    }
}
