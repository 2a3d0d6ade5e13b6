pub mod combined;
pub mod row;
pub mod stream;
pub mod target;
pub mod writer;

use std::sync::Mutex;

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{entity::EntityKind, error::VeldResult, output::row::ExportRow};

/// Routing key for per-entity-kind output writers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum OutputKind {
    Patch,
    Organism,
    Agent,
}

impl From<EntityKind> for OutputKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Patch => OutputKind::Patch,
            EntityKind::Organism => OutputKind::Organism,
            // The simulation entity reports through the agent channel.
            EntityKind::Simulation => OutputKind::Agent,
        }
    }
}

/// Where the stepper hands off per-entity rows each timestep.
pub trait RowSink: Send + Sync {
    fn emit(&self, kind: OutputKind, row: ExportRow) -> VeldResult<()>;
}

/// Collects rows in memory; the test-facing sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<(OutputKind, ExportRow)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<(OutputKind, ExportRow)> {
        self.rows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl RowSink for MemorySink {
    fn emit(&self, kind: OutputKind, row: ExportRow) -> VeldResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push((kind, row));
        Ok(())
    }
}

/// Discards every row. Used when no output is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RowSink for NullSink {
    fn emit(&self, _kind: OutputKind, _row: ExportRow) -> VeldResult<()> {
        Ok(())
    }
}
