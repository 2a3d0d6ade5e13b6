use futures::future::try_join_all;
use std::{cell::Cell, collections::HashMap};

use crate::{
    error::{OutputError, VeldResult},
    output::{
        OutputKind, RowSink,
        row::ExportRow,
        stream::{MemoryStreams, MinioConfig},
        target::{OutputTarget, TemplateVars},
        writer::OutputWriter,
    },
    sim::StepCount,
};

thread_local! {
    static CURRENT_KIND: Cell<Option<OutputKind>> = const { Cell::new(None) };
}

/// Associates an entity kind with subsequent context-based writes on this
/// thread.
pub fn set_entity_kind(kind: OutputKind) {
    CURRENT_KIND.with(|cell| cell.set(Some(kind)));
}

pub fn clear_entity_kind() {
    CURRENT_KIND.with(|cell| cell.set(None));
}

/// Routes writes to the correct underlying writer per entity kind.
///
/// Kinds with no configured writer are no-ops. Export rows and debug text
/// ride separate writer sets so `debugFiles.organism = stdout` does not
/// drag patch rows along.
#[derive(Default)]
pub struct CombinedWriter {
    export: HashMap<OutputKind, OutputWriter<ExportRow>>,
    debug: HashMap<OutputKind, OutputWriter<String>>,
    memory: MemoryStreams,
}

impl CombinedWriter {
    pub fn builder() -> CombinedWriterBuilder {
        CombinedWriterBuilder::new()
    }

    /// Starts every routed writer concurrently. Stream-open failures are
    /// fatal.
    pub async fn start(&mut self) -> VeldResult<()> {
        try_join_all(self.export.values_mut().map(OutputWriter::start)).await?;
        try_join_all(self.debug.values_mut().map(OutputWriter::start)).await?;
        Ok(())
    }

    /// Joins every routed writer, draining all queues.
    pub async fn join(&mut self) -> VeldResult<()> {
        try_join_all(self.export.values_mut().map(OutputWriter::join)).await?;
        try_join_all(self.debug.values_mut().map(OutputWriter::join)).await?;
        Ok(())
    }

    /// Debug text write with an explicit kind. No-op when the kind has no
    /// debug destination.
    pub fn write_debug(&self, kind: OutputKind, text: String, step: StepCount) -> VeldResult<()> {
        match self.debug.get(&kind) {
            Some(writer) => writer.write(text, step),
            None => Ok(()),
        }
    }

    /// Debug text write using the thread-local kind context. The kind must
    /// be set before the write.
    pub fn write_debug_with_context(&self, text: String, step: StepCount) -> VeldResult<()> {
        let kind = CURRENT_KIND
            .with(|cell| cell.get())
            .ok_or(OutputError::KindNotSet)?;
        self.write_debug(kind, text, step)
    }

    /// Shared in-memory destination registry for `memory://` targets.
    pub fn memory(&self) -> &MemoryStreams {
        &self.memory
    }
}

impl RowSink for CombinedWriter {
    fn emit(&self, kind: OutputKind, row: ExportRow) -> VeldResult<()> {
        match self.export.get(&kind) {
            Some(writer) => {
                let step = row.step;
                writer.write(row, step)
            }
            // No destination configured for this kind: free no-op.
            None => Ok(()),
        }
    }
}

/// Assembles per-kind routes before the writers start.
pub struct CombinedWriterBuilder {
    minio: Option<MinioConfig>,
    memory: MemoryStreams,
    vars: TemplateVars,
    capacity: usize,
    export: HashMap<OutputKind, OutputTarget>,
    debug: HashMap<OutputKind, OutputTarget>,
}

impl Default for CombinedWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CombinedWriterBuilder {
    pub fn new() -> Self {
        Self {
            minio: None,
            memory: MemoryStreams::new(),
            vars: TemplateVars::new(),
            capacity: 1024,
            export: HashMap::new(),
            debug: HashMap::new(),
        }
    }

    pub fn minio(mut self, config: MinioConfig) -> Self {
        self.minio = Some(config);
        self
    }

    pub fn template_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = vars;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Routes export rows of `kind` to `uri`.
    pub fn export_route(mut self, kind: OutputKind, uri: &str) -> VeldResult<Self> {
        self.export.insert(kind, OutputTarget::parse(uri)?);
        Ok(self)
    }

    /// Routes debug text of `kind` to `uri`.
    pub fn debug_route(mut self, kind: OutputKind, uri: &str) -> VeldResult<Self> {
        self.debug.insert(kind, OutputTarget::parse(uri)?);
        Ok(self)
    }

    pub fn build(self) -> VeldResult<CombinedWriter> {
        let mut export = HashMap::new();
        for (kind, target) in self.export {
            export.insert(
                kind,
                OutputWriter::new(
                    target,
                    &self.vars,
                    self.minio.as_ref(),
                    &self.memory,
                    self.capacity,
                )?,
            );
        }
        let mut debug = HashMap::new();
        for (kind, target) in self.debug {
            debug.insert(
                kind,
                OutputWriter::new(
                    target,
                    &self.vars,
                    self.minio.as_ref(),
                    &self.memory,
                    self.capacity,
                )?,
            );
        }
        Ok(CombinedWriter {
            export,
            debug,
            memory: self.memory,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::Replicate;

    fn row(step: u64) -> ExportRow {
        ExportRow {
            entity: "Patch@0,0#0".to_string(),
            type_name: "Default".to_string(),
            step: StepCount(step),
            replicate: Replicate(0),
            cells: vec![("biomass".to_string(), "12".to_string())],
        }
    }

    #[tokio::test]
    async fn test_unrouted_kind_is_noop() {
        let mut combined = CombinedWriter::builder()
            .export_route(OutputKind::Organism, "memory://host/organism.csv")
            .unwrap()
            .build()
            .unwrap();
        combined.start().await.unwrap();

        // Patch has no route; the write must succeed and write nothing.
        combined.emit(OutputKind::Patch, row(0)).unwrap();
        combined.emit(OutputKind::Organism, row(1)).unwrap();
        combined.join().await.unwrap();

        assert!(combined.memory().contents("patch.csv").is_none());
        let organism = combined.memory().contents("organism.csv").unwrap();
        assert!(String::from_utf8(organism).unwrap().contains(",1,0"));
    }

    #[tokio::test]
    async fn test_context_kind_required_for_context_writes() {
        let mut combined = CombinedWriter::builder()
            .debug_route(OutputKind::Organism, "memory://host/debug.txt")
            .unwrap()
            .build()
            .unwrap();
        combined.start().await.unwrap();

        clear_entity_kind();
        let err = combined
            .write_debug_with_context("hello".to_string(), StepCount(0))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Output(OutputError::KindNotSet)
        ));

        set_entity_kind(OutputKind::Organism);
        combined
            .write_debug_with_context("hello".to_string(), StepCount(0))
            .unwrap();
        clear_entity_kind();
        combined.join().await.unwrap();

        assert_eq!(
            combined.memory().contents("debug.txt").unwrap(),
            b"hello\n"
        );
    }
}
