use async_channel::{Receiver, Sender};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::{OutputError, SystemError, VeldResult},
    output::{
        row::ExportRow,
        stream::{ByteSink, MemoryStreams, MinioConfig, StreamStrategy},
        target::{FileType, OutputTarget, TemplateVars},
    },
    sim::StepCount,
};

/// Data an [`OutputWriter`] can serialize: free-form debug text or
/// structured export rows.
pub trait Serial: Send + 'static {
    /// Serializes to bytes for the destination format. `include_header` is
    /// true only for the first task written to a destination.
    fn to_bytes(&self, file_type: FileType, include_header: bool) -> VeldResult<Bytes>;
}

impl Serial for String {
    fn to_bytes(&self, _file_type: FileType, _include_header: bool) -> VeldResult<Bytes> {
        let mut bytes = Vec::with_capacity(self.len() + 1);
        bytes.extend_from_slice(self.as_bytes());
        bytes.push(b'\n');
        Ok(Bytes::from(bytes))
    }
}

impl Serial for ExportRow {
    fn to_bytes(&self, file_type: FileType, include_header: bool) -> VeldResult<Bytes> {
        match file_type {
            FileType::Csv => {
                let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
                if include_header {
                    writer
                        .write_record(self.header())
                        .map_err(|e| OutputError::Stream(e.to_string()))?;
                }
                writer
                    .write_record(self.record())
                    .map_err(|e| OutputError::Stream(e.to_string()))?;
                let bytes = writer
                    .into_inner()
                    .map_err(|e| OutputError::Stream(e.to_string()))?;
                Ok(Bytes::from(bytes))
            }
            FileType::Text => {
                let line = self.record().join("\t");
                let mut bytes = Vec::with_capacity(line.len() + 1);
                bytes.extend_from_slice(line.as_bytes());
                bytes.push(b'\n');
                Ok(Bytes::from(bytes))
            }
            FileType::NetCdf | FileType::GeoTiff => Err(OutputError::Stream(format!(
                "{file_type} encoding is provided by the raster collaborator"
            ))
            .into()),
        }
    }
}

struct Task<T> {
    data: T,
    step: StepCount,
}

/// Generic asynchronous output writer.
///
/// Lifecycle is `start` → `write`* → `join`. Each writer owns one bounded
/// queue and one background worker; `write` enqueues with backpressure
/// (blocking when full, never dropping), the worker serializes and hands
/// bytes to the stream strategy. Opening the stream fails `start`; per-task
/// failures are logged and the task dropped, never retried, so output order
/// per destination is preserved.
pub struct OutputWriter<T: Serial> {
    target: OutputTarget,
    strategy: StreamStrategy,
    resolved_path: String,
    capacity: usize,
    tx: Option<Sender<Task<T>>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Serial> OutputWriter<T> {
    pub fn new(
        target: OutputTarget,
        vars: &TemplateVars,
        minio: Option<&MinioConfig>,
        memory: &MemoryStreams,
        capacity: usize,
    ) -> VeldResult<Self> {
        let resolved_path = target.resolve_path(vars)?;
        let strategy = StreamStrategy::for_target(&target, minio, memory)?;
        Ok(Self {
            target,
            strategy,
            resolved_path,
            capacity,
            tx: None,
            worker: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.resolved_path
    }

    /// Opens the destination and spawns the drain worker. Stream-open
    /// errors are fatal here rather than at first write.
    pub async fn start(&mut self) -> VeldResult<()> {
        if self.tx.is_some() {
            return Err(OutputError::Lifecycle(format!(
                "{} already started",
                self.resolved_path
            ))
            .into());
        }

        let sink = self.strategy.open(&self.resolved_path).await?;
        let (tx, rx) = async_channel::bounded(self.capacity.max(1));
        let file_type = self.target.file_type;
        let path = self.resolved_path.clone();
        info!(%path, "output writer started");

        self.worker = Some(tokio::spawn(drain(rx, sink, file_type, path)));
        self.tx = Some(tx);
        Ok(())
    }

    /// Enqueues one datum, blocking while the queue is full.
    pub fn write(&self, data: T, step: StepCount) -> VeldResult<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            OutputError::Lifecycle(format!("{} not started", self.resolved_path))
        })?;
        tx.send_blocking(Task { data, step })
            .map_err(|_| OutputError::QueueClosed(self.resolved_path.clone()).into())
    }

    /// Signals no-more-work, waits for the worker to drain the queue and
    /// close the underlying stream.
    pub async fn join(&mut self) -> VeldResult<()> {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|e| SystemError::Join(e.to_string()))?;
        }
        Ok(())
    }
}

async fn drain<T: Serial>(
    rx: Receiver<Task<T>>,
    mut sink: ByteSink,
    file_type: FileType,
    path: String,
) {
    let mut first = true;
    while let Ok(task) = rx.recv().await {
        match task.data.to_bytes(file_type, first) {
            Ok(bytes) => {
                first = false;
                match sink.write_all(&bytes).await {
                    Ok(()) => {
                        debug!(%path, step = task.step.0, len = bytes.len(), "wrote output task")
                    }
                    Err(err) => warn!(%path, %err, "dropping output task after stream failure"),
                }
            }
            Err(err) => warn!(%path, %err, "dropping unserializable output task"),
        }
    }
    if let Err(err) = sink.close().await {
        warn!(%path, %err, "failed to close output stream");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::Replicate;

    fn row(step: u64, age: &str) -> ExportRow {
        ExportRow {
            entity: "Tree@0,0#1".to_string(),
            type_name: "Tree".to_string(),
            step: StepCount(step),
            replicate: Replicate(0),
            cells: vec![("age".to_string(), age.to_string())],
        }
    }

    // Queue capacity is below the write count, so enqueueing exercises
    // backpressure; the multi-thread runtime lets the worker drain while
    // the writer blocks.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_drains_in_order_before_join() {
        let memory = MemoryStreams::new();
        let target = OutputTarget::parse("memory://host/out.csv").unwrap();
        let mut writer =
            OutputWriter::new(target, &TemplateVars::new(), None, &memory, 4).unwrap();
        writer.start().await.unwrap();

        for t in 0..8u64 {
            writer.write(row(t, &t.to_string()), StepCount(t)).unwrap();
        }
        writer.join().await.unwrap();

        let bytes = memory.contents("out.csv").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "entity,age,step,replicate", "header first");
        assert_eq!(lines.len(), 9, "header + 8 rows");
        // Increasing step order per destination.
        assert!(lines[1].contains(",0,0") && lines[8].contains(",7,0"));
    }

    #[tokio::test]
    async fn test_write_before_start_is_lifecycle_error() {
        let memory = MemoryStreams::new();
        let target = OutputTarget::parse("memory://host/out.csv").unwrap();
        let writer: OutputWriter<ExportRow> =
            OutputWriter::new(target, &TemplateVars::new(), None, &memory, 4).unwrap();
        let err = writer.write(row(0, "0"), StepCount(0)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Output(OutputError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let memory = MemoryStreams::new();
        let target = OutputTarget::parse("memory://host/out.txt").unwrap();
        let mut writer: OutputWriter<String> =
            OutputWriter::new(target, &TemplateVars::new(), None, &memory, 4).unwrap();
        writer.start().await.unwrap();
        assert!(writer.start().await.is_err());
        writer.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_raster_file_types_are_external() {
        let bytes = row(0, "1").to_bytes(FileType::GeoTiff, true);
        assert!(bytes.is_err());
    }

    #[test]
    fn test_csv_quoting_is_rfc4180() {
        let r = ExportRow {
            entity: "Tree@0,0#1".to_string(),
            type_name: "Tree".to_string(),
            step: StepCount(0),
            replicate: Replicate(0),
            cells: vec![("note".to_string(), "a,b \"quoted\"".to_string())],
        };
        let bytes = r.to_bytes(FileType::Csv, false).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(
            text.contains("\"a,b \"\"quoted\"\"\""),
            "embedded commas and quotes must be RFC-4180 quoted: {text}"
        );
    }
}
