use bytes::Bytes;
use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path as ObjectPath};
use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use crate::{
    error::{IoError, OutputError, VeldResult},
    output::target::{OutputTarget, Protocol},
};

/// Connection details for the S3-compatible (MinIO) strategy. Flags win;
/// `MINIO_*` environment variables fill the gaps.
#[derive(Debug, Clone)]
pub struct MinioConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl MinioConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            endpoint: std::env::var("MINIO_ENDPOINT").ok()?,
            access_key: std::env::var("MINIO_ACCESS_KEY").ok()?,
            secret_key: std::env::var("MINIO_SECRET_KEY").ok()?,
            bucket: std::env::var("MINIO_BUCKET").ok()?,
        })
    }

    fn build_store(&self, bucket_override: Option<&str>) -> VeldResult<Arc<dyn ObjectStore>> {
        let bucket = bucket_override.unwrap_or(&self.bucket);
        let store = AmazonS3Builder::new()
            .with_endpoint(&self.endpoint)
            .with_bucket_name(bucket)
            .with_access_key_id(&self.access_key)
            .with_secret_access_key(&self.secret_key)
            .with_region("us-east-1")
            .with_allow_http(true)
            .build()
            .map_err(|e| IoError::ObjectStoreBuild(e.to_string()))?;
        Ok(Arc::new(store))
    }
}

/// Shared in-memory destination registry, keyed by resolved path. Tests and
/// the `memory://` protocol read written bytes back out of it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStreams(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl MemoryStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.0
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(path)
            .cloned()
    }

    fn store(&self, path: String, bytes: Vec<u8>) {
        self.0
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(path, bytes);
    }
}

/// Protocol-pluggable byte destination factory.
pub enum StreamStrategy {
    File,
    Stdout,
    Memory(MemoryStreams),
    Minio(Arc<dyn ObjectStore>),
}

impl StreamStrategy {
    /// Picks the strategy for a parsed target. `minio://` targets need a
    /// [`MinioConfig`]; the target host, when present, overrides the bucket.
    pub fn for_target(
        target: &OutputTarget,
        minio: Option<&MinioConfig>,
        memory: &MemoryStreams,
    ) -> VeldResult<Self> {
        match target.protocol {
            Protocol::File => Ok(StreamStrategy::File),
            Protocol::Stdout => Ok(StreamStrategy::Stdout),
            Protocol::Memory => Ok(StreamStrategy::Memory(memory.clone())),
            Protocol::Minio => {
                let config = minio.ok_or_else(|| {
                    OutputError::Stream("minio target requires --minio-* configuration".into())
                })?;
                Ok(StreamStrategy::Minio(
                    config.build_store(target.host.as_deref())?,
                ))
            }
        }
    }

    pub async fn open(&self, path: &str) -> VeldResult<ByteSink> {
        match self {
            StreamStrategy::File => {
                let fs_path = Path::new(path);
                if let Some(parent) = fs_path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::File::create(fs_path)?;
                Ok(ByteSink::File(std::io::BufWriter::new(file)))
            }
            StreamStrategy::Stdout => Ok(ByteSink::Stdout),
            StreamStrategy::Memory(streams) => Ok(ByteSink::Memory {
                path: path.to_string(),
                streams: streams.clone(),
                buf: Vec::new(),
            }),
            StreamStrategy::Minio(store) => Ok(ByteSink::Remote {
                store: store.clone(),
                path: ObjectPath::from(path),
                buf: Vec::new(),
            }),
        }
    }
}

impl std::fmt::Debug for StreamStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamStrategy::File => "file",
            StreamStrategy::Stdout => "stdout",
            StreamStrategy::Memory(_) => "memory",
            StreamStrategy::Minio(_) => "minio",
        };
        write!(f, "StreamStrategy({name})")
    }
}

/// An open byte destination. Remote and memory sinks buffer until `close`
/// so a destination is either fully written or absent.
pub enum ByteSink {
    File(std::io::BufWriter<std::fs::File>),
    Stdout,
    Memory {
        path: String,
        streams: MemoryStreams,
        buf: Vec<u8>,
    },
    Remote {
        store: Arc<dyn ObjectStore>,
        path: ObjectPath,
        buf: Vec<u8>,
    },
}

impl ByteSink {
    pub async fn write_all(&mut self, bytes: &[u8]) -> VeldResult<()> {
        match self {
            ByteSink::File(writer) => writer.write_all(bytes).map_err(Into::into),
            ByteSink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(bytes).map_err(Into::into)
            }
            ByteSink::Memory { buf, .. } | ByteSink::Remote { buf, .. } => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    pub async fn close(self) -> VeldResult<()> {
        match self {
            ByteSink::File(mut writer) => writer.flush().map_err(Into::into),
            ByteSink::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout.flush().map_err(Into::into)
            }
            ByteSink::Memory { path, streams, buf } => {
                streams.store(path, buf);
                Ok(())
            }
            ByteSink::Remote { store, path, buf } => {
                store
                    .put(&path, Bytes::from(buf).into())
                    .await
                    .map(|_| ())
                    .map_err(|e| IoError::ObjectStore(e.to_string()).into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_round_trip() {
        let streams = MemoryStreams::new();
        let strategy = StreamStrategy::Memory(streams.clone());

        let mut sink = strategy.open("runs/out.csv").await.unwrap();
        sink.write_all(b"a,b\n").await.unwrap();
        sink.write_all(b"1,2\n").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(streams.contents("runs/out.csv").unwrap(), b"a,b\n1,2\n");
        assert!(streams.contents("runs/other.csv").is_none());
    }

    #[tokio::test]
    async fn test_file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/out.txt");
        let strategy = StreamStrategy::File;

        let mut sink = strategy.open(path.to_str().unwrap()).await.unwrap();
        sink.write_all(b"hello").await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn test_minio_target_without_config_fails() {
        let target = OutputTarget::parse("minio://bucket/out.csv").unwrap();
        let err = StreamStrategy::for_target(&target, None, &MemoryStreams::new()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Output(OutputError::Stream(_))
        ));
    }
}
