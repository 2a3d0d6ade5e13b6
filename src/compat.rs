use std::sync::{Mutex, OnceLock};

use strum::Display;

use crate::error::{SystemError, VeldResult};

/// Numeric representation for decimal scalars, fixed per process.
///
/// `Decimal` trades speed for exact arithmetic (`rust_decimal`); `Double`
/// runs on IEEE-754 `f64`. Widening rules in the engine consult this switch
/// whenever an integer meets a decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum NumericMode {
    #[default]
    Decimal,
    Double,
}

/// Threading profile: native threads or a single-threaded embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Threading {
    #[default]
    Threaded,
    SingleThread,
}

/// Swappable runtime primitives, installed once at process start.
#[derive(Debug, Default)]
pub struct Compat {
    numeric_mode: NumericMode,
    threading: Threading,
}

impl Compat {
    pub fn new(numeric_mode: NumericMode, threading: Threading) -> Self {
        Self {
            numeric_mode,
            threading,
        }
    }

    pub fn numeric_mode(&self) -> NumericMode {
        self.numeric_mode
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    /// String joiner honoring the configured delimiter.
    pub fn joiner(&self, delimiter: &str) -> StringJoiner {
        StringJoiner {
            delimiter: delimiter.to_string(),
            parts: Vec::new(),
        }
    }

    /// Lock appropriate for the threading profile. Single-threaded
    /// embeddings get a no-op lock.
    pub fn lock(&self) -> CompatLock {
        match self.threading {
            Threading::Threaded => CompatLock::Threaded(Mutex::new(())),
            Threading::SingleThread => CompatLock::Passthrough,
        }
    }

    /// Bounded queue whose consumer runs a callback on a dedicated thread.
    ///
    /// Producers block when the queue is full. Dropping all producers ends
    /// the consumer; `QueueHandle::join` waits for the drain to finish.
    pub fn queue<T, F>(&self, capacity: usize, mut consumer: F) -> QueueHandle<T>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx) = async_channel::bounded::<T>(capacity);
        let worker = std::thread::spawn(move || {
            while let Ok(item) = rx.recv_blocking() {
                consumer(item);
            }
        });
        QueueHandle {
            tx: Some(tx),
            worker: Some(worker),
        }
    }
}

/// Accumulates parts and joins them with a delimiter.
#[derive(Debug, Clone)]
pub struct StringJoiner {
    delimiter: String,
    parts: Vec<String>,
}

impl StringJoiner {
    pub fn push(&mut self, part: impl Into<String>) -> &mut Self {
        self.parts.push(part.into());
        self
    }

    pub fn finish(&self) -> String {
        self.parts.join(&self.delimiter)
    }
}

/// A lock that degrades to a no-op in single-threaded embeddings.
#[derive(Debug)]
pub enum CompatLock {
    Threaded(Mutex<()>),
    Passthrough,
}

impl CompatLock {
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        match self {
            CompatLock::Threaded(mutex) => {
                let _guard = mutex.lock().unwrap_or_else(|poison| poison.into_inner());
                f()
            }
            CompatLock::Passthrough => f(),
        }
    }
}

/// Producer handle for a callback-consumer queue.
#[derive(Debug)]
pub struct QueueHandle<T> {
    tx: Option<async_channel::Sender<T>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl<T> QueueHandle<T> {
    /// Enqueues an item, blocking while the queue is full.
    pub fn send(&self, item: T) -> VeldResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SystemError::InvariantViolation("queue already joined".into()))?;
        tx.send_blocking(item)
            .map_err(|_| SystemError::Join("queue consumer is gone".into()).into())
    }

    /// Closes the queue and waits for the consumer to drain.
    pub fn join(&mut self) -> VeldResult<()> {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| SystemError::Join("queue consumer panicked".into()))?;
        }
        Ok(())
    }
}

// ================================================================================================
// Process-wide installation
// ================================================================================================

static COMPAT: OnceLock<Compat> = OnceLock::new();

/// Installs the compatibility layer. A second install is rejected.
pub fn install(compat: Compat) -> VeldResult<()> {
    COMPAT
        .set(compat)
        .map_err(|_| SystemError::CompatInstalled.into())
}

/// The installed layer, falling back to defaults when none was installed.
pub fn get() -> &'static Compat {
    COMPAT.get_or_init(Compat::default)
}

/// Shorthand for the process numeric mode.
pub fn numeric_mode() -> NumericMode {
    get().numeric_mode()
}
