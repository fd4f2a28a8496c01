use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError, TryLockError,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::{
    encoder::{ChunkEncoder, FormatVersion},
    error::EncodeError,
    frame::{ResolvedFrame, StackId, StackPools},
    registry::ThreadId,
    rle::StackPointerLog,
};

static NEXT_SCOPE_SERIAL: AtomicU64 = AtomicU64::new(1);

struct Frozen {
    duration: Duration,
    log: Arc<StackPointerLog>,
}

struct ScopeInner {
    serial: u64,
    name: Arc<str>,
    thread_id: ThreadId,
    thread_name: Arc<str>,
    start_epoch_nanos: u64,
    started_at: Instant,
    format: FormatVersion,
    pools: Arc<StackPools>,

    // Written by the sampler while open, read once by whoever closes.
    log: Mutex<StackPointerLog>,
    samples: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    frozen: OnceLock<Frozen>,
}

/// A recording window on one thread.
///
/// Cheap to clone; all clones refer to the same window. Created by
/// [`ScopeManager::start_scope`](crate::manager::ScopeManager::start_scope).
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(
        pools: Arc<StackPools>,
        thread_id: ThreadId,
        thread_name: Arc<str>,
        name: &str,
        format: FormatVersion,
    ) -> Self {
        let start_epoch_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Scope {
            inner: Arc::new(ScopeInner {
                serial: NEXT_SCOPE_SERIAL.fetch_add(1, Ordering::Relaxed),
                name: Arc::from(name),
                thread_id,
                thread_name,
                start_epoch_nanos,
                started_at: Instant::now(),
                format,
                pools,
                log: Mutex::new(StackPointerLog::new()),
                samples: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                frozen: OnceLock::new(),
            }),
        }
    }

    /// Appends one sample. Called from the sampler thread only.
    ///
    /// Never blocks: if the owning thread is freezing the log right now the
    /// sample is dropped. Returns whether the sample was kept.
    pub fn record_sample(&self, stack: StackId) -> bool {
        let inner = &*self.inner;
        if inner.closed.load(Ordering::Acquire) {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut log = match inner.log.try_lock() {
            Ok(log) => log,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                inner.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        if inner.closed.load(Ordering::Acquire) {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        log.append(stack);
        inner.samples.fetch_add(1, Ordering::Release);
        true
    }

    /// Freezes the scope and returns its chunk. Later calls return an
    /// equivalent chunk.
    pub fn close(&self) -> Chunk {
        let inner = &*self.inner;
        inner.closed.store(true, Ordering::Release);
        let frozen = inner.frozen.get_or_init(|| {
            let duration = inner.started_at.elapsed();
            let mut log = inner.log.lock().unwrap_or_else(PoisonError::into_inner);
            Frozen {
                duration,
                log: Arc::new(std::mem::take(&mut *log)),
            }
        });
        Chunk {
            thread_id: inner.thread_id,
            thread_name: inner.thread_name.clone(),
            scope_name: inner.name.clone(),
            start_epoch_nanos: inner.start_epoch_nanos,
            duration: frozen.duration,
            format: inner.format,
            log: frozen.log.clone(),
            pools: inner.pools.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Logical samples recorded so far.
    pub fn sample_count(&self) -> u64 {
        self.inner.samples.load(Ordering::Acquire)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.same_scope(other)
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("serial", &self.inner.serial)
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .field("closed", &self.is_closed())
            .field("samples", &self.sample_count())
            .finish()
    }
}

/// Immutable result of a closed [`Scope`].
#[derive(Clone)]
pub struct Chunk {
    thread_id: ThreadId,
    thread_name: Arc<str>,
    scope_name: Arc<str>,
    start_epoch_nanos: u64,
    duration: Duration,
    format: FormatVersion,
    log: Arc<StackPointerLog>,
    pools: Arc<StackPools>,
}

impl Chunk {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn start_epoch_nanos(&self) -> u64 {
        self.start_epoch_nanos
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn version(&self) -> FormatVersion {
        self.format
    }

    /// The compressed stack pointer log.
    pub fn log(&self) -> &StackPointerLog {
        &self.log
    }

    /// Stack pointers in recording order.
    pub fn samples(&self) -> Vec<StackId> {
        self.log.decompress()
    }

    pub fn sample_count(&self) -> u64 {
        self.log.sample_count()
    }

    pub fn pools(&self) -> &StackPools {
        &self.pools
    }

    /// Resolves a stack pointer from this chunk to frames, leaf first.
    pub fn resolve(&self, stack: StackId) -> Option<Vec<ResolvedFrame>> {
        self.pools.resolve(stack)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        ChunkEncoder::new(self.format).encode(self)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("thread_id", &self.thread_id)
            .field("thread_name", &self.thread_name)
            .field("scope_name", &self.scope_name)
            .field("start_epoch_nanos", &self.start_epoch_nanos)
            .field("duration", &self.duration)
            .field("format", &self.format)
            .field("log_entries", &self.log.len())
            .finish()
    }
}
