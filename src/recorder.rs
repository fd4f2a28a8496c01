use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    encoder::FormatVersion,
    error::SampleError,
    frame::StackPools,
    manager::ScopeDirectory,
    ratelimit::RateLimiter,
    registry::{ThreadId, ThreadRegistry},
    scheduler::{self, SamplingScheduler, TickStats},
    scope::{Chunk, Scope},
    source::{NoopStackSource, StackAccessGate, StackSource},
};

pub const DEFAULT_SAMPLING_PERIOD: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_STACK_DEPTH: usize = 128;
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Config {
    pub sampling_period: Duration,
    pub max_stack_depth: usize,
    pub format: FormatVersion,
    /// Minimum time between two repeated diagnostics of the same kind.
    pub log_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sampling_period: DEFAULT_SAMPLING_PERIOD,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            format: FormatVersion::default(),
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

/// Everything the recorder, the sampler thread and the chunks share.
/// Built once by [`RecorderBuilder`].
#[derive(Debug)]
pub struct RecordingContext {
    config: Config,
    pools: Arc<StackPools>,
    registry: ThreadRegistry,
    directory: ScopeDirectory,
    gate: StackAccessGate,
    tick_errors: RateLimiter,
}

impl RecordingContext {
    fn new(config: Config, source: Box<dyn StackSource>) -> Self {
        let pools = Arc::new(StackPools::new());
        let misuse = Arc::new(RateLimiter::new(config.log_interval));
        RecordingContext {
            directory: ScopeDirectory::new(pools.clone(), config.format, misuse),
            tick_errors: RateLimiter::new(config.log_interval),
            registry: ThreadRegistry::new(),
            gate: StackAccessGate::new(source),
            pools,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pools(&self) -> &Arc<StackPools> {
        &self.pools
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ScopeDirectory {
        &self.directory
    }

    pub fn gate(&self) -> &StackAccessGate {
        &self.gate
    }

    pub(crate) fn tick_errors(&self) -> &RateLimiter {
        &self.tick_errors
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_IDENTITY: RefCell<Option<(ThreadId, Arc<str>)>> = const { RefCell::new(None) };
}

fn current_thread() -> (ThreadId, Arc<str>) {
    THREAD_IDENTITY.with(|value| {
        if let Some(identity) = value.borrow().as_ref() {
            return identity.clone();
        }
        let thread_id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
        let thread_name: Arc<str> = match std::thread::current().name() {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("thread {thread_id}")),
        };
        value.replace(Some((thread_id, thread_name.clone())));
        (thread_id, thread_name)
    })
}

/// Id the recorder uses for the calling thread. Stable for the life of the
/// thread, never reused.
pub fn current_thread_id() -> ThreadId {
    current_thread().0
}

pub struct RecorderBuilder {
    config: Config,
    source: Option<Box<dyn StackSource>>,
}

impl RecorderBuilder {
    pub fn new() -> Self {
        RecorderBuilder {
            config: Config::default(),
            source: None,
        }
    }

    /// Time between two sampling ticks. Defaults to 10ms.
    pub fn sampling_period(mut self, period: Duration) -> Self {
        self.config.sampling_period = period;
        self
    }

    /// Deepest stack kept per sample. Defaults to 128 frames.
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.config.max_stack_depth = depth;
        self
    }

    pub fn stack_source<S: StackSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn format(mut self, format: FormatVersion) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_interval(mut self, interval: Duration) -> Self {
        self.config.log_interval = interval;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Builds the recorder and starts the sampler thread.
    pub fn build(self) -> std::io::Result<(Recorder, SamplerGuard)> {
        let recorder = self.build_without_sampler();
        let scheduler = SamplingScheduler::spawn(recorder.context.clone())?;
        Ok((
            recorder,
            SamplerGuard {
                scheduler: Some(scheduler),
            },
        ))
    }

    /// Builds a recorder with no background thread. Drive it with
    /// [`Recorder::sample_once`].
    pub fn build_without_sampler(self) -> Recorder {
        let source = self.source.unwrap_or_else(|| Box::new(NoopStackSource));
        Recorder {
            context: Arc::new(RecordingContext::new(self.config, source)),
        }
    }
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops the sampler thread when dropped, without waiting for it.
pub struct SamplerGuard {
    scheduler: Option<SamplingScheduler>,
}

impl SamplerGuard {
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.as_ref() {
            scheduler.shutdown();
        }
    }

    /// Stops the sampler thread and waits for it to exit.
    pub fn join(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.join();
        }
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point for instrumented code.
#[derive(Clone, Debug)]
pub struct Recorder {
    context: Arc<RecordingContext>,
}

impl Recorder {
    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::new()
    }

    /// Opens a scope on the calling thread and starts sampling the thread.
    pub fn start_scope(&self, name: &str) -> Scope {
        let (thread_id, thread_name) = current_thread();
        self.start_scope_on(thread_id, &thread_name, name)
    }

    /// Like [`start_scope`](Self::start_scope) for callers that assign their
    /// own thread ids. Only the thread owning `thread_id` may call this.
    pub fn start_scope_on(&self, thread_id: ThreadId, thread_name: &str, name: &str) -> Scope {
        let manager = self.context.directory.for_thread(thread_id, thread_name);
        let scope = manager.start_scope(name);
        self.context.registry.track(thread_id);
        scope
    }

    /// Ends `scope`, and any scope opened inside it that is still open. The
    /// thread stops being sampled once it has no open scope left, and its
    /// manager is released until the next `start_scope`.
    pub fn end_scope(&self, scope: Scope) -> Chunk {
        let thread_id = scope.thread_id();
        let Some(manager) = self.context.directory.get(thread_id) else {
            tracing::warn!(
                thread_id,
                scope = scope.name(),
                "end_scope for a thread with no scopes"
            );
            return scope.close();
        };
        let chunk = manager.end_scope(&scope);
        if manager.depth() == 0 {
            self.context.registry.untrack(thread_id);
            self.context.directory.remove(thread_id);
        }
        chunk
    }

    /// Innermost open scope of the calling thread.
    pub fn current_scope(&self) -> Option<Scope> {
        self.context
            .directory
            .get(current_thread_id())
            .and_then(|manager| manager.current_scope())
    }

    /// Runs one sampling tick on the calling thread.
    pub fn sample_once(&self) -> Result<TickStats, SampleError> {
        scheduler::tick(&self.context)
    }

    pub fn install_stack_source<S: StackSource + 'static>(&self, source: S) {
        self.context.gate.install(Box::new(source));
    }

    /// Stops collecting stacks without stopping the sampler thread.
    pub fn disable(&self) {
        self.context.gate.disable();
    }

    pub fn enable(&self) {
        self.context.gate.enable();
    }

    pub fn context(&self) -> &Arc<RecordingContext> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{frame::Frame, rle::COUNTER_FLAG, source::ThreadStack};

    struct Fixed(Vec<Frame>);

    impl StackSource for Fixed {
        fn snapshot(
            &self,
            ids: &[ThreadId],
            _max_depth: usize,
        ) -> Result<Vec<ThreadStack>, SampleError> {
            Ok(ids
                .iter()
                .map(|id| ThreadStack {
                    thread_id: *id,
                    frames: self.0.clone(),
                })
                .collect())
        }
    }

    struct Failing;

    impl StackSource for Failing {
        fn snapshot(
            &self,
            _ids: &[ThreadId],
            _max_depth: usize,
        ) -> Result<Vec<ThreadStack>, SampleError> {
            Err(SampleError::Source("thread vanished".into()))
        }
    }

    struct Panicking;

    impl StackSource for Panicking {
        fn snapshot(
            &self,
            _ids: &[ThreadId],
            _max_depth: usize,
        ) -> Result<Vec<ThreadStack>, SampleError> {
            panic!("walker crashed")
        }
    }

    fn foo_bar_main() -> Vec<Frame> {
        vec![
            Frame::new("app.Main", "foo", 30),
            Frame::new("app.Main", "bar", 20),
            Frame::new("app.Main", "main", 10),
        ]
    }

    #[test]
    fn three_ticks_over_an_unchanged_stack() {
        let recorder = RecorderBuilder::new()
            .stack_source(Fixed(foo_bar_main()))
            .build_without_sampler();
        let scope = recorder.start_scope("req-1");
        for _ in 0..3 {
            assert_eq!(recorder.sample_once().unwrap().recorded, 1);
        }
        let chunk = recorder.end_scope(scope);
        let p = chunk.log().words()[0];
        assert_eq!(chunk.log().words(), &[p, 2 | COUNTER_FLAG]);
        assert_eq!(chunk.samples(), vec![p, p, p]);
        assert_eq!(chunk.sample_count(), 3);
        assert_eq!(chunk.scope_name(), "req-1");
        let names: Vec<String> = chunk
            .resolve(p)
            .unwrap()
            .into_iter()
            .map(|f| f.method_name)
            .collect();
        assert_eq!(names, ["foo", "bar", "main"]);
    }

    #[test]
    fn thread_is_tracked_only_while_a_scope_is_open() {
        let recorder = RecorderBuilder::new().build_without_sampler();
        let id = current_thread_id();
        let outer = recorder.start_scope("outer");
        let inner = recorder.start_scope("inner");
        assert!(recorder.context().registry().is_tracked(id));

        recorder.end_scope(inner);
        assert_eq!(recorder.current_scope(), Some(outer.clone()));
        assert!(recorder.context().registry().is_tracked(id));

        recorder.end_scope(outer);
        assert!(recorder.current_scope().is_none());
        assert!(!recorder.context().registry().is_tracked(id));
    }

    #[test]
    fn finished_threads_leave_no_manager_behind() {
        let recorder = RecorderBuilder::new().build_without_sampler();
        let workers: Vec<_> = (0..50)
            .map(|_| {
                let recorder = recorder.clone();
                thread::spawn(move || {
                    let outer = recorder.start_scope("request");
                    let inner = recorder.start_scope("handler");
                    recorder.end_scope(inner);
                    assert!(!recorder.context().directory().is_empty());
                    recorder.end_scope(outer);
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert!(recorder.context().directory().is_empty());
        assert!(recorder.context().registry().snapshot().is_empty());
    }

    #[test]
    fn scope_reopened_after_release_is_sampled() {
        let recorder = RecorderBuilder::new()
            .stack_source(Fixed(foo_bar_main()))
            .build_without_sampler();
        let first = recorder.start_scope("first");
        recorder.sample_once().unwrap();
        assert_eq!(recorder.end_scope(first).sample_count(), 1);
        assert!(recorder.context().directory().is_empty());

        let second = recorder.start_scope("second");
        assert_eq!(recorder.sample_once().unwrap().recorded, 1);
        assert_eq!(recorder.end_scope(second).sample_count(), 1);
    }

    #[test]
    fn samples_go_to_the_innermost_scope() {
        let recorder = RecorderBuilder::new()
            .stack_source(Fixed(foo_bar_main()))
            .build_without_sampler();
        let outer = recorder.start_scope("outer");
        recorder.sample_once().unwrap();
        let inner = recorder.start_scope("inner");
        recorder.sample_once().unwrap();
        recorder.sample_once().unwrap();
        let inner = recorder.end_scope(inner);
        recorder.sample_once().unwrap();
        let outer = recorder.end_scope(outer);
        assert_eq!(inner.sample_count(), 2);
        assert_eq!(outer.sample_count(), 2);
    }

    #[test]
    fn stacks_are_truncated_to_max_depth() {
        let deep: Vec<Frame> = (0..10)
            .map(|i| Frame::new("d.D", format!("m{i}"), i))
            .collect();
        let recorder = RecorderBuilder::new()
            .max_stack_depth(4)
            .stack_source(Fixed(deep))
            .build_without_sampler();
        let scope = recorder.start_scope("deep");
        recorder.sample_once().unwrap();
        let chunk = recorder.end_scope(scope);
        let frames = chunk.resolve(chunk.samples()[0]).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].method_name, "m0");
    }

    #[test]
    fn failing_sources_never_escape() {
        let recorder = RecorderBuilder::new()
            .stack_source(Failing)
            .build_without_sampler();
        let scope = recorder.start_scope("s");
        assert!(matches!(recorder.sample_once(), Err(SampleError::Source(_))));
        assert!(scheduler::run_tick(recorder.context()).is_none());

        recorder.install_stack_source(Panicking);
        assert!(matches!(recorder.sample_once(), Err(SampleError::Panicked)));

        recorder.install_stack_source(Fixed(foo_bar_main()));
        assert_eq!(recorder.sample_once().unwrap().recorded, 1);
        assert_eq!(recorder.end_scope(scope).sample_count(), 1);
    }

    #[test]
    fn disabled_gate_records_nothing() {
        let recorder = RecorderBuilder::new()
            .stack_source(Fixed(foo_bar_main()))
            .build_without_sampler();
        let scope = recorder.start_scope("s");
        recorder.disable();
        assert_eq!(recorder.sample_once().unwrap().recorded, 0);
        recorder.enable();
        assert_eq!(recorder.sample_once().unwrap().recorded, 1);
        assert_eq!(recorder.end_scope(scope).sample_count(), 1);
    }

    #[test]
    fn threads_get_distinct_ids() {
        let main_id = current_thread_id();
        assert_eq!(main_id, current_thread_id());
        let other = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main_id, other);
    }

    #[test]
    fn background_sampler_records() {
        let (recorder, guard) = RecorderBuilder::new()
            .sampling_period(Duration::from_millis(1))
            .stack_source(Fixed(foo_bar_main()))
            .build()
            .unwrap();
        let scope = recorder.start_scope("busy");
        let started = std::time::Instant::now();
        while scope.sample_count() < 3 && started.elapsed() < Duration::from_secs(10) {
            thread::sleep(Duration::from_millis(1));
        }
        let chunk = recorder.end_scope(scope);
        guard.join();
        assert!(chunk.sample_count() >= 3);
        assert_eq!(chunk.samples().len() as u64, chunk.sample_count());
    }
}
