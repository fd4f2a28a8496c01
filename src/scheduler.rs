use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
};

use crossbeam_channel::{select, Receiver, Sender};

use crate::{error::SampleError, recorder::RecordingContext, source::ThreadStack};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub tracked: usize,
    pub recorded: usize,
    pub dropped: usize,
}

/// Takes one sample of every tracked thread and files it under that
/// thread's current scope.
pub(crate) fn tick(ctx: &RecordingContext) -> Result<TickStats, SampleError> {
    let ids = ctx.registry().snapshot();
    let mut stats = TickStats {
        tracked: ids.len(),
        ..TickStats::default()
    };
    if ids.is_empty() {
        return Ok(stats);
    }

    let max_depth = ctx.config().max_stack_depth;
    let source = ctx.gate().current();
    let stacks = panic::catch_unwind(AssertUnwindSafe(|| source.snapshot(&ids, max_depth)))
        .map_err(|_| SampleError::Panicked)??;

    for ThreadStack { thread_id, frames } in stacks {
        // Threads that untracked or ended their scope since the snapshot
        // simply lose this sample.
        let Some(scope) = ctx
            .directory()
            .get(thread_id)
            .and_then(|manager| manager.current_scope())
        else {
            stats.dropped += 1;
            continue;
        };
        let frames = &frames[..frames.len().min(max_depth)];
        let Some(stack) = ctx.pools().intern_stack(frames)? else {
            stats.dropped += 1;
            continue;
        };
        if scope.record_sample(stack) {
            stats.recorded += 1;
        } else {
            stats.dropped += 1;
        }
    }
    Ok(stats)
}

/// Runs a tick and reports failures through the rate limiter. Never panics.
pub(crate) fn run_tick(ctx: &RecordingContext) -> Option<TickStats> {
    match tick(ctx) {
        Ok(stats) => {
            tracing::trace!(
                tracked = stats.tracked,
                recorded = stats.recorded,
                dropped = stats.dropped,
                "sampling tick"
            );
            Some(stats)
        }
        Err(err) => {
            if let Some(suppressed) = ctx.tick_errors().check() {
                tracing::warn!(error = %err, suppressed, "sampling tick failed");
            }
            None
        }
    }
}

fn sampler_thread(ctx: Arc<RecordingContext>, stop: Receiver<()>) {
    let period = ctx.config().sampling_period;
    tracing::debug!(?period, "sampler thread started");
    let ticker = crossbeam_channel::tick(period);
    loop {
        // A message or a disconnect on `stop` both end the loop.
        let due = select! {
            recv(stop) -> _ => false,
            recv(ticker) -> _ => true,
        };
        if !due {
            break;
        }
        run_tick(&ctx);
    }
    tracing::debug!("sampler thread stopped");
}

/// The background sampling thread. It runs at the platform's default
/// priority; lowering it is left to the embedding process.
pub struct SamplingScheduler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SamplingScheduler {
    pub(crate) fn spawn(ctx: Arc<RecordingContext>) -> std::io::Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name("method-tracing-sampler".to_string())
            .spawn(move || sampler_thread(ctx, stop_rx))?;
        Ok(SamplingScheduler {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops scheduling ticks. A tick already running finishes normally;
    /// this does not wait for it.
    pub fn shutdown(&self) {
        // Full or disconnected both mean the thread is already stopping.
        let _ignore_err = self.stop.try_send(());
    }

    /// Stops the thread and waits for it to exit.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("sampler thread panicked");
            }
        }
    }
}

impl Drop for SamplingScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
