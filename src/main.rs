use std::{
    thread::{self, ScopedJoinHandle},
    time::{Duration, Instant},
};

use method_tracing::*;

/// Pretends every thread is parked in the same three frames.
struct SyntheticStacks;

impl StackSource for SyntheticStacks {
    fn snapshot(
        &self,
        ids: &[ThreadId],
        _max_depth: usize,
    ) -> Result<Vec<ThreadStack>, SampleError> {
        Ok(ids
            .iter()
            .map(|id| ThreadStack {
                thread_id: *id,
                frames: vec![
                    Frame::new("bench.Worker", "work", (*id % 7) as i32),
                    Frame::new("bench.Worker", "run", 12),
                    Frame::new("java.lang.Thread", "run", 840),
                ],
            })
            .collect())
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let threads = 20_usize;
    let rounds = 100_000;

    bench_scopes(threads, rounds);
}

fn bench_scopes(threads: usize, rounds: usize) {
    let (recorder, guard) = match RecorderBuilder::new()
        .sampling_period(Duration::from_millis(1))
        .stack_source(SyntheticStacks)
        .build()
    {
        Ok(built) => built,
        Err(err) => {
            eprintln!("failed to start sampler: {err}");
            return;
        }
    };

    thread::scope(|s| {
        let handles: Vec<ScopedJoinHandle<(usize, Duration, u64, usize)>> = (0..threads)
            .map(|id| {
                let recorder = &recorder;
                s.spawn(move || {
                    let t = Instant::now();
                    let mut samples = 0;
                    let mut bytes = 0;
                    for round in 0..rounds {
                        let outer = recorder.start_scope("request");
                        let inner = recorder.start_scope("handler");
                        samples += recorder.end_scope(inner).sample_count();
                        let chunk = recorder.end_scope(outer);
                        samples += chunk.sample_count();
                        if round % 1000 == 0 {
                            bytes += chunk.serialize().map(|b| b.len()).unwrap_or(0);
                        }
                    }
                    (id, t.elapsed(), samples, bytes)
                })
            })
            .collect();
        for h in handles {
            match h.join() {
                Ok((id, elapsed, samples, bytes)) => println!(
                    "thread {id}: {elapsed:?}, {:.0} scopes/s, {samples} samples, {bytes} bytes",
                    rounds as f64 / elapsed.as_secs_f64()
                ),
                Err(_) => eprintln!("bench thread panicked"),
            }
        }
    });

    guard.join();
    let pools = recorder.context().pools();
    println!(
        "pools: {} strings, {} frames, {} stacks",
        pools.strings.len(),
        pools.frames.len(),
        pools.stacks.len()
    );
}
