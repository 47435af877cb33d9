//! # Concurrency scaling
//!
//! Replicates the pointer chase across 1..=T concurrently running threads. Every worker owns a
//! private pattern, so the curve shows how latency degrades as more cores share the memory
//! subsystem, not contention on one shared structure.
//!
//! Rounds run strictly one after another. Within a round the coordinator builds and warms all
//! patterns, spawns one named worker per pattern (pinned to its own core where the OS allows),
//! then releases them together. Each worker hands its own result back through its join handle;
//! there is no shared accumulator.
use crate::config::{Config, MIN_NODES};
use crate::error::{Error, Result};
use crate::format_size;
use crate::latency::{LatencySampler, chase};
use crate::pattern::{AccessPattern, NODE_SIZE};
use crate::sample::Sample;
use core_affinity::CoreId;
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

/// Untimed steps each worker pattern gets before a round starts, capped at one lap
pub const THREAD_WARMUP_STEPS: u64 = 100_000;

/// Average latency at one thread count
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPoint {
    pub threads: usize,
    pub avg_latency_ns: f64,
    pub per_thread: Vec<Sample>,
    /// Wall time of the whole round, from release to the last worker finishing
    pub round_elapsed: Duration,
}

impl ScalingPoint {
    pub fn is_suspect(&self) -> bool {
        self.per_thread.iter().any(Sample::is_suspect)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingResult {
    /// One point per thread count, 1..=T in order
    pub points: Vec<ScalingPoint>,
    /// Working set of every worker pattern
    pub block_bytes: usize,
}

/// Per-thread block size for `max_threads` workers, shrunk so the total stays within `cap`.
/// The block never drops below `MIN_NODES` nodes, even if that overshoots the cap.
pub fn block_bytes(per_thread: usize, cap: usize, max_threads: usize) -> usize {
    let threads = max_threads.max(1);
    if per_thread.saturating_mul(threads) <= cap {
        return per_thread;
    }
    let floor = MIN_NODES * NODE_SIZE;
    let shrunk = cap / threads;
    if shrunk < floor {
        warn!(
            "{} per thread across {} threads is below {} nodes, using {} (total {})",
            format_size(shrunk),
            threads,
            MIN_NODES,
            format_size(floor),
            format_size(floor.saturating_mul(threads))
        );
        return floor;
    }
    shrunk
}

pub struct ScalingHarness {
    max_threads: usize,
    block_nodes: usize,
    iterations: u64,
    min_thread_iterations: u64,
    min_stride: Option<usize>,
    sampler: LatencySampler,
    cores: Vec<CoreId>,
}

impl ScalingHarness {
    pub fn new(config: &Config) -> Self {
        let bytes = block_bytes(
            config.per_thread_bytes,
            config.total_cap_bytes,
            config.threads,
        );
        let cores = if config.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if config.pin_threads && cores.is_empty() {
            warn!("Couldn't enumerate CPU cores; scaling workers will not be pinned");
        }
        ScalingHarness {
            max_threads: config.threads.max(1),
            block_nodes: (bytes / NODE_SIZE).max(2),
            iterations: config.iterations,
            min_thread_iterations: config.min_thread_iterations,
            min_stride: config.min_stride,
            sampler: LatencySampler::new(config),
            cores,
        }
    }

    /// Timed steps per worker in a round of `threads`
    pub fn steps_per_thread(&self, threads: usize) -> u64 {
        (self.iterations / threads.max(1) as u64).max(self.min_thread_iterations)
    }

    /// Run every round from 1 to the configured maximum
    pub fn run<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ScalingResult> {
        info!(
            "Scaling test: 1-{} threads, {} per thread",
            self.max_threads,
            format_size(self.block_nodes * NODE_SIZE)
        );
        let mut points = Vec::with_capacity(self.max_threads);
        for threads in 1..=self.max_threads {
            let point = self.round(threads, rng)?;
            info!(
                "{} thread(s): {:.2} ns average latency (total elapsed: {:?})",
                threads, point.avg_latency_ns, point.round_elapsed
            );
            points.push(point);
        }
        Ok(ScalingResult {
            points,
            block_bytes: self.block_nodes * NODE_SIZE,
        })
    }

    /// One round with `threads` concurrent workers
    pub fn round<R: Rng + ?Sized>(&self, threads: usize, rng: &mut R) -> Result<ScalingPoint> {
        let mut patterns = Vec::with_capacity(threads);
        for _ in 0..threads {
            patterns.push(AccessPattern::generate(self.block_nodes, self.min_stride, rng)?);
        }
        let cursors: Vec<usize> = patterns
            .iter()
            .map(|p| chase(p, p.start(), THREAD_WARMUP_STEPS.min(p.len() as u64)))
            .collect();

        let steps = self.steps_per_thread(threads);
        let sampler = self.sampler;
        let barrier = Barrier::new(threads);
        let (go_tx, go_rx) = crossbeam_channel::bounded::<()>(threads);

        let (samples, round_elapsed) = thread::scope(|scope| -> Result<(Vec<Sample>, Duration)> {
            let mut handles = Vec::with_capacity(threads);
            for (id, (pattern, &cursor)) in patterns.iter().zip(&cursors).enumerate() {
                let barrier = &barrier;
                let go_rx = go_rx.clone();
                let core = self.core_for(id);
                let spawned = thread::Builder::new()
                    .name(format!("chase-{}", id))
                    .spawn_scoped(scope, move || {
                        prepare_worker(id, core);
                        // Closed without a go signal: the round was abandoned
                        go_rx.recv().ok()?;
                        barrier.wait();
                        Some(sampler.time(pattern, cursor, steps).0)
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        drop(go_tx);
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(Error::Spawn(e));
                    }
                }
            }

            let start = Instant::now();
            for _ in 0..threads {
                // Every worker holds a receiver, so this cannot fail
                let _ = go_tx.send(());
            }
            let mut samples = Vec::with_capacity(threads);
            for (id, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Some(sample)) => samples.push(sample),
                    _ => return Err(Error::WorkerPanicked(id)),
                }
            }
            Ok((samples, start.elapsed()))
        })?;

        let avg_latency_ns = samples.iter().map(|s| s.value).sum::<f64>() / threads as f64;
        debug!(
            "Round of {}: {:?}",
            threads,
            samples.iter().map(|s| s.value).collect::<Vec<_>>()
        );
        Ok(ScalingPoint {
            threads,
            avg_latency_ns,
            per_thread: samples,
            round_elapsed,
        })
    }

    fn core_for(&self, worker: usize) -> Option<CoreId> {
        if self.cores.is_empty() {
            None
        } else {
            Some(self.cores[worker % self.cores.len()])
        }
    }
}

/// Pin the calling worker and raise its priority, warning (once per round) when the OS refuses
fn prepare_worker(id: usize, core: Option<CoreId>) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(core) {
            if id == 0 {
                warn!(
                    "Couldn't pin worker to CPU core {} (NOTE: this is expected on macOS)",
                    core.id
                );
            } else {
                debug!("Couldn't pin worker {} to CPU core {}", id, core.id);
            }
        }
    }

    if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err()
    {
        if id == 0 {
            warn!("Couldn't set scaling workers to maximum thread priority");
        } else {
            debug!("Couldn't set worker {} to maximum thread priority", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small_config(threads: usize) -> Config {
        Config {
            threads,
            per_thread_bytes: 2000 * NODE_SIZE,
            iterations: 200_000,
            min_thread_iterations: 50_000,
            pin_threads: false,
            seed: Some(1),
            ..Config::default()
        }
    }

    #[test]
    fn block_shrinks_past_the_cap() {
        let mib = 1 << 20;
        assert_eq!(block_bytes(64 * mib, 1024 * mib, 8), 64 * mib);
        assert_eq!(block_bytes(64 * mib, 1024 * mib, 16), 64 * mib);
        assert_eq!(block_bytes(64 * mib, 1024 * mib, 32), 32 * mib);
        assert_eq!(block_bytes(64 * mib, 1024 * mib, 0), 64 * mib);
    }

    #[test]
    fn shrunk_block_keeps_minimum_nodes() {
        let mib = 1 << 20;
        let floor = MIN_NODES * NODE_SIZE;
        // 32 MiB / 1024 threads = 32 KiB, under 1000 nodes
        assert_eq!(block_bytes(64 * mib, 32 * mib, 1024), floor);
        assert_eq!(block_bytes(64 * mib, 1024 * mib, 32 * 1024), floor);

        let config = Config {
            threads: 1024,
            per_thread_bytes: 64 * mib,
            total_cap_bytes: 32 * mib,
            pin_threads: false,
            ..Config::default()
        };
        let harness = ScalingHarness::new(&config);
        assert_eq!(harness.block_nodes, MIN_NODES);
    }

    #[test]
    fn per_thread_steps_have_a_floor() {
        let harness = ScalingHarness::new(&small_config(4));
        assert_eq!(harness.steps_per_thread(1), 200_000);
        assert_eq!(harness.steps_per_thread(2), 100_000);
        assert_eq!(harness.steps_per_thread(8), 50_000);
    }

    #[test]
    fn result_has_one_point_per_thread_count() {
        let config = small_config(3);
        let result = ScalingHarness::new(&config)
            .run(&mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_eq!(result.points.len(), 3);
        assert_eq!(result.block_bytes, 2000 * NODE_SIZE);
        for (i, point) in result.points.iter().enumerate() {
            assert_eq!(point.threads, i + 1);
            assert_eq!(point.per_thread.len(), i + 1);
            assert!(point.avg_latency_ns.is_finite() && point.avg_latency_ns > 0.0);
            assert!(point.round_elapsed > Duration::ZERO);
        }
    }

    #[test]
    fn average_is_mean_of_workers() {
        let config = small_config(4);
        let point = ScalingHarness::new(&config)
            .round(4, &mut StdRng::seed_from_u64(3))
            .unwrap();
        let mean = point.per_thread.iter().map(|s| s.value).sum::<f64>() / 4.0;
        assert!((point.avg_latency_ns - mean).abs() < 1e-9);
    }
}
