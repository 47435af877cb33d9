//! Measurement configuration consumed by every routine.
//!
//! The two historical test suites differ only in their defaults, so they are expressed as presets
//! of one [`Config`] rather than as separate code paths.
use crate::cache::{LevelMinimums, Metric, SweepRange, Thresholds};
use crate::error::{Error, Result};
use crate::pattern::NODE_SIZE;
use crate::{GIB, MIB};
use log::warn;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Fewest nodes the primary latency and scaling tests accept
pub const MIN_NODES: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Working set of the primary latency test, in bytes
    pub working_set_bytes: usize,
    /// Timed pointer dereferences per latency pass
    pub iterations: u64,
    /// Highest thread count the scaling harness reaches
    pub threads: usize,
    /// Minimum storage distance between a node and its successor. `None` selects `max(16, N/4)`
    pub min_stride: Option<usize>,
    /// Statistical passes per latency figure
    pub passes: usize,
    /// Working-set sizes visited by the cache boundary sweep
    pub sweep: SweepRange,
    /// Whether the sweep watches bandwidth drops or latency jumps
    pub metric: Metric,
    pub thresholds: Thresholds,
    pub level_minimums: LevelMinimums,
    /// Timed steps per size in latency-based sweeps
    pub sweep_iterations: u64,
    /// Skip tests that need 64 MiB or more beyond the primary working set
    pub skip_large_tests: bool,
    /// Upper bound on untimed warm-up steps
    pub warmup_cap: u64,
    /// Bytes every bandwidth measurement should move, regardless of buffer size
    pub bandwidth_target_bytes: usize,
    pub bandwidth_min_passes: usize,
    /// Per-thread working set in the scaling harness, before the aggregate cap applies
    pub per_thread_bytes: usize,
    /// Aggregate memory the scaling harness may hold at once
    pub total_cap_bytes: usize,
    pub min_thread_iterations: u64,
    /// Pin scaling workers to distinct cores
    pub pin_threads: bool,
    /// Seed for reproducible access patterns; entropy when unset
    pub seed: Option<u64>,
    pub min_plausible_latency_ns: f64,
    pub max_plausible_bandwidth_gbs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            working_set_bytes: 256 * MIB,
            iterations: 10_000_000,
            threads: logical_cores(),
            min_stride: None,
            passes: 5,
            sweep: SweepRange::default(),
            metric: Metric::Bandwidth,
            thresholds: Thresholds::default(),
            level_minimums: LevelMinimums::default(),
            sweep_iterations: 1_000_000,
            skip_large_tests: false,
            warmup_cap: 1_000_000,
            bandwidth_target_bytes: GIB,
            bandwidth_min_passes: 10,
            per_thread_bytes: 64 * MIB,
            total_cap_bytes: GIB,
            min_thread_iterations: 1_000_000,
            pin_threads: true,
            seed: None,
            min_plausible_latency_ns: 0.3,
            max_plausible_bandwidth_gbs: 5000.0,
        }
    }
}

impl Config {
    /// Defaults of the cache-oriented suite: fewer iterations per test
    pub fn cache_suite() -> Self {
        Config {
            iterations: 1_000_000,
            ..Config::default()
        }
    }

    /// Node count needed to cover `bytes`
    pub fn nodes_for(bytes: usize) -> usize {
        bytes / NODE_SIZE
    }

    /// Reject sizes too small for a meaningful test
    pub fn validate(&self) -> Result<()> {
        let nodes = Self::nodes_for(self.working_set_bytes);
        if nodes < MIN_NODES {
            return Err(Error::Configuration {
                what: "working set nodes",
                requested: nodes,
                minimum: MIN_NODES,
            });
        }
        let per_thread = Self::nodes_for(self.per_thread_bytes);
        if per_thread < MIN_NODES {
            return Err(Error::Configuration {
                what: "per-thread nodes",
                requested: per_thread,
                minimum: MIN_NODES,
            });
        }
        if self.threads == 0 {
            return Err(Error::Configuration {
                what: "threads",
                requested: 0,
                minimum: 1,
            });
        }
        Ok(())
    }

    /// Clamp out-of-range values to the enforced minimums, warning about each one
    pub fn normalized(mut self) -> Self {
        let min_bytes = MIN_NODES * NODE_SIZE;
        if self.working_set_bytes < min_bytes {
            warn!(
                "Working set of {} bytes is below the {} node minimum, using {} bytes",
                self.working_set_bytes, MIN_NODES, min_bytes
            );
            self.working_set_bytes = min_bytes;
        }
        if self.per_thread_bytes < min_bytes {
            warn!(
                "Per-thread block of {} bytes is below the {} node minimum, using {} bytes",
                self.per_thread_bytes, MIN_NODES, min_bytes
            );
            self.per_thread_bytes = min_bytes;
        }
        if self.threads == 0 {
            warn!("Thread count of 0 requested, using 1");
            self.threads = 1;
        }
        if self.passes == 0 {
            warn!("Pass count of 0 requested, using 1");
            self.passes = 1;
        }
        if self.iterations == 0 {
            warn!("Iteration count of 0 requested, using 1");
            self.iterations = 1;
        }
        self
    }

    /// Random source for pattern construction
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Logical core count of the host
pub fn logical_cores() -> usize {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => ids.len(),
        _ => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}
