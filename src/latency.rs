//! Latency measurement via pointer chasing.
//!
//! Every step loads the successor index out of the current node, so the loads form one
//! dependency chain and the elapsed time divided by the step count is the load-to-use latency
//! of whatever level of the hierarchy holds the pattern.
use crate::config::Config;
use crate::error::Result;
use crate::pattern::AccessPattern;
use crate::sample::Sample;
use log::{debug, info};
use rand::Rng;
use std::hint::black_box;
use std::time::{Duration, Instant};

/// Untimed steps for an `n` node pattern: ten laps, capped
pub fn warmup_steps(n: usize, cap: u64) -> u64 {
    (n as u64).saturating_mul(10).min(cap)
}

/// Chase `steps` successors starting at storage index `start`, returning the final index.
///
/// The returned index must be used by the caller; it is what keeps the loop observable.
///
/// # Panics
///
/// If `start` is not a storage index of `pattern`.
#[inline(never)]
pub fn chase(pattern: &AccessPattern, start: usize, steps: u64) -> usize {
    let nodes = pattern.nodes();
    assert!(start < nodes.len(), "chase start {} outside pattern", start);
    let ptr = nodes.as_ptr();
    let mut idx = start;

    // SAFETY: every `next` in an AccessPattern is a storage index below `nodes.len()`, and
    // `start` was checked above
    for _ in 0..steps / 8 {
        // Unroll 8x to reduce loop overhead relative to memory latency
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
        idx = unsafe { (*ptr.add(idx)).next };
    }
    for _ in 0..steps % 8 {
        idx = unsafe { (*ptr.add(idx)).next };
    }

    black_box(idx)
}

/// Latency figures over several passes of the same pattern
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub passes: Vec<Sample>,
    /// Fastest pass, the figure least disturbed by the scheduler
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Storage index the last pass ended on
    pub cursor: usize,
}

impl LatencyStats {
    fn from_passes(passes: Vec<Sample>, cursor: usize) -> Self {
        let min = passes.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
        let max = passes.iter().map(|s| s.value).fold(0.0, f64::max);
        let mean = passes.iter().map(|s| s.value).sum::<f64>() / passes.len().max(1) as f64;
        LatencyStats {
            passes,
            min,
            max,
            mean,
            cursor,
        }
    }

    /// Fastest pass. An empty pass list yields a zero-duration sample, which is flagged.
    pub fn fastest(&self) -> Sample {
        self.passes
            .iter()
            .copied()
            .min_by(|a, b| a.value.total_cmp(&b.value))
            .unwrap_or_else(|| Sample::latency(Duration::ZERO, 0, 0.0))
    }

    /// True if any pass was flagged as implausible
    pub fn is_suspect(&self) -> bool {
        self.passes.iter().any(Sample::is_suspect)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LatencySampler {
    pub warmup_cap: u64,
    pub passes: usize,
    pub floor_ns: f64,
}

impl LatencySampler {
    pub fn new(config: &Config) -> Self {
        LatencySampler {
            warmup_cap: config.warmup_cap,
            passes: config.passes.max(1),
            floor_ns: config.min_plausible_latency_ns,
        }
    }

    /// Walk the pattern untimed to pull it into whichever caches it fits, returning the cursor
    pub fn warm_up(&self, pattern: &AccessPattern) -> usize {
        let steps = warmup_steps(pattern.len(), self.warmup_cap);
        chase(pattern, pattern.start(), steps)
    }

    /// One timed pass of `steps` dependent loads starting at `cursor`
    pub fn time(&self, pattern: &AccessPattern, cursor: usize, steps: u64) -> (Sample, usize) {
        let start = Instant::now();
        let end = chase(pattern, cursor, steps);
        let elapsed = start.elapsed();
        (Sample::latency(elapsed, steps, self.floor_ns), end)
    }

    /// Warm up, then time one pass
    pub fn measure_once(&self, pattern: &AccessPattern, steps: u64) -> Sample {
        let cursor = self.warm_up(pattern);
        self.time(pattern, cursor, steps).0
    }

    /// Warm up, then time `passes` passes without rebuilding the pattern
    pub fn measure(&self, pattern: &AccessPattern, steps: u64) -> LatencyStats {
        let mut cursor = self.warm_up(pattern);
        let mut passes = Vec::with_capacity(self.passes);
        for pass in 0..self.passes {
            let (sample, end) = self.time(pattern, cursor, steps);
            debug!("Pass {}: {:.2} ns", pass + 1, sample.value);
            passes.push(sample);
            cursor = end;
        }
        LatencyStats::from_passes(passes, cursor)
    }
}

/// Multi-pass latency over the configured working set with a prefetcher-defeating pattern
pub fn working_set_latency<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<LatencyStats> {
    let n = Config::nodes_for(config.working_set_bytes);
    info!(
        "Latency test: {} nodes ({}), {} iterations x {} passes",
        n,
        crate::format_size(config.working_set_bytes),
        config.iterations,
        config.passes
    );
    let pattern = AccessPattern::generate(n, config.min_stride, rng)?;
    let stats = LatencySampler::new(config).measure(&pattern, config.iterations);
    info!(
        "Latency: min {:.2} ns, max {:.2} ns, mean {:.2} ns",
        stats.min, stats.max, stats.mean
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pattern(n: usize) -> AccessPattern {
        AccessPattern::generate(n, Some(16), &mut StdRng::seed_from_u64(42)).unwrap()
    }

    fn sampler() -> LatencySampler {
        LatencySampler {
            warmup_cap: 1_000_000,
            passes: 5,
            floor_ns: 0.3,
        }
    }

    #[test]
    fn warmup_is_ten_laps_capped() {
        assert_eq!(warmup_steps(1000, 1_000_000), 10_000);
        assert_eq!(warmup_steps(1 << 20, 1_000_000), 1_000_000);
    }

    #[test]
    fn chase_follows_the_cycle_exactly() {
        let p = pattern(1000);
        let order = p.order();
        assert_eq!(chase(&p, order[0], 0), order[0]);
        assert_eq!(chase(&p, order[0], 13), order[13]);
        assert_eq!(chase(&p, order[0], 1000), order[0]);
        assert_eq!(chase(&p, order[0], 2003), order[3]);
    }

    #[test]
    fn multi_pass_stats_are_ordered() {
        let p = pattern(2000);
        let stats = sampler().measure(&p, 100_000);
        assert_eq!(stats.passes.len(), 5);
        assert!(stats.min > 0.0);
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        // 100_000 steps per pass, five passes after a 20_000 step warm-up
        let expected = (20_000 + 5 * 100_000) % 2000;
        assert_eq!(stats.cursor, p.order()[expected]);
    }

    #[test]
    fn elapsed_grows_with_step_count() {
        let p = pattern(4096);
        let s = sampler();
        let cursor = s.warm_up(&p);
        let (short, _) = s.time(&p, cursor, 1_000);
        let (long, _) = s.time(&p, cursor, 2_000_000);
        assert!(long.elapsed >= short.elapsed);
        assert_eq!(long.count, 2_000_000);
    }
}
