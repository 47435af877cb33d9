//! Cache level estimation by sweeping working-set sizes and looking for cliffs.
//!
//! A cache level shows up as a sharp regression between two neighbouring sizes: bandwidth drops
//! or latency jumps once the working set no longer fits. The size just below the regression is
//! taken as the level's capacity. This is an estimate: it needs measurement noise to stay below
//! the threshold and needs the levels to differ clearly in size.
use crate::bandwidth::{Bandwidth, BandwidthSampler, FlatBuffer};
use crate::config::Config;
use crate::error::Result;
use crate::latency::LatencySampler;
use crate::pattern::{AccessPattern, NODE_SIZE};
use crate::sample::Sample;
use crate::{KIB, MIB, format_size};
use log::{debug, info};
use rand::Rng;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Multiply by this factor each step
    Geometric(usize),
    /// Add this many bytes each step
    Linear(usize),
}

/// Ascending working-set sizes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepRange {
    pub start: usize,
    pub end: usize,
    pub step: Step,
}

impl Default for SweepRange {
    fn default() -> Self {
        SweepRange {
            start: 4 * KIB,
            end: 32 * MIB,
            step: Step::Geometric(2),
        }
    }
}

impl SweepRange {
    pub fn linear(start: usize, end: usize, step: usize) -> Self {
        SweepRange {
            start,
            end,
            step: Step::Linear(step),
        }
    }

    /// Every size from `start` up to and including `end`
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut size = self.start.max(1);
        while size <= self.end {
            sizes.push(size);
            size = match self.step {
                Step::Geometric(factor) => size.saturating_mul(factor.max(2)),
                Step::Linear(bytes) => size.saturating_add(bytes.max(1)),
            };
            if size == usize::MAX {
                break;
            }
        }
        sizes
    }
}

/// Which discontinuity the sweep looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Sequential read bandwidth; a boundary is a relative drop
    Bandwidth,
    /// Pointer-chase latency; a boundary is a ratio jump
    Latency,
}

/// Regression sizes that count as a cache boundary. Chosen empirically, not calibrated per CPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// `1 - bw[i] / bw[i-1]` above this is a boundary
    pub bandwidth_drop: f64,
    /// `lat[i] / lat[i-1]` above this is a boundary
    pub latency_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            bandwidth_drop: 0.3,
            latency_ratio: 1.5,
        }
    }
}

impl Thresholds {
    fn regressed(&self, metric: Metric, prev: f64, cur: f64) -> bool {
        if !(prev.is_finite() && cur.is_finite()) || prev <= 0.0 {
            return false;
        }
        match metric {
            Metric::Bandwidth => 1.0 - cur / prev > self.bandwidth_drop,
            Metric::Latency => cur / prev > self.latency_ratio,
        }
    }
}

/// Smallest fitting size accepted for each level; earlier regressions are treated as noise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMinimums {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl Default for LevelMinimums {
    fn default() -> Self {
        LevelMinimums {
            l1: 8 * KIB,
            l2: 64 * KIB,
            l3: MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

impl CacheLevel {
    pub const ALL: [CacheLevel; 3] = [CacheLevel::L1, CacheLevel::L2, CacheLevel::L3];
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLevel::L1 => write!(f, "L1"),
            CacheLevel::L2 => write!(f, "L2"),
            CacheLevel::L3 => write!(f, "L3"),
        }
    }
}

/// Estimated capacity of each level in bytes. Levels without a detected boundary keep the
/// typical defaults, so no level is ever unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizeEstimate {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
    pub detected: [bool; 3],
}

impl Default for CacheSizeEstimate {
    fn default() -> Self {
        CacheSizeEstimate {
            l1: 32 * KIB,
            l2: 256 * KIB,
            l3: 8 * MIB,
            detected: [false; 3],
        }
    }
}

impl CacheSizeEstimate {
    pub fn get(&self, level: CacheLevel) -> usize {
        match level {
            CacheLevel::L1 => self.l1,
            CacheLevel::L2 => self.l2,
            CacheLevel::L3 => self.l3,
        }
    }

    pub fn is_detected(&self, level: CacheLevel) -> bool {
        self.detected[level as usize]
    }

    fn set(&mut self, level: CacheLevel, bytes: usize) {
        match level {
            CacheLevel::L1 => self.l1 = bytes,
            CacheLevel::L2 => self.l2 = bytes,
            CacheLevel::L3 => self.l3 = bytes,
        }
        self.detected[level as usize] = true;
    }
}

/// Attribute regressions in an ascending size series to L1, L2 and L3, in that order
pub fn detect_boundaries(
    sizes: &[usize],
    values: &[f64],
    metric: Metric,
    thresholds: &Thresholds,
    minimums: &LevelMinimums,
) -> CacheSizeEstimate {
    let mut estimate = CacheSizeEstimate::default();
    let mut levels = CacheLevel::ALL.iter().copied();
    let mut level = levels.next();
    let len = sizes.len().min(values.len());

    for i in 1..len {
        let Some(current) = level else { break };
        if !thresholds.regressed(metric, values[i - 1], values[i]) {
            continue;
        }
        let fitting = sizes[i - 1];
        let minimum = match current {
            CacheLevel::L1 => minimums.l1,
            CacheLevel::L2 => minimums.l2,
            CacheLevel::L3 => minimums.l3,
        };
        if fitting < minimum {
            debug!(
                "Ignoring regression after {} for {} (below {} minimum)",
                format_size(fitting),
                current,
                format_size(minimum)
            );
            continue;
        }
        debug!("{} boundary after {}", current, format_size(fitting));
        estimate.set(current, fitting);
        level = levels.next();
    }

    estimate
}

/// Sizes, measured values and the resulting estimate of one sweep
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    pub metric: Metric,
    pub sizes: Vec<usize>,
    pub samples: Vec<Sample>,
    pub estimate: CacheSizeEstimate,
}

impl Sweep {
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

/// Chase latency of a fresh pattern spanning `bytes`
fn latency_at<R: Rng + ?Sized>(
    bytes: usize,
    steps: u64,
    config: &Config,
    rng: &mut R,
) -> Result<Sample> {
    let nodes = (bytes / NODE_SIZE).max(2);
    let pattern = AccessPattern::generate(nodes, config.min_stride, rng)?;
    Ok(LatencySampler::new(config).measure(&pattern, steps).fastest())
}

fn measure_range<R: Rng + ?Sized>(
    range: &SweepRange,
    metric: Metric,
    config: &Config,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<Sample>)> {
    let sizes = range.sizes();
    let bandwidth = BandwidthSampler::new(config);
    let mut samples = Vec::with_capacity(sizes.len());

    for &size in &sizes {
        let sample = match metric {
            Metric::Bandwidth => bandwidth.read(&FlatBuffer::with_bytes(size)?),
            Metric::Latency => latency_at(size, config.sweep_iterations, config, rng)?,
        };
        debug!(
            "Sweep {}: {:.2} {}",
            format_size(size),
            sample.value,
            unit(metric)
        );
        samples.push(sample);
    }
    Ok((sizes, samples))
}

fn unit(metric: Metric) -> &'static str {
    match metric {
        Metric::Bandwidth => "GB/s",
        Metric::Latency => "ns",
    }
}

/// Sweep the configured range with the configured metric and estimate L1/L2/L3
pub fn estimate_cache_sizes<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Sweep> {
    info!(
        "Cache sweep: {} to {} by {}",
        format_size(config.sweep.start),
        format_size(config.sweep.end),
        match config.metric {
            Metric::Bandwidth => "read bandwidth",
            Metric::Latency => "chase latency",
        }
    );
    let (sizes, samples) = measure_range(&config.sweep, config.metric, config, rng)?;
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let estimate = detect_boundaries(
        &sizes,
        &values,
        config.metric,
        &config.thresholds,
        &config.level_minimums,
    );
    for level in CacheLevel::ALL {
        info!(
            "{} (estimated): {}{}",
            level,
            format_size(estimate.get(level)),
            if estimate.is_detected(level) { "" } else { " (default)" }
        );
    }
    Ok(Sweep {
        metric: config.metric,
        sizes,
        samples,
        estimate,
    })
}

/// Three independent latency sweeps, one per level, each over the range that level usually
/// falls in. A level whose range shows no jump keeps its default.
pub fn estimate_per_level<R: Rng + ?Sized>(
    config: &Config,
    rng: &mut R,
) -> Result<CacheSizeEstimate> {
    let ranges = [
        (CacheLevel::L1, SweepRange::linear(4 * KIB, 64 * KIB, 4 * KIB)),
        (CacheLevel::L2, SweepRange::linear(64 * KIB, MIB, 64 * KIB)),
        (CacheLevel::L3, SweepRange::linear(MIB, 32 * MIB, MIB)),
    ];
    let mut estimate = CacheSizeEstimate::default();

    for (level, range) in ranges {
        let (sizes, samples) = measure_range(&range, Metric::Latency, config, rng)?;
        let jump = (1..samples.len()).find(|&i| {
            config
                .thresholds
                .regressed(Metric::Latency, samples[i - 1].value, samples[i].value)
        });
        if let Some(i) = jump {
            estimate.set(level, sizes[i - 1]);
        }
        info!(
            "{} per-level sweep: {}{}",
            level,
            format_size(estimate.get(level)),
            if jump.is_some() { "" } else { " (default)" }
        );
    }
    Ok(estimate)
}

/// Latency and bandwidth measured at one target size
#[derive(Debug, Clone, PartialEq)]
pub struct LevelProbe {
    pub name: &'static str,
    pub bytes: usize,
    pub latency: Sample,
    pub bandwidth: Bandwidth,
}

/// Measure each level at half its estimated size, plus a size beyond every cache
pub fn probe_levels<R: Rng + ?Sized>(
    estimate: &CacheSizeEstimate,
    config: &Config,
    rng: &mut R,
) -> Result<Vec<LevelProbe>> {
    let mut targets = vec![
        ("L1 Cache", estimate.l1 / 2),
        ("L2 Cache", estimate.l2 / 2),
        ("L3 Cache", estimate.l3 / 2),
    ];
    if !config.skip_large_tests {
        targets.push(("Main Memory", 64 * MIB));
    }

    let bandwidth = BandwidthSampler::new(config);
    let mut probes = Vec::with_capacity(targets.len());
    for (name, bytes) in targets {
        info!("Probing {} ({})", name, format_size(bytes));
        let latency = latency_at(bytes, config.sweep_iterations, config, rng)?;
        let bandwidth = bandwidth.measure(bytes)?;
        probes.push(LevelProbe {
            name,
            bytes,
            latency,
            bandwidth,
        });
    }
    Ok(probes)
}

/// Latency at one block size
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeLatency {
    pub bytes: usize,
    pub latency: Sample,
}

/// Timed steps for a block of `nodes`: more for blocks that fit in cache, fewer for huge ones
pub fn steps_for_block(nodes: usize, iterations: u64) -> u64 {
    if nodes < 1000 {
        iterations.saturating_mul(10)
    } else if nodes > 1_000_000 {
        (iterations / 10).max(1)
    } else {
        iterations
    }
}

/// Chase latency at fixed block sizes from L1-sized to well past L3
pub fn latency_by_size<R: Rng + ?Sized>(config: &Config, rng: &mut R) -> Result<Vec<SizeLatency>> {
    let mut sizes = vec![4 * KIB, 64 * KIB, MIB, 8 * MIB];
    if !config.skip_large_tests {
        sizes.push(64 * MIB);
    }

    let sampler = LatencySampler::new(config);
    let mut results = Vec::with_capacity(sizes.len());
    for bytes in sizes {
        let nodes = (bytes / NODE_SIZE).max(2);
        let pattern = AccessPattern::generate(nodes, config.min_stride, rng)?;
        let latency = sampler.measure_once(&pattern, steps_for_block(nodes, config.iterations));
        info!(
            "Block size: {} | Latency: {:.2} ns",
            format_size(bytes),
            latency.value
        );
        results.push(SizeLatency { bytes, latency });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometric() -> Vec<usize> {
        SweepRange::default().sizes()
    }

    fn detect(values: &[f64], metric: Metric) -> CacheSizeEstimate {
        detect_boundaries(
            &geometric(),
            values,
            metric,
            &Thresholds::default(),
            &LevelMinimums::default(),
        )
    }

    #[test]
    fn default_sweep_is_4k_to_32m_doubling() {
        let sizes = geometric();
        assert_eq!(sizes.len(), 14);
        assert_eq!(sizes[0], 4 * KIB);
        assert_eq!(sizes[13], 32 * MIB);
    }

    #[test]
    fn linear_sweep_includes_end() {
        let sizes = SweepRange::linear(4 * KIB, 64 * KIB, 4 * KIB).sizes();
        assert_eq!(sizes.len(), 16);
        assert_eq!(*sizes.last().unwrap(), 64 * KIB);
    }

    #[test]
    fn single_drop_sets_only_l1() {
        // drop between 64 KiB (index 4) and 128 KiB (index 5)
        let mut values = vec![100.0; 14];
        for v in &mut values[5..] {
            *v = 50.0;
        }
        let est = detect(&values, Metric::Bandwidth);
        assert_eq!(est.l1, 64 * KIB);
        assert!(est.is_detected(CacheLevel::L1));
        assert_eq!(est.l2, 256 * KIB);
        assert_eq!(est.l3, 8 * MIB);
        assert_eq!(est.detected, [true, false, false]);
    }

    #[test]
    fn no_drop_keeps_defaults() {
        let est = detect(&[100.0; 14], Metric::Bandwidth);
        assert_eq!(est, CacheSizeEstimate::default());
    }

    #[test]
    fn three_drops_are_ordered() {
        // 32 KiB -> 64 KiB, 512 KiB -> 1 MiB, 16 MiB -> 32 MiB
        let values = [
            200.0, 200.0, 200.0, 200.0, 120.0, 120.0, 120.0, 120.0, 60.0, 60.0, 60.0, 60.0, 60.0,
            20.0,
        ];
        let est = detect(&values, Metric::Bandwidth);
        assert_eq!((est.l1, est.l2, est.l3), (32 * KIB, 512 * KIB, 16 * MIB));
        assert!(est.l1 < est.l2 && est.l2 < est.l3);
    }

    #[test]
    fn drop_below_threshold_is_ignored() {
        let mut values = vec![100.0; 14];
        for v in &mut values[5..] {
            *v = 75.0;
        }
        assert_eq!(detect(&values, Metric::Bandwidth), CacheSizeEstimate::default());
    }

    #[test]
    fn noise_at_tiny_sizes_is_not_l1() {
        // 4 KiB -> 8 KiB drop fits below the 8 KiB L1 minimum
        let mut values = vec![100.0; 14];
        values[1] = 50.0;
        values[2] = 100.0;
        for v in &mut values[6..] {
            *v = 40.0;
        }
        let est = detect(&values, Metric::Bandwidth);
        assert_eq!(est.l1, 128 * KIB);
        assert_eq!(est.detected, [true, false, false]);
    }

    #[test]
    fn latency_metric_uses_ratio() {
        let mut values = vec![1.0; 14];
        for v in &mut values[4..] {
            *v = 4.0;
        }
        // 1.4x is under the 1.5x ratio
        for v in &mut values[10..] {
            *v = 4.0 * 1.4;
        }
        let est = detect(&values, Metric::Latency);
        assert_eq!(est.l1, 32 * KIB);
        assert_eq!(est.detected, [true, false, false]);
    }

    #[test]
    fn non_finite_values_never_mark_a_boundary() {
        let mut values = vec![100.0; 14];
        values[3] = f64::INFINITY;
        values[7] = f64::NAN;
        assert_eq!(detect(&values, Metric::Bandwidth), CacheSizeEstimate::default());
    }

    #[test]
    fn block_steps_scale_with_size() {
        assert_eq!(steps_for_block(64, 1000), 10_000);
        assert_eq!(steps_for_block(16_384, 1000), 1000);
        assert_eq!(steps_for_block(1 << 20, 1000), 100);
    }
}
