//! Sequential versus random access comparisons.
//!
//! Two probes: a pointer chase over an identity chain against a minimum-stride random chain of
//! the same size, and index-driven loads over a flat buffer in sequential, random and strided
//! order. A large gap between the sequential and random figures is the prefetcher at work.
use crate::bandwidth::FlatBuffer;
use crate::config::Config;
use crate::error::Result;
use crate::format_size;
use crate::latency::LatencySampler;
use crate::pattern::AccessPattern;
use crate::sample::Sample;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Instant;

/// Random/sequential ratio above which a hardware prefetcher is considered active
pub const PREFETCHER_RATIO: f64 = 3.0;
/// Stride/sequential ratio above which the stride prefetcher is considered ineffective
pub const STRIDE_RATIO: f64 = 1.5;
/// Element stride of the strided index probe
pub const PROBE_STRIDE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainComparison {
    pub sequential: Sample,
    pub random: Sample,
    /// GB/s assuming one 8-byte word consumed per access
    pub sequential_gbs: f64,
    pub random_gbs: f64,
}

/// Chase an identity chain and a random chain of `bytes` each for `steps` steps
pub fn compare_chains<R: Rng + ?Sized>(
    bytes: usize,
    steps: u64,
    config: &Config,
    rng: &mut R,
) -> Result<ChainComparison> {
    let nodes = Config::nodes_for(bytes).max(2);
    info!(
        "Sequential vs random chase over {} ({} nodes)",
        format_size(bytes),
        nodes
    );
    let sampler = LatencySampler::new(config);

    let sequential = {
        let pattern = AccessPattern::sequential(nodes)?;
        sampler.measure_once(&pattern, steps)
    };
    let random = {
        let pattern = AccessPattern::generate(nodes, config.min_stride, rng)?;
        sampler.measure_once(&pattern, steps)
    };

    let word_gbs = |s: &Sample| (steps * 8) as f64 / s.elapsed.as_secs_f64() / 1e9;
    Ok(ChainComparison {
        sequential_gbs: word_gbs(&sequential),
        random_gbs: word_gbs(&random),
        sequential,
        random,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchProbe {
    pub sequential: Sample,
    pub random: Sample,
    pub strided: Sample,
}

impl PrefetchProbe {
    pub fn random_ratio(&self) -> f64 {
        self.random.value / self.sequential.value
    }

    pub fn stride_ratio(&self) -> f64 {
        self.strided.value / self.sequential.value
    }

    /// Sequential loads are much cheaper than random ones
    pub fn prefetcher_active(&self) -> bool {
        self.random_ratio() > PREFETCHER_RATIO
    }

    /// The strided walk is clearly slower than the sequential one
    pub fn stride_ineffective(&self) -> bool {
        self.stride_ratio() > STRIDE_RATIO
    }
}

#[inline(never)]
fn indexed_sum(words: &[u64], steps: u64, mut index: impl FnMut(u64) -> usize) -> u64 {
    let mut sum = 0u64;
    for i in 0..steps {
        sum = sum.wrapping_add(words[index(i)]);
    }
    black_box(sum)
}

fn timed(words: &[u64], steps: u64, floor_ns: f64, index: impl FnMut(u64) -> usize) -> Sample {
    let start = Instant::now();
    let sum = indexed_sum(words, steps, index);
    let elapsed = start.elapsed();
    black_box(sum);
    Sample::latency(elapsed, steps, floor_ns)
}

/// Sequential, random and strided index loads over `elements` words, `steps` loads each
pub fn probe_prefetcher(elements: usize, steps: u64, config: &Config) -> Result<PrefetchProbe> {
    let buf = FlatBuffer::new(elements.max(1))?;
    let words = buf.as_slice();
    let len = words.len();
    let floor = config.min_plausible_latency_ns;
    info!(
        "Prefetcher probe over {} with {} loads per order",
        format_size(buf.bytes()),
        steps
    );

    let sequential = timed(words, steps, floor, |i| i as usize % len);
    let mut rng = match config.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let random = timed(words, steps, floor, |_| rng.gen_range(0..len));
    let strided = timed(words, steps, floor, |i| (i as usize).wrapping_mul(PROBE_STRIDE) % len);

    Ok(PrefetchProbe {
        sequential,
        random,
        strided,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use std::time::Duration;

    fn cfg() -> Config {
        Config {
            seed: Some(9),
            warmup_cap: 10_000,
            ..Config::default()
        }
    }

    #[test]
    fn chain_comparison_reports_both_orders() {
        let mut rng = StdRng::seed_from_u64(5);
        let cmp = compare_chains(256 * 1024, 200_000, &cfg(), &mut rng).unwrap();
        assert!(cmp.sequential.value > 0.0 && cmp.sequential.value.is_finite());
        assert!(cmp.random.value > 0.0 && cmp.random.value.is_finite());
        assert!(cmp.sequential_gbs > 0.0 && cmp.random_gbs > 0.0);
    }

    #[test]
    fn prefetch_probe_times_three_orders() {
        let probe = probe_prefetcher(1 << 16, 100_000, &cfg()).unwrap();
        for s in [probe.sequential, probe.random, probe.strided] {
            assert_eq!(s.count, 100_000);
            assert!(s.value.is_finite() && s.value > 0.0);
        }
    }

    #[test]
    fn verdicts_follow_ratios() {
        let sample = |ns: f64| Sample {
            value: ns,
            elapsed: Duration::from_nanos(1),
            count: 1,
            anomaly: None,
        };
        let probe = PrefetchProbe {
            sequential: sample(1.0),
            random: sample(10.0),
            strided: sample(1.2),
        };
        assert!(probe.prefetcher_active());
        assert!(!probe.stride_ineffective());
        assert!((probe.random_ratio() - 10.0).abs() < 1e-12);
    }
}
