//! # Access patterns
//!
//! An [`AccessPattern`] is an arena of cache-line sized [`Node`]s whose `next` references form
//! one cycle through every node. Walking the cycle is a chain of dependent loads, so the CPU
//! cannot issue the next access before the current one resolves.
//!
//! The visiting order is built so that no node's successor lies within `min_stride` storage
//! positions of it (wrapping around the arena), which keeps sequential and stride prefetchers
//! from guessing the next line. The construction starts from a skeleton cycle `k * s mod N`
//! with `s` coprime to `N` and close to `N / 2`, then shuffles storage positions inside small
//! windows. Positions move by less than the window width, so the skeleton's large step survives
//! the shuffle while the exact addresses become unpredictable.
use crate::error::{Result, try_alloc};
use log::{debug, warn};
use rand::Rng;
use rand::seq::SliceRandom;

/// Size of one node, one cache line on every target we care about
pub const NODE_SIZE: usize = 64;

/// One cache line holding the storage index of its successor
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct Node {
    pub(crate) next: usize,
    _pad: [u8; NODE_SIZE - std::mem::size_of::<usize>()],
}

const _: () = assert!(std::mem::size_of::<Node>() == NODE_SIZE);

impl Node {
    const EMPTY: Node = Node {
        next: 0,
        _pad: [0; NODE_SIZE - std::mem::size_of::<usize>()],
    };
}

/// Default minimum stride for `n` nodes: `max(16, n / 4)`
pub fn default_stride(n: usize) -> usize {
    16.max(n / 4)
}

pub struct AccessPattern {
    nodes: Vec<Node>,
    /// Visiting order: `order[k]` is the storage index of the k-th node on the cycle
    order: Vec<usize>,
    min_stride: usize,
}

impl AccessPattern {
    /// Build a prefetcher-defeating cycle over `n` nodes.
    ///
    /// `min_stride` is clamped to the largest stride the construction can guarantee for `n`
    /// (slightly under `n / 2`). `n == 0` is rejected.
    pub fn generate<R: Rng + ?Sized>(
        n: usize,
        min_stride: Option<usize>,
        rng: &mut R,
    ) -> Result<Self> {
        check_len(n)?;
        let requested = min_stride.unwrap_or_else(|| default_stride(n));

        if n == 1 {
            let mut nodes = try_alloc(1, Node::EMPTY, "access pattern nodes")?;
            nodes[0].next = 0;
            return Ok(AccessPattern {
                nodes,
                order: vec![0],
                min_stride: 0,
            });
        }

        let (step, reach) = skeleton_step(n, requested, rng);
        let stride = requested.min(reach);
        if stride < requested {
            warn!(
                "Minimum stride {} is not achievable with {} nodes, using {}",
                requested, n, stride
            );
        }

        // Window shuffle: every position moves by less than `window`, so each skeleton hop of
        // `reach` shrinks by at most 2 * (window - 1) <= reach - stride
        let window = (reach - stride) / 2 + 1;
        let mut shuffled = try_alloc(n, 0usize, "access pattern order")?;
        for (i, slot) in shuffled.iter_mut().enumerate() {
            *slot = i;
        }
        for chunk in shuffled.chunks_mut(window) {
            chunk.shuffle(rng);
        }

        let mut order = try_alloc(n, 0usize, "access pattern order")?;
        let mut pos = 0usize;
        for slot in order.iter_mut() {
            *slot = shuffled[pos];
            pos = (pos + step) % n;
        }
        drop(shuffled);

        let nodes = link(&order)?;
        debug!(
            "Built access pattern: {} nodes, skeleton step {}, window {}, min stride {}",
            n, step, window, stride
        );
        Ok(AccessPattern {
            nodes,
            order,
            min_stride: stride,
        })
    }

    /// Identity chain `next(i) = i + 1`, the most prefetch-friendly walk possible
    pub fn sequential(n: usize) -> Result<Self> {
        check_len(n)?;
        let mut order = try_alloc(n, 0usize, "access pattern order")?;
        for (i, slot) in order.iter_mut().enumerate() {
            *slot = i;
        }
        let nodes = link(&order)?;
        Ok(AccessPattern {
            nodes,
            order,
            min_stride: if n > 1 { 1 } else { 0 },
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bytes covered by the arena
    pub fn bytes(&self) -> usize {
        self.nodes.len() * NODE_SIZE
    }

    /// Guaranteed minimum storage distance between a node and its successor
    pub fn min_stride(&self) -> usize {
        self.min_stride
    }

    /// Storage index of the first node on the cycle
    pub fn start(&self) -> usize {
        self.order[0]
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Storage index of the successor of node `index`
    pub fn successor(&self, index: usize) -> usize {
        self.nodes[index].next
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Wrapping distance between two storage positions in an arena of `n` nodes
pub fn storage_distance(a: usize, b: usize, n: usize) -> usize {
    let diff = a.abs_diff(b);
    diff.min(n - diff)
}

fn check_len(n: usize) -> Result<()> {
    if n == 0 {
        return Err(crate::error::Error::Configuration {
            what: "access pattern nodes",
            requested: 0,
            minimum: 1,
        });
    }
    Ok(())
}

fn link(order: &[usize]) -> Result<Vec<Node>> {
    let n = order.len();
    let mut nodes = try_alloc(n, Node::EMPTY, "access pattern nodes")?;
    for pair in order.windows(2) {
        nodes[pair[0]].next = pair[1];
    }
    nodes[order[n - 1]].next = order[0];
    Ok(nodes)
}

/// Choose a step `s` coprime with `n` near `n / 2`, returning it with its wrapping reach
/// `min(s, n - s)`. Jitter above `n / 2` varies the skeleton between patterns unless it would
/// push the reach below `wanted`.
fn skeleton_step<R: Rng + ?Sized>(n: usize, wanted: usize, rng: &mut R) -> (usize, usize) {
    let mid = (n / 2).max(1);
    let jitter = rng.gen_range(0..=n / 16);
    let jittered = next_coprime(mid + jitter, n);
    let reach = jittered.min(n - jittered);
    if reach >= wanted || jitter == 0 {
        return (jittered, reach);
    }
    let step = next_coprime(mid, n);
    (step, step.min(n - step))
}

/// Smallest value >= `from` coprime with `n`, wrapping to 1 if none is found below `n`
fn next_coprime(from: usize, n: usize) -> usize {
    (from..n).find(|&s| gcd(s, n) == 1).unwrap_or(1)
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn cycle_len(p: &AccessPattern) -> usize {
        let start = p.start();
        let mut seen = HashSet::new();
        let mut idx = start;
        for _ in 0..p.len() {
            assert!(seen.insert(idx), "node {} revisited early", idx);
            idx = p.successor(idx);
        }
        assert_eq!(idx, start, "walk of N steps did not return to the start");
        seen.len()
    }

    fn assert_min_stride(p: &AccessPattern, d: usize) {
        let n = p.len();
        for i in 0..n {
            let dist = storage_distance(i, p.successor(i), n);
            assert!(dist >= d, "node {} -> {} has distance {} < {}", i, p.successor(i), dist, d);
        }
    }

    #[test]
    fn default_stride_is_quarter_for_large_n() {
        assert_eq!(default_stride(10), 16);
        assert_eq!(default_stride(64), 16);
        assert_eq!(default_stride(4000), 1000);
    }

    #[test]
    fn node_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<Node>(), 64);
        assert_eq!(std::mem::align_of::<Node>(), 64);
    }

    #[test]
    fn thousand_nodes_default_stride() {
        let mut rng = StdRng::seed_from_u64(0xDEADBEEF);
        let p = AccessPattern::generate(1000, None, &mut rng).unwrap();
        assert_eq!(p.bytes(), 64_000);
        assert_eq!(p.min_stride(), 250);
        assert_eq!(cycle_len(&p), 1000);
        assert_min_stride(&p, 250);
    }

    #[test]
    fn zero_nodes_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(AccessPattern::generate(0, None, &mut rng).is_err());
        assert!(AccessPattern::sequential(0).is_err());
    }

    #[test]
    fn tiny_patterns_clamp_stride_and_stay_cyclic() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..64 {
            let p = AccessPattern::generate(n, Some(1000), &mut rng).unwrap();
            assert_eq!(cycle_len(&p), n);
            assert!(p.min_stride() < 1000);
            assert_min_stride(&p, p.min_stride());
        }
    }

    #[test]
    fn sequential_chain_steps_by_one() {
        let p = AccessPattern::sequential(100).unwrap();
        assert_eq!(cycle_len(&p), 100);
        assert_eq!(p.successor(41), 42);
        assert_eq!(p.successor(99), 0);
    }

    #[test]
    fn seeded_patterns_are_reproducible() {
        let a = AccessPattern::generate(2048, None, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = AccessPattern::generate(2048, None, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.order(), b.order());
    }

    #[test]
    fn pattern_is_not_a_constant_stride() {
        let mut rng = StdRng::seed_from_u64(11);
        let p = AccessPattern::generate(4096, Some(16), &mut rng).unwrap();
        let hops: HashSet<usize> = (0..p.len())
            .map(|i| (p.successor(i) + p.len() - i) % p.len())
            .collect();
        assert!(hops.len() > 100, "only {} distinct hops", hops.len());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn single_cycle_with_min_stride(n in 1000usize..6000, frac in 0.0f64..1.0, seed: u64) {
            let d = 1 + ((n / 2 - 3) as f64 * frac) as usize;
            let mut rng = StdRng::seed_from_u64(seed);
            let p = AccessPattern::generate(n, Some(d), &mut rng).unwrap();
            prop_assert_eq!(p.min_stride(), d);
            prop_assert_eq!(cycle_len(&p), n);
            assert_min_stride(&p, d);
        }
    }
}
