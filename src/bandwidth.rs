//! Sequential bandwidth over flat word buffers.
use crate::config::Config;
use crate::error::{Result, try_alloc};
use crate::sample::Sample;
use log::debug;
use std::hint::black_box;
use std::time::Instant;

const WORD: usize = std::mem::size_of::<u64>();

/// Contiguous 8-byte words, independent of the node arenas
pub struct FlatBuffer {
    words: Vec<u64>,
}

impl FlatBuffer {
    /// Buffer of `elements` words holding `0, 1, 2, ...`
    pub fn new(elements: usize) -> Result<Self> {
        let mut words = try_alloc(elements, 0u64, "flat buffer")?;
        for (i, w) in words.iter_mut().enumerate() {
            *w = i as u64;
        }
        Ok(FlatBuffer { words })
    }

    /// Buffer covering `bytes`, at least one word
    pub fn with_bytes(bytes: usize) -> Result<Self> {
        Self::new((bytes / WORD).max(1))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.words.len() * WORD
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.words
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    pub read: Sample,
    pub write: Sample,
    pub copy: Sample,
}

#[derive(Debug, Clone, Copy)]
pub struct BandwidthSampler {
    /// Bytes each measurement should move in total
    pub target_bytes: usize,
    pub min_passes: usize,
    pub peak_gbs: f64,
}

impl BandwidthSampler {
    pub fn new(config: &Config) -> Self {
        BandwidthSampler {
            target_bytes: config.bandwidth_target_bytes,
            min_passes: config.bandwidth_min_passes.max(1),
            peak_gbs: config.max_plausible_bandwidth_gbs,
        }
    }

    /// Passes over a `bytes` sized buffer so every buffer size moves about `target_bytes`
    pub fn passes_for(&self, bytes: usize) -> usize {
        (self.target_bytes / bytes.max(1)).max(self.min_passes)
    }

    /// Sum every word, repeatedly
    pub fn read(&self, buf: &FlatBuffer) -> Sample {
        let passes = self.passes_for(buf.bytes());
        let words = buf.as_slice();

        // Warm up
        let mut sum = words.iter().fold(0u64, |acc, &w| acc.wrapping_add(w));

        let start = Instant::now();
        for _ in 0..passes {
            sum = black_box(words).iter().fold(sum, |acc, &w| acc.wrapping_add(w));
        }
        let elapsed = start.elapsed();
        black_box(sum);

        Sample::bandwidth(elapsed, (buf.bytes() * passes) as u64, self.peak_gbs)
    }

    /// Overwrite every word with a pass-dependent value, repeatedly
    pub fn write(&self, buf: &mut FlatBuffer) -> Sample {
        let passes = self.passes_for(buf.bytes());
        let bytes = buf.bytes();

        let start = Instant::now();
        for pass in 0..passes {
            let stamp = pass as u64;
            for (i, w) in buf.words.iter_mut().enumerate() {
                *w = (i as u64).wrapping_add(stamp);
            }
            // Each pass must land; otherwise only the last one would be kept
            black_box(buf.words.as_mut_slice());
        }
        let elapsed = start.elapsed();

        Sample::bandwidth(elapsed, (bytes * passes) as u64, self.peak_gbs)
    }

    /// Copy the whole buffer into `scratch`, repeatedly. Counts the bytes of one side.
    pub fn copy(&self, buf: &FlatBuffer, scratch: &mut FlatBuffer) -> Sample {
        let passes = self.passes_for(buf.bytes());
        let n = buf.len().min(scratch.len());

        let start = Instant::now();
        for _ in 0..passes {
            scratch.words[..n].copy_from_slice(black_box(&buf.words[..n]));
            black_box(scratch.words.as_mut_slice());
        }
        let elapsed = start.elapsed();

        Sample::bandwidth(elapsed, (n * WORD * passes) as u64, self.peak_gbs)
    }

    /// Read, write and copy bandwidth for a fresh buffer of `bytes`
    pub fn measure(&self, bytes: usize) -> Result<Bandwidth> {
        let mut buf = FlatBuffer::with_bytes(bytes)?;
        let mut scratch = FlatBuffer::with_bytes(bytes)?;
        let read = self.read(&buf);
        let write = self.write(&mut buf);
        let copy = self.copy(&buf, &mut scratch);
        debug!(
            "Bandwidth for {}: read {:.2} GB/s, write {:.2} GB/s, copy {:.2} GB/s",
            crate::format_size(buf.bytes()),
            read.value,
            write.value,
            copy.value
        );
        Ok(Bandwidth { read, write, copy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> BandwidthSampler {
        BandwidthSampler {
            target_bytes: 64 << 20,
            min_passes: 10,
            peak_gbs: 5000.0,
        }
    }

    #[test]
    fn passes_scale_inversely_with_size() {
        let s = sampler();
        assert_eq!(s.passes_for(4096), (64 << 20) / 4096);
        assert_eq!(s.passes_for(1 << 20), 64);
        assert_eq!(s.passes_for(1 << 30), 10);
    }

    #[test]
    fn buffers_round_down_to_words() {
        let b = FlatBuffer::with_bytes(4100).unwrap();
        assert_eq!(b.len(), 512);
        assert_eq!(b.bytes(), 4096);
        assert_eq!(b.as_slice()[511], 511);
        assert_eq!(FlatBuffer::with_bytes(3).unwrap().len(), 1);
    }

    #[test]
    fn write_then_copy_moves_data() {
        let s = sampler();
        let mut buf = FlatBuffer::with_bytes(64 << 10).unwrap();
        let mut scratch = FlatBuffer::with_bytes(64 << 10).unwrap();
        s.write(&mut buf);
        s.copy(&buf, &mut scratch);
        assert_eq!(buf.as_slice(), scratch.as_slice());
        let last = (s.passes_for(buf.bytes()) - 1) as u64;
        assert_eq!(scratch.as_slice()[5], 5 + last);
    }

    #[test]
    fn copy_bandwidth_tracks_read_bandwidth() {
        let s = sampler();
        let (mut read, mut copy) = (0.0f64, 0.0f64);
        for _ in 0..3 {
            let bw = s.measure(4 << 20).unwrap();
            read = read.max(bw.read.value);
            copy = copy.max(bw.copy.value);
        }
        let ratio = copy / read;
        // Wide band so unoptimized builds pass too
        assert!((0.2..=1.5).contains(&ratio), "copy {} GB/s, read {} GB/s", copy, read);
    }

    #[test]
    fn measured_bandwidth_is_finite_and_below_peak() {
        let bw = sampler().measure(256 << 10).unwrap();
        for sample in [bw.read, bw.write, bw.copy] {
            assert!(sample.value.is_finite());
            assert!(sample.value > 0.0);
            assert!(sample.value < 5000.0);
        }
    }
}
