use crate::error::Anomaly;
use log::warn;
use std::time::Duration;

/// One timed measurement and the figure derived from it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// ns/access for latency samples, GB/s for bandwidth samples
    pub value: f64,
    pub elapsed: Duration,
    /// Accesses (latency) or bytes (bandwidth) covered by `elapsed`
    pub count: u64,
    /// Set when the value is physically implausible and should not be trusted
    pub anomaly: Option<Anomaly>,
}

impl Sample {
    /// Nanoseconds per access over `accesses` dependent loads
    pub fn latency(elapsed: Duration, accesses: u64, floor_ns: f64) -> Self {
        let value = elapsed.as_nanos() as f64 / accesses.max(1) as f64;
        let anomaly = if elapsed.is_zero() {
            Some(Anomaly::ZeroDuration)
        } else if !value.is_finite() {
            Some(Anomaly::NonFinite)
        } else if value < floor_ns {
            Some(Anomaly::ImplausiblyFast { ns: value })
        } else {
            None
        };
        Sample {
            value,
            elapsed,
            count: accesses,
            anomaly,
        }
        .logged("latency")
    }

    /// GB/s for `bytes` moved in `elapsed`
    pub fn bandwidth(elapsed: Duration, bytes: u64, peak_gbs: f64) -> Self {
        let value = bytes as f64 / elapsed.as_secs_f64() / 1e9;
        let anomaly = if elapsed.is_zero() {
            Some(Anomaly::ZeroDuration)
        } else if !value.is_finite() {
            Some(Anomaly::NonFinite)
        } else if value > peak_gbs {
            Some(Anomaly::ExceedsPeak { gbs: value })
        } else {
            None
        };
        Sample {
            value,
            elapsed,
            count: bytes,
            anomaly,
        }
        .logged("bandwidth")
    }

    pub fn is_suspect(&self) -> bool {
        self.anomaly.is_some()
    }

    fn logged(self, kind: &str) -> Self {
        if let Some(anomaly) = self.anomaly {
            warn!(
                "Suspect {} sample ({} over {:?}): {}",
                kind, self.count, self.elapsed, anomaly
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_is_ns_per_access() {
        let s = Sample::latency(Duration::from_millis(10), 1_000_000, 0.3);
        assert!((s.value - 10.0).abs() < 1e-9);
        assert!(!s.is_suspect());
    }

    #[test]
    fn sub_floor_latency_is_flagged() {
        let s = Sample::latency(Duration::from_nanos(100), 1_000_000, 0.3);
        assert!(matches!(s.anomaly, Some(Anomaly::ImplausiblyFast { .. })));
    }

    #[test]
    fn zero_duration_bandwidth_is_flagged() {
        let s = Sample::bandwidth(Duration::ZERO, 4096, 5000.0);
        assert_eq!(s.anomaly, Some(Anomaly::ZeroDuration));
        assert!(s.value.is_infinite());
    }

    #[test]
    fn bandwidth_is_gigabytes_per_second() {
        let s = Sample::bandwidth(Duration::from_secs(2), 20_000_000_000, 5000.0);
        assert!((s.value - 10.0).abs() < 1e-9);
        assert!(!s.is_suspect());

        let s = Sample::bandwidth(Duration::from_nanos(1), 1 << 30, 5000.0);
        assert!(matches!(s.anomaly, Some(Anomaly::ExceedsPeak { .. })));
    }
}
