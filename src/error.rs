//! Error and anomaly types shared by every measurement routine.
use std::collections::TryReserveError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures that stop a measurement routine
#[derive(Debug, Error)]
pub enum Error {
    /// Requested size is too small to produce a meaningful test
    #[error("{what}: requested {requested} is below the minimum of {minimum}")]
    Configuration {
        what: &'static str,
        requested: usize,
        minimum: usize,
    },

    /// Allocation of a test buffer failed; fatal for the routine that asked for it
    #[error("could not allocate {bytes} bytes for {what}")]
    ResourceExhaustion {
        what: &'static str,
        bytes: usize,
        #[source]
        source: TryReserveError,
    },

    /// OS refused to create a worker thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Worker thread unwound before reporting a result
    #[error("worker thread {0} panicked before reporting")]
    WorkerPanicked(usize),
}

/// Physically implausible measurement. Attached to a sample instead of failing the run, since
/// it usually means the measured loop was optimized away or the clock did not advance.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum Anomaly {
    #[error("measurement took zero time")]
    ZeroDuration,
    #[error("derived value is not finite")]
    NonFinite,
    #[error("{ns:.3} ns/access is faster than any real memory access")]
    ImplausiblyFast { ns: f64 },
    #[error("{gbs:.1} GB/s exceeds the plausible peak for this host class")]
    ExceedsPeak { gbs: f64 },
}

/// Allocate a vector of `len` elements, mapping allocation failure to [`Error::ResourceExhaustion`]
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T, what: &'static str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|source| Error::ResourceExhaustion {
            what,
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
            source,
        })?;
    v.resize(len, value);
    Ok(v)
}
