//! Memory latency, bandwidth and cache topology measurement.
//!
//! The pieces stack leaf first: [`pattern`] builds pointer-chase cycles, [`latency`] and
//! [`bandwidth`] time them, [`cache`] sweeps sizes to find cache boundaries and [`scaling`]
//! runs the chase on several threads at once. Results are plain numbers handed to a
//! [`report::ReportSink`].
pub mod access;
pub mod bandwidth;
pub mod cache;
pub mod config;
pub mod error;
pub mod latency;
pub mod pattern;
pub mod report;
pub mod sample;
pub mod scaling;

pub use config::Config;
pub use error::{Anomaly, Error, Result};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;
pub const GIB: usize = 1024 * 1024 * 1024;

/// Convert number of bytes to formatted string
pub fn format_size(bytes: usize) -> String {
    let b = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", b / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", b / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", b / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Convert number of bytes to formatted string for fixed-width integer string
pub fn format_size_fixed_int(bytes: usize) -> String {
    if bytes >= GIB {
        format!("{:>4} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:>4} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:>4} KiB", bytes / KIB)
    } else {
        format!("{:>4} B", bytes)
    }
}
