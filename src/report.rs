//! Result sinks. The measurement code only produces numbers; sinks decide how to show them.
use std::io::{self, Write};

/// A titled, labelled series of values in one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub title: String,
    values: Vec<f64>,
    labels: Vec<String>,
    pub unit: String,
}

impl Series {
    /// `None` unless `values` and `labels` have the same length
    pub fn new(
        title: impl Into<String>,
        values: Vec<f64>,
        labels: Vec<String>,
        unit: impl Into<String>,
    ) -> Option<Self> {
        if values.len() != labels.len() {
            return None;
        }
        Some(Series {
            title: title.into(),
            values,
            labels,
            unit: unit.into(),
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub trait ReportSink {
    fn report(&mut self, series: &Series) -> io::Result<()>;
}

/// Horizontal ASCII bar chart, bars scaled to the largest value
pub struct BarChart<W: Write> {
    out: W,
    width: usize,
}

impl<W: Write> BarChart<W> {
    pub fn new(out: W, width: usize) -> Self {
        BarChart {
            out,
            width: width.max(1),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for BarChart<W> {
    fn report(&mut self, series: &Series) -> io::Result<()> {
        writeln!(self.out, "\n==== {} ====", series.title)?;

        let max = series
            .values()
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max);
        let label_width = series.labels().iter().map(|l| l.len()).max().unwrap_or(0);

        for (label, &value) in series.labels().iter().zip(series.values()) {
            let bar = if max > 0.0 && value.is_finite() {
                ((value / max) * self.width as f64) as usize
            } else {
                0
            };
            writeln!(
                self.out,
                "{:<label_width$} | {} {:.2} {}",
                label,
                "█".repeat(bar.max(1)),
                value,
                series.unit
            )?;
        }
        writeln!(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(Series::new("t", vec![1.0, 2.0], vec!["a".into()], "ns").is_none());
        assert!(Series::new("t", vec![], vec![], "ns").unwrap().is_empty());
    }

    #[test]
    fn bars_scale_to_the_maximum() {
        let series = Series::new(
            "Latency",
            vec![10.0, 5.0, 0.0],
            vec!["big".into(), "half".into(), "z".into()],
            "ns",
        )
        .unwrap();
        let mut chart = BarChart::new(Vec::new(), 10);
        chart.report(&series).unwrap();
        let text = String::from_utf8(chart.into_inner()).unwrap();

        assert!(text.contains("==== Latency ===="));
        assert!(text.contains(&format!("big  | {} 10.00 ns", "█".repeat(10))));
        assert!(text.contains(&format!("half | {} 5.00 ns", "█".repeat(5))));
        // Zero still gets a one-character bar
        assert!(text.contains(&format!("z    | {} 0.00 ns", "█")));
    }
}
