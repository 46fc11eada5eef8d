//! Text rendering, in the layout of `go test -bench` output.

use std::io::{self, Write};

use crate::runner::{CaseReport, RunSummary};
use crate::schema::{CaseStatus, Measurement};

/// Column width for case names: the longest name, at least 20.
pub fn name_width<'a>(names: impl IntoIterator<Item = &'a str>) -> usize {
    names
        .into_iter()
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
        .max(20)
}

/// Formats ns/op with a precision that keeps about four significant digits.
fn pretty_ns(x: f64) -> String {
    let y = x.abs();
    if y == 0.0 || y >= 999.95 {
        format!("{x:10.0}")
    } else if y >= 99.995 {
        format!("{x:12.1}")
    } else if y >= 9.9995 {
        format!("{x:13.2}")
    } else if y >= 0.99995 {
        format!("{x:14.3}")
    } else if y >= 0.099995 {
        format!("{x:15.4}")
    } else if y >= 0.0099995 {
        format!("{x:16.5}")
    } else {
        format!("{x:17.6}")
    }
}

/// One line for a reported measurement.
pub fn format_measurement(m: &Measurement, width: usize) -> String {
    let mut line = format!(
        "{:<width$}\t{:>10}\t{} ns/op",
        m.name,
        m.iters,
        pretty_ns(m.ns_per_iter)
    );
    if let Some(bps) = m.throughput_bytes_per_s {
        line.push_str(&format!("\t{:8.2} MB/s", bps / 1e6));
    }
    if let (Some(bytes), Some(allocs)) = (m.bytes_per_op, m.allocs_per_op) {
        line.push_str(&format!("\t{bytes:8} B/op\t{allocs:8} allocs/op"));
    }
    line
}

/// Streams case results as text.
pub struct TextReporter<W> {
    out: W,
    width: usize,
}

impl<W: Write> TextReporter<W> {
    pub fn new(out: W, width: usize) -> Self {
        Self { out, width }
    }

    pub fn case(&mut self, report: &CaseReport) -> io::Result<()> {
        let m = report.to_measurement();
        match m.status {
            CaseStatus::Reported => writeln!(self.out, "{}", format_measurement(&m, self.width))?,
            CaseStatus::Failed => self.block("FAIL", &m)?,
            CaseStatus::Skipped => self.block("SKIP", &m)?,
        }
        self.out.flush()
    }

    fn block(&mut self, label: &str, m: &Measurement) -> io::Result<()> {
        writeln!(self.out, "--- {label}: {}", m.name)?;
        if let Some(msg) = &m.message {
            for line in msg.lines() {
                writeln!(self.out, "    {line}")?;
            }
        }
        Ok(())
    }

    pub fn trailer(&mut self, summary: &RunSummary) -> io::Result<()> {
        let verdict = if summary.success() { "PASS" } else { "FAIL" };
        writeln!(self.out, "{verdict}")?;
        writeln!(
            self.out,
            "{} reported, {} failed, {} skipped in {:.3}s",
            summary.reported(),
            summary.failed(),
            summary.skipped(),
            summary.wall.as_secs_f64()
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
