//! # Result Rows and Reporting Collaborators
//!
//! One [`ResultRow`] per executed benchmark configuration, emitted in
//! strictly increasing test-index order to a [`ResultSink`]. Two sinks ship
//! with the engine: a console reporter and a CSV file reporter whose header
//! and column order match the classic characterization layout, with one
//! average/peak power column pair per physical package.

use crate::config::{ChunkWidth, Operation, Pattern};
use crate::matrix::BenchmarkKind;
use crate::power::PowerSample;
use std::io::{self, Write};

/// Unit string for throughput metrics.
pub const THROUGHPUT_UNITS: &str = "MB/s";
/// Unit string for latency metrics.
pub const LATENCY_UNITS: &str = "ns/access";
/// Placeholder for fields with no applicable value.
pub const NOT_APPLICABLE: &str = "N/A";

/// A benchmark configuration joined with its measured metrics.
///
/// `None` fields render as [`NOT_APPLICABLE`]: pattern/operation/chunk/stride
/// on single-thread latency rows and random-pattern strides, metrics that a
/// row kind does not measure, and power figures from unavailable readers.
#[derive(Debug, Clone)]
pub struct ResultRow {
    /// What the row measures.
    pub kind: BenchmarkKind,
    /// Display name, e.g. `Test #4T (Throughput)`.
    pub name: String,
    /// Display index.
    pub test_index: u32,
    /// Iterations executed.
    pub iterations: u32,
    /// Working-set size per thread in KB.
    pub working_set_per_thread_kb: u64,
    /// Total worker threads.
    pub total_threads: usize,
    /// Load-generating threads.
    pub load_threads: usize,
    /// NUMA node holding the working set.
    pub mem_node: usize,
    /// NUMA node supplying the worker CPUs.
    pub cpu_node: usize,
    /// Load access pattern, when applicable.
    pub pattern: Option<Pattern>,
    /// Load operation, when applicable.
    pub operation: Option<Operation>,
    /// Load chunk width, when applicable.
    pub chunk: Option<ChunkWidth>,
    /// Load stride in chunks, when applicable.
    pub stride: Option<i64>,
    /// Average load throughput in MB/s: the aggregate for throughput rows,
    /// the injected-load figure for latency rows.
    pub throughput_mbs: Option<f64>,
    /// Average latency in ns/access; latency rows only.
    pub latency_ns: Option<f64>,
    /// One sample per physical package, in package order.
    pub power: Vec<PowerSample>,
    /// Some worker flagged its measurement as suspect.
    pub warning: bool,
}

fn pattern_label(pattern: Option<Pattern>) -> &'static str {
    match pattern {
        Some(Pattern::Sequential) => "SEQUENTIAL",
        Some(Pattern::Random) => "RANDOM",
        None => NOT_APPLICABLE,
    }
}

fn operation_label(operation: Option<Operation>) -> &'static str {
    match operation {
        Some(Operation::Read) => "READ",
        Some(Operation::Write) => "WRITE",
        None => NOT_APPLICABLE,
    }
}

fn chunk_label(chunk: Option<ChunkWidth>) -> String {
    chunk.map_or_else(|| NOT_APPLICABLE.to_string(), |c| c.bits().to_string())
}

fn stride_label(stride: Option<i64>) -> String {
    stride.map_or_else(|| NOT_APPLICABLE.to_string(), |s| s.to_string())
}

fn metric_label(metric: Option<f64>) -> String {
    metric.map_or_else(|| NOT_APPLICABLE.to_string(), |m| format!("{m:.3}"))
}

fn watts_label(watts: Option<f64>) -> String {
    watts.map_or_else(|| NOT_APPLICABLE.to_string(), |w| format!("{w:.3}"))
}

/// The reporting collaborator the engine emits rows to.
pub trait ResultSink {
    /// Called once before any row, with the per-package power reader names in
    /// package order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the sink cannot be prepared.
    fn begin(&mut self, power_reader_names: &[String]) -> io::Result<()>;

    /// Accepts one result row.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the row cannot be recorded.
    fn emit(&mut self, row: &ResultRow) -> io::Result<()>;
}

/// Console reporter: one structured log line per row.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    /// Creates the console reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ResultSink for ConsoleReporter {
    fn begin(&mut self, _power_reader_names: &[String]) -> io::Result<()> {
        Ok(())
    }

    fn emit(&mut self, row: &ResultRow) -> io::Result<()> {
        let metric = match row.kind {
            BenchmarkKind::Throughput => format!(
                "{} {THROUGHPUT_UNITS}",
                metric_label(row.throughput_mbs)
            ),
            BenchmarkKind::Latency => format!(
                "{} {LATENCY_UNITS} at {} {THROUGHPUT_UNITS} load",
                metric_label(row.latency_ns),
                metric_label(row.throughput_mbs)
            ),
        };
        let suffix = if row.warning {
            " (WARNING: results may be suspect)"
        } else {
            ""
        };
        tracing::info!(
            "{}: mem node {}, cpu node {}, {} [{}/{} chunk, stride {}], {} thread(s): {}{}",
            row.name,
            row.mem_node,
            row.cpu_node,
            pattern_label(row.pattern),
            operation_label(row.operation),
            chunk_label(row.chunk),
            stride_label(row.stride),
            row.total_threads,
            metric,
            suffix
        );
        for sample in &row.power {
            if sample.is_available() {
                tracing::info!(
                    "  package {}: avg {} W, peak {} W",
                    sample.package,
                    watts_label(sample.average_watts),
                    watts_label(sample.peak_watts)
                );
            }
        }
        Ok(())
    }
}

/// CSV file reporter with the classic column layout.
#[derive(Debug)]
pub struct CsvReporter<W: Write> {
    writer: W,
}

impl CsvReporter<io::BufWriter<std::fs::File>> {
    /// Creates the reporter over a new file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be created.
    pub fn create(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: io::BufWriter::new(file),
        })
    }
}

impl<W: Write> CsvReporter<W> {
    /// Creates the reporter over an arbitrary writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Unwraps the underlying writer, flushing first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the flush fails.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> ResultSink for CsvReporter<W> {
    fn begin(&mut self, power_reader_names: &[String]) -> io::Result<()> {
        write!(
            self.writer,
            "Test Name,Iterations,Working Set Size Per Thread (KB),Total Number of Threads,\
             Number of Load Generating Threads,NUMA Memory Node,NUMA CPU Node,\
             Load Access Pattern,Load Read/Write Mix,Load Chunk Size (bits),\
             Load Stride Size (chunks),Average Load Throughput,Throughput Units,\
             Average Latency,Latency Units"
        )?;
        for name in power_reader_names {
            write!(
                self.writer,
                ",{name} Average Power (W),{name} Peak Power (W)"
            )?;
        }
        writeln!(self.writer)
    }

    fn emit(&mut self, row: &ResultRow) -> io::Result<()> {
        let (throughput, latency) = match row.kind {
            BenchmarkKind::Throughput => (
                metric_label(row.throughput_mbs),
                NOT_APPLICABLE.to_string(),
            ),
            BenchmarkKind::Latency => (
                metric_label(row.throughput_mbs),
                metric_label(row.latency_ns),
            ),
        };
        let latency_units = match row.kind {
            BenchmarkKind::Throughput => NOT_APPLICABLE,
            BenchmarkKind::Latency => LATENCY_UNITS,
        };

        write!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            row.name,
            row.iterations,
            row.working_set_per_thread_kb,
            row.total_threads,
            row.load_threads,
            row.mem_node,
            row.cpu_node,
            pattern_label(row.pattern),
            operation_label(row.operation),
            chunk_label(row.chunk),
            stride_label(row.stride),
            throughput,
            THROUGHPUT_UNITS,
            latency,
            latency_units
        )?;
        for sample in &row.power {
            write!(
                self.writer,
                ",{},{}",
                watts_label(sample.average_watts),
                watts_label(sample.peak_watts)
            )?;
        }
        writeln!(self.writer)?;
        self.writer.flush()
    }
}

/// Fans rows out to several sinks, e.g. console plus CSV.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl std::fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl MultiSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink to the fan-out.
    #[must_use]
    pub fn with(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ResultSink for MultiSink {
    fn begin(&mut self, power_reader_names: &[String]) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.begin(power_reader_names)?;
        }
        Ok(())
    }

    fn emit(&mut self, row: &ResultRow) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.emit(row)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throughput_row() -> ResultRow {
        ResultRow {
            kind: BenchmarkKind::Throughput,
            name: "Test #1T (Throughput)".to_string(),
            test_index: 1,
            iterations: 1,
            working_set_per_thread_kb: 4096,
            total_threads: 2,
            load_threads: 2,
            mem_node: 0,
            cpu_node: 0,
            pattern: Some(Pattern::Sequential),
            operation: Some(Operation::Read),
            chunk: Some(ChunkWidth::Bits64),
            stride: Some(1),
            throughput_mbs: Some(12345.678),
            latency_ns: None,
            power: vec![PowerSample {
                package: 0,
                average_watts: Some(3.25),
                peak_watts: Some(4.5),
            }],
            warning: false,
        }
    }

    fn unloaded_latency_row() -> ResultRow {
        ResultRow {
            kind: BenchmarkKind::Latency,
            name: "Test #1L (Latency)".to_string(),
            test_index: 1,
            iterations: 1,
            working_set_per_thread_kb: 4096,
            total_threads: 1,
            load_threads: 0,
            mem_node: 0,
            cpu_node: 0,
            pattern: None,
            operation: None,
            chunk: None,
            stride: None,
            throughput_mbs: None,
            latency_ns: Some(87.5),
            power: vec![PowerSample::unavailable(0)],
            warning: false,
        }
    }

    fn csv_output(rows: &[ResultRow]) -> String {
        let mut reporter = CsvReporter::new(Vec::new());
        reporter
            .begin(&["Socket 0 DRAM".to_string()])
            .unwrap();
        for row in rows {
            reporter.emit(row).unwrap();
        }
        String::from_utf8(reporter.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn csv_header_lists_power_columns_per_package() {
        let output = csv_output(&[]);
        let header = output.lines().next().unwrap();
        assert!(header.starts_with("Test Name,Iterations,"));
        assert!(header.contains("Load Stride Size (chunks)"));
        assert!(header.ends_with(
            "Socket 0 DRAM Average Power (W),Socket 0 DRAM Peak Power (W)"
        ));
    }

    #[test]
    fn throughput_row_renders_in_field_order() {
        let output = csv_output(&[throughput_row()]);
        let row = output.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "Test #1T (Throughput),1,4096,2,2,0,0,SEQUENTIAL,READ,64,1,\
             12345.678,MB/s,N/A,N/A,3.250,4.500"
        );
    }

    #[test]
    fn unloaded_latency_row_uses_placeholders() {
        let output = csv_output(&[unloaded_latency_row()]);
        let row = output.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "Test #1L (Latency),1,4096,1,0,0,0,N/A,N/A,N/A,N/A,\
             N/A,MB/s,87.500,ns/access,N/A,N/A"
        );
    }

    #[test]
    fn unavailable_power_renders_placeholder() {
        let mut row = throughput_row();
        row.power = vec![PowerSample::unavailable(0)];
        let output = csv_output(&[row]);
        assert!(output.lines().nth(1).unwrap().ends_with("N/A,N/A"));
    }

    #[test]
    fn console_reporter_accepts_rows() {
        let mut reporter = ConsoleReporter::new();
        reporter.begin(&[]).unwrap();
        reporter.emit(&throughput_row()).unwrap();
        reporter.emit(&unloaded_latency_row()).unwrap();
    }

    #[test]
    fn multi_sink_fans_out() {
        let mut sink = MultiSink::new().with(Box::new(ConsoleReporter::new()));
        sink.begin(&[]).unwrap();
        sink.emit(&throughput_row()).unwrap();
    }
}
