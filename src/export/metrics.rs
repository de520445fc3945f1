use std::path::Path;

use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::record::RecordKind;
use crate::tree::{DataQuality, QualityReport};

/// Prometheus metrics for one pipeline run.
///
/// All metrics use the "npuprof" namespace. The run is a batch job, so the
/// registry is written once as a text exposition file instead of served.
pub struct PipelineMetrics {
    registry: Registry,

    /// Records decoded by record kind.
    pub records_read: CounterVec,
    /// Malformed records dropped by record kind.
    pub records_dropped: CounterVec,
    /// Partitions (devices, streams, threads) that failed, by domain and reason.
    pub partitions_failed: CounterVec,
    /// Data-quality warnings by kind.
    pub data_quality: CounterVec,
    /// Rows inserted into the record store by table.
    pub rows_stored: CounterVec,
    /// Trace events written.
    pub trace_events: Counter,
    /// Duration of each pipeline phase.
    pub phase_duration: HistogramVec,
    /// Duration of a single partition unit of work.
    pub partition_duration: Histogram,
}

impl PipelineMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let records_read = CounterVec::new(
            Opts::new("records_read_total", "Records decoded by record kind.")
                .namespace("npuprof"),
            &["kind"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Malformed records dropped by record kind.",
            )
            .namespace("npuprof"),
            &["kind"],
        )?;
        let partitions_failed = CounterVec::new(
            Opts::new(
                "partitions_failed_total",
                "Partitions that failed by domain and reason.",
            )
            .namespace("npuprof"),
            &["domain", "reason"],
        )?;
        let data_quality = CounterVec::new(
            Opts::new(
                "data_quality_warnings_total",
                "Data-quality warnings by kind.",
            )
            .namespace("npuprof"),
            &["kind"],
        )?;
        let rows_stored = CounterVec::new(
            Opts::new("rows_stored_total", "Rows inserted into the record store.")
                .namespace("npuprof"),
            &["table"],
        )?;
        let trace_events = Counter::with_opts(
            Opts::new("trace_events_total", "Trace events written.").namespace("npuprof"),
        )?;
        let phase_duration = HistogramVec::new(
            HistogramOpts::new("phase_duration_seconds", "Duration of each pipeline phase.")
                .namespace("npuprof")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["phase"],
        )?;
        let partition_duration = Histogram::with_opts(
            HistogramOpts::new(
                "partition_duration_seconds",
                "Duration of a single partition unit of work.",
            )
            .namespace("npuprof")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        registry.register(Box::new(records_read.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(partitions_failed.clone()))?;
        registry.register(Box::new(data_quality.clone()))?;
        registry.register(Box::new(rows_stored.clone()))?;
        registry.register(Box::new(trace_events.clone()))?;
        registry.register(Box::new(phase_duration.clone()))?;
        registry.register(Box::new(partition_duration.clone()))?;

        Ok(Self {
            registry,
            records_read,
            records_dropped,
            partitions_failed,
            data_quality,
            rows_stored,
            trace_events,
            phase_duration,
            partition_duration,
        })
    }

    pub fn observe_records(&self, kind: RecordKind, read: usize, dropped: usize) {
        self.records_read
            .with_label_values(&[kind.as_str()])
            .inc_by(read as f64);
        if dropped > 0 {
            self.records_dropped
                .with_label_values(&[kind.as_str()])
                .inc_by(dropped as f64);
        }
    }

    pub fn observe_quality(&self, report: &QualityReport) {
        for kind in DataQuality::all() {
            let n = report.count(*kind);
            if n > 0 {
                self.data_quality
                    .with_label_values(&[kind.as_str()])
                    .inc_by(n as f64);
            }
        }
    }

    pub fn partition_failed(&self, domain: &str, reason: &str) {
        self.partitions_failed
            .with_label_values(&[domain, reason])
            .inc();
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Writes the exposition text to `path`, replacing it atomically.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.render()?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("writing metrics to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("moving metrics file to {}", path.display()))?;

        tracing::info!(path = %path.display(), "metrics textfile written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let metrics = PipelineMetrics::new().expect("metrics");
        metrics.observe_records(RecordKind::TaskTrack, 10, 2);
        metrics.partition_failed("task", "calibration_missing");
        metrics.trace_events.inc_by(5.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("npuprof_records_read_total{kind=\"task_track\"} 10"));
        assert!(text.contains("npuprof_records_dropped_total{kind=\"task_track\"} 2"));
        assert!(text.contains(
            "npuprof_partitions_failed_total{domain=\"task\",reason=\"calibration_missing\"} 1"
        ));
        assert!(text.contains("npuprof_trace_events_total 5"));
    }

    #[test]
    fn test_observe_quality() {
        let metrics = PipelineMetrics::new().expect("metrics");
        let mut report = QualityReport::default();
        report.record(DataQuality::ContainmentClipped);
        metrics.observe_quality(&report);

        let text = metrics.render().expect("render");
        assert!(text.contains(
            "npuprof_data_quality_warnings_total{kind=\"containment_clipped\"} 1"
        ));
        assert!(!text.contains("kind=\"unknown_end\""));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("npuprof.prom");
        let metrics = PipelineMetrics::new().expect("metrics");
        metrics.trace_events.inc();
        metrics.write_textfile(&path).expect("write");

        let text = std::fs::read_to_string(&path).expect("read back");
        assert!(text.contains("npuprof_trace_events_total 1"));
    }
}
