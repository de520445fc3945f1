//! Run orchestration: process every enabled domain, build and analyse the host
//! call trees, store rows, assemble and write the trace.
//!
//! Every domain and every partition inside it is attempted regardless of
//! earlier failures. The [`RunSummary`] ANDs the per-domain outcomes.

pub mod pool;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::assemble::{
    link_host_tasks, AssembleError, Assembled, CounterSeriesAssembler, DeviceTaskAssembler,
    HostTraceAssembler, TraceEvent,
};
use crate::config::Config;
use crate::context::PipelineContext;
use crate::export::{JsonTraceWriter, RecordStore, Row, Table, TraceWriter, Value};
use crate::process::{
    DataInventory, DeviceTask, DomainReport, HostEvents, HostProcessor, PartitionError,
    PcieProcessor, PcieSample, ProcessEnv, TaskProcessor, ThreadEvents,
};
use crate::record::stats::KindTotals;
use crate::record::RecordKind;
use crate::source::FileStore;
use crate::tree::{
    analyze_tree, build_tree, connection_bases, AnalyzedNode, AnalyzedTree, DataQuality,
    EventTree, NodeKind, QualityReport,
};

use self::pool::WorkerPool;

/// Settings of one run, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pcie: bool,
    pub task: bool,
    pub host: bool,
    /// Trace file to write, `None` to skip trace output.
    pub trace_path: Option<PathBuf>,
    pub metrics_textfile: Option<PathBuf>,
    pub max_depth_warning: Option<u32>,
}

impl RunOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pcie: cfg.domains.pcie,
            task: cfg.domains.task,
            host: cfg.domains.host,
            trace_path: cfg.trace.enabled.then(|| cfg.trace_path()),
            metrics_textfile: cfg.metrics.textfile.clone(),
            max_depth_warning: cfg.tree.max_depth_warning,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One report per enabled domain, in processing order.
    pub domains: Vec<DomainReport>,
    pub events_written: usize,
    pub quality: QualityReport,
    pub records: Vec<(RecordKind, KindTotals)>,
}

impl RunSummary {
    /// True when every partition of every enabled domain succeeded.
    pub fn success(&self) -> bool {
        self.domains.iter().fold(true, |ok, d| ok & d.success())
    }

    pub fn domain(&self, name: &str) -> Option<&DomainReport> {
        self.domains.iter().find(|d| d.domain == name)
    }

    /// Logs the summary at INFO, or WARN when some partition failed.
    pub fn log(&self) {
        for d in &self.domains {
            tracing::info!(
                domain = d.domain,
                partitions = d.partitions,
                records = d.records,
                rows_stored = d.rows_stored,
                events_written = d.events_written,
                failed = d.failures.len(),
                "domain summary",
            );
        }
        let dropped: u64 = self.records.iter().map(|(_, t)| t.dropped).sum();
        if self.success() {
            tracing::info!(
                events_written = self.events_written,
                records_dropped = dropped,
                data_quality_warnings = self.quality.total(),
                "run complete",
            );
        } else {
            let failed: usize = self.domains.iter().map(|d| d.failures.len()).sum();
            tracing::warn!(
                events_written = self.events_written,
                records_dropped = dropped,
                data_quality_warnings = self.quality.total(),
                failed_partitions = failed,
                "run complete with partial failures",
            );
        }
    }
}

/// One post-processing run over a profiling directory.
pub struct Pipeline<F> {
    env: ProcessEnv<F>,
    options: RunOptions,
}

impl<F: FileStore + 'static> Pipeline<F> {
    pub fn new(
        ctx: PipelineContext,
        files: F,
        store: Arc<dyn RecordStore>,
        workers: usize,
        options: RunOptions,
    ) -> Self {
        let pool =
            WorkerPool::new(workers).with_unit_duration(ctx.metrics.partition_duration.clone());
        Self {
            env: ProcessEnv {
                ctx: Arc::new(ctx),
                files: Arc::new(files),
                store,
                pool: Arc::new(pool),
            },
            options,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.env.ctx
    }

    /// Runs every phase. Only failures to write the trace or metrics files are
    /// returned as errors; everything else is reported in the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        let env = &self.env;
        let mut inventory = DataInventory::new();

        let mut pcie = None;
        let mut task = None;
        let mut host = None;

        let started = self.phase_start("process");
        if self.options.pcie {
            pcie = Some(PcieProcessor::run(env, &mut inventory).await);
        }
        if self.options.task {
            task = Some(TaskProcessor::run(env, &mut inventory).await);
        }
        if self.options.host {
            host = Some(HostProcessor::run(env, &mut inventory).await);
        }
        self.phase_end("process", started);

        let mut trees = Vec::new();
        if let Some(report) = host.as_mut() {
            let events = inventory.take::<HostEvents>().unwrap_or_default();
            let started = self.phase_start("tree");
            trees = self.analyze_host(events, report).await;
            self.phase_end("tree", started);

            let started = self.phase_start("store");
            self.store_spans(&trees, report);
            self.phase_end("store", started);
        }

        let started = self.phase_start("assemble");
        let mut outputs: Vec<(&'static str, Vec<TraceEvent>)> = Vec::new();
        if let Some(report) = pcie.as_mut() {
            let samples = inventory.get::<Vec<PcieSample>>().map_or(&[][..], Vec::as_slice);
            let assembled = CounterSeriesAssembler::new(env.ctx.session_pid).assemble(samples);
            self.collect(report, assembled, &mut outputs);
        }
        if let Some(report) = host.as_mut() {
            let assembled = HostTraceAssembler::new(env.ctx.session_pid).assemble(&trees);
            self.collect(report, assembled, &mut outputs);
        }
        if let Some(report) = task.as_mut() {
            let tasks = inventory.get::<Vec<DeviceTask>>().map_or(&[][..], Vec::as_slice);
            let links = link_host_tasks(&trees, tasks);
            tracing::debug!(links = links.len(), "host tasks linked to device tasks");
            let assembled =
                DeviceTaskAssembler::new(env.ctx.session_pid).assemble(tasks, &links);
            self.collect(report, assembled, &mut outputs);
        }
        self.phase_end("assemble", started);

        let mut events_written = 0;
        if let Some(path) = &self.options.trace_path {
            let started = self.phase_start("write");
            let written = write_trace(path, &outputs)?;
            let reports = [pcie.as_mut(), host.as_mut(), task.as_mut()];
            for report in reports.into_iter().flatten() {
                report.events_written = written.get(report.domain).copied().unwrap_or(0);
            }
            events_written = written.values().sum();
            env.ctx.metrics.trace_events.inc_by(events_written as f64);
            self.phase_end("write", started);
        }

        let mut quality = QualityReport::default();
        for tree in &trees {
            quality.merge(&tree.quality);
        }

        if let Some(path) = &self.options.metrics_textfile {
            env.ctx.metrics.write_textfile(path)?;
        }

        Ok(RunSummary {
            domains: [pcie, task, host].into_iter().flatten().collect(),
            events_written,
            quality,
            records: env.ctx.stats.snapshot(),
        })
    }

    /// Builds one tree per thread, then, after every build has finished,
    /// numbers nodes globally in thread order and analyses the trees.
    async fn analyze_host(
        &self,
        events: HostEvents,
        report: &mut DomainReport,
    ) -> Vec<AnalyzedTree> {
        let env = &self.env;
        let thread_ids: Vec<u32> = events.threads.iter().map(|t| t.thread_id).collect();
        let built = env
            .pool
            .run_all(events.threads, |t: ThreadEvents| {
                build_tree(t.thread_id, t.events)
            })
            .await;

        let mut trees = Vec::with_capacity(built.len());
        for (thread_id, result) in thread_ids.iter().zip(built) {
            let result = result
                .map_err(PartitionError::from)
                .and_then(|r| r.map_err(PartitionError::from));
            match result {
                Ok(tree) => {
                    if let Some(limit) = self.options.max_depth_warning {
                        if tree.max_depth() > limit {
                            tracing::warn!(
                                thread_id,
                                depth = tree.max_depth(),
                                limit,
                                "call tree deeper than expected",
                            );
                        }
                    }
                    trees.push(tree);
                }
                Err(e) => report.partition_failed(&env.ctx, format!("thread {thread_id}"), &e),
            }
        }

        trees.sort_by_key(|t| t.thread_id());
        let counts: Vec<usize> = trees.iter().map(|t| t.event_count()).collect();
        let units: Vec<_> = trees.into_iter().zip(connection_bases(&counts)).collect();
        let thread_ids: Vec<u32> = units.iter().map(|(t, _)| t.thread_id()).collect();

        let ctx = Arc::clone(&env.ctx);
        let analyzed = env
            .pool
            .run_all(units, move |(tree, base): (EventTree, u64)| {
                analyze_tree(&tree, &ctx.names, base)
            })
            .await;

        let mut out = Vec::with_capacity(analyzed.len());
        for (thread_id, result) in thread_ids.iter().zip(analyzed) {
            let result = result
                .map_err(PartitionError::from)
                .and_then(|r| r.map_err(PartitionError::from));
            match result {
                Ok(tree) => {
                    env.ctx.metrics.observe_quality(&tree.quality);
                    if tree.quality.total() > 0 {
                        tracing::warn!(
                            thread_id,
                            clipped = tree.quality.count(DataQuality::ContainmentClipped),
                            unknown_end = tree.quality.count(DataQuality::UnknownEnd),
                            unclassified = tree.unknown_count(),
                            "data quality warnings in call tree",
                        );
                    }
                    out.push(tree);
                }
                Err(e) => report.partition_failed(&env.ctx, format!("thread {thread_id}"), &e),
            }
        }

        tracing::info!(
            threads = out.len(),
            nodes = out.iter().map(|t| t.nodes.len()).sum::<usize>(),
            "host call trees analysed",
        );
        out
    }

    fn store_spans(&self, trees: &[AnalyzedTree], report: &mut DomainReport) {
        let mut tables: HashMap<Table, Vec<Row>> = HashMap::new();
        for node in trees.iter().flat_map(|t| &t.nodes) {
            if let Some((table, row)) = span_row(node) {
                tables.entry(table).or_default().push(row);
            }
        }
        for table in [Table::HostTask, Table::ComputeOp, Table::CollectiveOp, Table::StepTrace] {
            if let Some(rows) = tables.remove(&table) {
                self.env.store_rows(report, table, rows);
            }
        }
    }

    /// Keeps the events of a successful assembly; a failed one withholds the
    /// domain's output and fails the domain.
    fn collect(
        &self,
        report: &mut DomainReport,
        assembled: Result<Assembled, AssembleError>,
        outputs: &mut Vec<(&'static str, Vec<TraceEvent>)>,
    ) {
        match assembled {
            Ok(Assembled::NoData) => {
                tracing::info!(domain = report.domain, "no data to assemble");
            }
            Ok(Assembled::Events(events)) => outputs.push((report.domain, events)),
            Err(e) => {
                let partition = report.domain.to_string();
                report.fail(&self.env.ctx, partition, "assemble_failed", e.to_string());
            }
        }
    }

    fn phase_start(&self, phase: &'static str) -> Instant {
        tracing::info!(phase, "phase started");
        Instant::now()
    }

    fn phase_end(&self, phase: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        self.env
            .ctx
            .metrics
            .phase_duration
            .with_label_values(&[phase])
            .observe(elapsed.as_secs_f64());
        tracing::info!(phase, elapsed = ?elapsed, "phase finished");
    }
}

/// Writes every domain's events into one JSON array, returning the number of
/// events written per domain.
fn write_trace(
    path: &std::path::Path,
    outputs: &[(&'static str, Vec<TraceEvent>)],
) -> Result<HashMap<&'static str, usize>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }

    let mut writer = JsonTraceWriter::create(path)?;
    let mut written = HashMap::new();
    for (domain, events) in outputs {
        let before = writer.events_written();
        writer.write_all(events)?;
        *written.entry(*domain).or_insert(0) += writer.events_written() - before;
    }
    writer.finish()?;

    tracing::info!(path = %path.display(), events = written.values().sum::<usize>(), "trace written");
    Ok(written)
}

/// Storage row of an analysed node. Unknown nodes are not stored.
fn span_row(node: &AnalyzedNode) -> Option<(Table, Row)> {
    let mut row = vec![
        Value::from_u64(node.connection_id),
        Value::from(node.parent_connection_id),
        Value::from(node.thread_id),
        Value::from_u64(node.start.as_nanos_u64()),
        Value::from_u64(node.end.as_nanos_u64()),
    ];
    let table = match &node.kind {
        NodeKind::HostTask {
            name,
            device_id,
            stream_id,
            task_id,
        } => {
            row.push(Value::from(name.as_str()));
            row.push(Value::from(*device_id));
            row.push(Value::from(*stream_id));
            row.push(Value::from(*task_id));
            Table::HostTask
        }
        NodeKind::ComputeOp { name } => {
            row.push(Value::from(name.as_str()));
            Table::ComputeOp
        }
        NodeKind::CollectiveOp { name } => {
            row.push(Value::from(name.as_str()));
            Table::CollectiveOp
        }
        NodeKind::StepBoundary { name } => {
            row.push(Value::from(name.as_str()));
            Table::StepTrace
        }
        NodeKind::Unknown { .. } => return None,
    };
    Some((table, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HpTime;

    fn analyzed(kind: NodeKind) -> AnalyzedNode {
        AnalyzedNode {
            connection_id: 5,
            parent_connection_id: Some(2),
            thread_id: 8,
            start: HpTime::from_nanos(100),
            end: HpTime::from_nanos(250),
            depth: 1,
            kind,
        }
    }

    #[test]
    fn test_span_rows() {
        let (table, row) = span_row(&analyzed(NodeKind::HostTask {
            name: "launch".into(),
            device_id: 1,
            stream_id: 2,
            task_id: 3,
        }))
        .expect("row");
        assert_eq!(table, Table::HostTask);
        assert_eq!(row.len(), Table::HostTask.columns().len());
        assert_eq!(row[1], Value::Integer(2));
        assert_eq!(row[5], Value::from("launch"));

        let (table, row) =
            span_row(&analyzed(NodeKind::StepBoundary { name: "s".into() })).expect("row");
        assert_eq!(table, Table::StepTrace);
        assert_eq!(row.len(), Table::StepTrace.columns().len());

        let unknown = analyzed(NodeKind::Unknown {
            level: 1,
            item_id: 2,
        });
        assert!(span_row(&unknown).is_none());
    }

    #[test]
    fn test_summary_success_is_and_of_domains() {
        let ctx = PipelineContext::for_tests();
        let ok = DomainReport::new("pcie");
        let mut bad = DomainReport::new("task");
        bad.fail(&ctx, "device 0".into(), "read", "gone".into());

        let summary = RunSummary {
            domains: vec![ok.clone()],
            events_written: 0,
            quality: QualityReport::default(),
            records: Vec::new(),
        };
        assert!(summary.success());

        let summary = RunSummary {
            domains: vec![bad, ok],
            ..summary
        };
        assert!(!summary.success());
        assert!(summary.domain("pcie").is_some_and(DomainReport::success));
    }
}
