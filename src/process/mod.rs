//! Per-domain processors: read raw records, align them onto the wall clock,
//! store rows and hand typed results to the assemblers through a
//! [`DataInventory`].
//!
//! Failures are resolved per partition (device, stream or thread) and recorded
//! in the domain's [`DomainReport`]; a failed partition never stops its
//! siblings.

pub mod host;
pub mod inventory;
pub mod pcie;
pub mod task;

use std::sync::Arc;

use thiserror::Error;

use crate::clock::ClockError;
use crate::context::PipelineContext;
use crate::export::{RecordStore, Row, Table};
use crate::flip::FlipError;
use crate::pipeline::pool::{PoolError, WorkerPool};
use crate::record::RecordShape;
use crate::source::{DataSource, FileStore};
use crate::tree::TreeError;

pub use host::{HostEvents, HostProcessor, ThreadEvents};
pub use inventory::DataInventory;
pub use pcie::{Bandwidth, PcieProcessor, PcieSample};
pub use task::{DeviceTask, TaskProcessor};

/// Why a single partition was abandoned.
#[derive(Error, Debug)]
pub enum PartitionError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Flip(#[from] FlipError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("reading records: {0:#}")]
    Read(anyhow::Error),
}

impl PartitionError {
    /// Metric label of the failure class.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Clock(ClockError::CalibrationMissing { .. }) => "calibration_missing",
            Self::Clock(ClockError::InvalidFrequency { .. }) => "invalid_calibration",
            Self::Flip(_) | Self::Tree(_) => "allocation",
            Self::Pool(_) => "worker",
            Self::Read(_) => "read",
        }
    }
}

/// One abandoned partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition: String,
    pub reason: &'static str,
    pub message: String,
}

/// Outcome of one domain across all of its partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainReport {
    pub domain: &'static str,
    pub partitions: usize,
    pub records: usize,
    pub rows_stored: usize,
    pub events_written: usize,
    pub failures: Vec<PartitionFailure>,
}

impl DomainReport {
    pub fn new(domain: &'static str) -> Self {
        Self {
            domain,
            partitions: 0,
            records: 0,
            rows_stored: 0,
            events_written: 0,
            failures: Vec::new(),
        }
    }

    /// True when every partition and every domain-wide step succeeded.
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Records and logs a failed partition.
    pub fn partition_failed(
        &mut self,
        ctx: &PipelineContext,
        partition: impl Into<String>,
        err: &PartitionError,
    ) {
        self.fail(ctx, partition.into(), err.reason(), err.to_string());
    }

    /// Records and logs a failure that affects the whole domain.
    pub fn fail(&mut self, ctx: &PipelineContext, partition: String, reason: &'static str, message: String) {
        tracing::warn!(
            domain = self.domain,
            partition = %partition,
            reason,
            error = %message,
            "partition failed",
        );
        ctx.metrics.partition_failed(self.domain, reason);
        self.failures.push(PartitionFailure {
            partition,
            reason,
            message,
        });
    }
}

/// Shared handles every processor works with.
pub struct ProcessEnv<F> {
    pub ctx: Arc<PipelineContext>,
    pub files: Arc<F>,
    pub store: Arc<dyn RecordStore>,
    pub pool: Arc<WorkerPool>,
}

impl<F> Clone for ProcessEnv<F> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            files: Arc::clone(&self.files),
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<F> ProcessEnv<F> {
    /// Inserts rows after processing, failing the domain on store errors.
    pub fn store_rows(&self, report: &mut DomainReport, table: Table, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        match self.store.insert(table, rows) {
            Ok(n) => {
                report.rows_stored += n;
                self.ctx
                    .metrics
                    .rows_stored
                    .with_label_values(&[table.name()])
                    .inc_by(n as f64);
            }
            Err(e) => report.fail(&self.ctx, table.name().to_string(), "store", format!("{e:#}")),
        }
    }
}

/// Reads every record of one kind from `source`, counting reads and drops.
pub(crate) fn read_kind<R: RecordShape, F: FileStore>(
    ctx: &PipelineContext,
    files: &F,
    source: DataSource,
) -> Result<Vec<R>, PartitionError> {
    let decoded = files
        .read_records::<R>(source)
        .map_err(PartitionError::Read)?;

    ctx.stats.record_read(R::KIND, decoded.records.len() as u64);
    ctx.stats.record_dropped(R::KIND, decoded.dropped as u64);
    ctx.metrics
        .observe_records(R::KIND, decoded.records.len(), decoded.dropped);

    Ok(decoded.records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_error_reasons() {
        let missing = PartitionError::from(ClockError::CalibrationMissing { device_id: 1 });
        assert_eq!(missing.reason(), "calibration_missing");
        assert_eq!(missing.to_string(), "no calibration record for device 1");

        let pool = PartitionError::from(PoolError::Closed);
        assert_eq!(pool.reason(), "worker");

        let read = PartitionError::Read(anyhow::anyhow!("disk gone"));
        assert_eq!(read.reason(), "read");
        assert!(read.to_string().contains("disk gone"));
    }

    #[test]
    fn test_domain_report_success() {
        let ctx = PipelineContext::for_tests();
        let mut report = DomainReport::new("task");
        assert!(report.success());
        report.partition_failed(
            &ctx,
            "device 3",
            &PartitionError::from(ClockError::CalibrationMissing { device_id: 3 }),
        );
        assert!(!report.success());
        assert_eq!(report.failures[0].reason, "calibration_missing");
        assert_eq!(report.failures[0].partition, "device 3");
    }
}
