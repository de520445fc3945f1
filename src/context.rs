//! Read-only state shared by every phase of a run.
//!
//! A [`PipelineContext`] is built once on the main task before any work is
//! dispatched and is then shared behind an `Arc`. Nothing in it is mutated
//! after construction apart from the atomic counters in [`RecordStats`] and
//! the prometheus metrics.

use std::collections::HashMap;

use anyhow::{Context as _, Result};

use crate::clock::{CalibrationTable, HOST_DEVICE_ID};
use crate::export::PipelineMetrics;
use crate::record::RecordStats;
use crate::source::{DataSource, FileStore};

/// Lookup from the 64-bit name hashes carried by host events to their names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    names: HashMap<u64, String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: u64, name: impl Into<String>) {
        self.names.insert(hash, name.into());
    }

    pub fn get(&self, hash: u64) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(u64, S)> for NameTable {
    fn from_iter<I: IntoIterator<Item = (u64, S)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

/// Everything the processors and assemblers need besides their own input.
pub struct PipelineContext {
    /// Profiling session id, the high part of every trace pid.
    pub session_pid: u32,
    /// Devices that took part in the session, ascending.
    pub devices: Vec<u32>,
    /// Calibration of every device that had a usable record, plus the host.
    pub calibration: CalibrationTable,
    pub names: NameTable,
    pub metrics: PipelineMetrics,
    pub stats: RecordStats,
}

impl PipelineContext {
    pub fn new(
        session_pid: u32,
        mut devices: Vec<u32>,
        calibration: CalibrationTable,
        names: NameTable,
    ) -> Result<Self> {
        devices.sort_unstable();
        devices.dedup();
        Ok(Self {
            session_pid,
            devices,
            calibration,
            names,
            metrics: PipelineMetrics::new().context("registering pipeline metrics")?,
            stats: RecordStats::new(),
        })
    }

    /// Loads the session description, calibrations and the name table.
    ///
    /// Only an unreadable session description is fatal. A missing or invalid
    /// calibration leaves the device out of the table so its partitions fail
    /// later with `CalibrationMissing`; a missing name table leaves every
    /// named node unclassified.
    pub fn load(files: &impl FileStore, session_pid_override: Option<u32>) -> Result<Self> {
        let session = files.read_session().context("reading session info")?;
        let session_pid = session_pid_override.unwrap_or(session.pid);

        let mut calibration = CalibrationTable::new();
        let sources = session
            .devices
            .iter()
            .map(|&id| DataSource::Device(id))
            .chain(std::iter::once(DataSource::Host));
        for source in sources {
            match files.read_calibration(source) {
                Ok(record) => calibration.insert(record),
                Err(e) => tracing::warn!(
                    device_id = source.calibration_id(),
                    error = format_args!("{e:#}"),
                    "calibration unavailable, device data will be skipped",
                ),
            }
        }

        let names = match files.read_name_table() {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = format_args!("{e:#}"), "name table unavailable");
                NameTable::new()
            }
        };

        let ctx = Self::new(session_pid, session.devices, calibration, names)?;
        tracing::info!(
            session_pid = ctx.session_pid,
            hostname = %session.hostname,
            devices = ?ctx.devices,
            calibrated = ctx.calibration.len(),
            host_calibrated = ctx.calibration.get(HOST_DEVICE_ID).is_ok(),
            names = ctx.names.len(),
            "pipeline context loaded",
        );
        Ok(ctx)
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        match Self::new(1234, vec![0], CalibrationTable::new(), NameTable::new()) {
            Ok(ctx) => ctx,
            Err(e) => panic!("test context: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table() {
        let mut names = NameTable::from_iter([(1u64, "MatMul"), (2, "AllReduce")]);
        names.insert(3, String::from("Step"));
        assert_eq!(names.len(), 3);
        assert_eq!(names.get(2), Some("AllReduce"));
        assert_eq!(names.get(9), None);
    }

    #[test]
    fn test_new_sorts_devices() {
        let ctx = PipelineContext::new(7, vec![3, 1, 3, 0], CalibrationTable::new(), NameTable::new())
            .expect("context");
        assert_eq!(ctx.devices, vec![0, 1, 3]);
        assert_eq!(ctx.session_pid, 7);
    }
}
