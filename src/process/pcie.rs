use std::sync::Arc;

use crate::clock::{ClockAligner, ClockDomain, HpTime};
use crate::export::{Row, Table, Value};
use crate::record::{PcieRecord, RawBandwidth};
use crate::source::{DataSource, FileStore};

use super::{read_kind, DataInventory, DomainReport, PartitionError, ProcessEnv};

/// Raw bandwidth is bytes/µs; samples carry bytes/s.
const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Min/max/avg triple in display-neutral units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bandwidth {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Bandwidth {
    fn scaled(raw: RawBandwidth, factor: f64) -> Self {
        Self {
            min: f64::from(raw.min) * factor,
            max: f64::from(raw.max) * factor,
            avg: f64::from(raw.avg) * factor,
        }
    }

    /// A triple where only the average is known.
    pub fn avg_only(avg: f64) -> Self {
        Self {
            min: avg,
            max: avg,
            avg,
        }
    }
}

/// Clock-aligned PCIe sample. Bandwidth in bytes/s, latency in ns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcieSample {
    pub device_id: u16,
    pub timestamp: HpTime,
    pub tx_post: Bandwidth,
    pub tx_nonpost: Bandwidth,
    pub tx_cpl: Bandwidth,
    pub tx_nonpost_latency: Bandwidth,
    pub rx_post: Bandwidth,
    pub rx_nonpost: Bandwidth,
    pub rx_cpl: Bandwidth,
}

impl PcieSample {
    pub fn zeroed(device_id: u16) -> Self {
        Self {
            device_id,
            timestamp: HpTime::ZERO,
            tx_post: Bandwidth::default(),
            tx_nonpost: Bandwidth::default(),
            tx_cpl: Bandwidth::default(),
            tx_nonpost_latency: Bandwidth::default(),
            rx_post: Bandwidth::default(),
            rx_nonpost: Bandwidth::default(),
            rx_cpl: Bandwidth::default(),
        }
    }

    pub fn from_record(record: &PcieRecord, aligner: &ClockAligner) -> Self {
        let bw = |raw| Bandwidth::scaled(raw, MICROS_PER_SECOND);
        Self {
            device_id: record.device_id,
            timestamp: aligner.align(record.timestamp),
            tx_post: bw(record.tx_post),
            tx_nonpost: bw(record.tx_nonpost),
            tx_cpl: bw(record.tx_cpl),
            tx_nonpost_latency: Bandwidth::scaled(record.tx_nonpost_latency, 1.0),
            rx_post: bw(record.rx_post),
            rx_nonpost: bw(record.rx_nonpost),
            rx_cpl: bw(record.rx_cpl),
        }
    }

    /// Row of the `pcie_bandwidth` table.
    pub fn to_row(&self) -> Row {
        let mut row = Vec::with_capacity(Table::PcieBandwidth.columns().len());
        row.push(Value::from(self.device_id));
        row.push(Value::from_u64(self.timestamp.as_nanos_u64()));
        for bw in [
            self.tx_post,
            self.tx_nonpost,
            self.tx_cpl,
            self.tx_nonpost_latency,
            self.rx_post,
            self.rx_nonpost,
            self.rx_cpl,
        ] {
            row.extend([Value::Real(bw.min), Value::Real(bw.max), Value::Real(bw.avg)]);
        }
        row
    }
}

/// Aligns one device's records, sorted by aligned time.
pub fn process_device_pcie(records: &[PcieRecord], aligner: &ClockAligner) -> Vec<PcieSample> {
    let mut samples: Vec<PcieSample> = records
        .iter()
        .map(|r| PcieSample::from_record(r, aligner))
        .collect();
    samples.sort_by_key(|s| s.timestamp);
    samples
}

/// Reads, aligns and stores PCIe samples of every device.
pub struct PcieProcessor;

impl PcieProcessor {
    pub const DOMAIN: &'static str = "pcie";

    /// Runs one unit per device and injects the time-ordered samples of all
    /// successful devices as `Vec<PcieSample>`.
    pub async fn run<F: FileStore + 'static>(
        env: &ProcessEnv<F>,
        inventory: &mut DataInventory,
    ) -> DomainReport {
        let mut report = DomainReport::new(Self::DOMAIN);
        let devices = env.ctx.devices.clone();
        report.partitions = devices.len();

        let ctx = Arc::clone(&env.ctx);
        let files = Arc::clone(&env.files);
        let results = env
            .pool
            .run_all(
                devices.clone(),
                move |device_id: u32| -> Result<Vec<PcieSample>, PartitionError> {
                    let source = DataSource::Device(device_id);
                    let records = read_kind::<PcieRecord, F>(&ctx, &files, source)?;
                    if records.is_empty() {
                        return Ok(Vec::new());
                    }
                    let aligner = ctx
                        .calibration
                        .aligner(device_id, ClockDomain::DeviceCycles)?;
                    Ok(process_device_pcie(&records, &aligner))
                },
            )
            .await;

        let mut samples = Vec::new();
        for (device_id, result) in devices.iter().zip(results) {
            match result.map_err(PartitionError::from).and_then(|r| r) {
                Ok(device_samples) => samples.extend(device_samples),
                Err(e) => report.partition_failed(&env.ctx, format!("device {device_id}"), &e),
            }
        }

        report.records = samples.len();
        let rows = samples.iter().map(PcieSample::to_row).collect();
        env.store_rows(&mut report, Table::PcieBandwidth, rows);

        tracing::info!(
            devices = report.partitions,
            samples = samples.len(),
            failed = report.failures.len(),
            "pcie processing complete",
        );
        inventory.inject(samples);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CalibrationRecord;

    fn raw(avg: u32) -> RawBandwidth {
        RawBandwidth {
            min: avg / 2,
            max: avg * 2,
            avg,
        }
    }

    #[test]
    fn test_from_record_units() {
        let calib = CalibrationRecord::new(0, 0, 100, 1_000_000, 100.0).expect("calib");
        let aligner = ClockAligner::new(calib, ClockDomain::DeviceCycles);
        let record = PcieRecord {
            device_id: 0,
            timestamp: 200,
            tx_post: raw(62),
            tx_nonpost: raw(0),
            tx_cpl: raw(0),
            tx_nonpost_latency: raw(1_500),
            rx_post: raw(4),
            rx_nonpost: raw(0),
            rx_cpl: raw(0),
        };

        let sample = PcieSample::from_record(&record, &aligner);
        // 100 ticks at 100 MHz is 1µs.
        assert_eq!(sample.timestamp.as_nanos(), 1_001_000);
        assert_eq!(sample.tx_post.avg, 62_000_000.0);
        assert_eq!(sample.tx_post.max, 124_000_000.0);
        assert_eq!(sample.tx_nonpost_latency.avg, 1_500.0);
        assert_eq!(sample.rx_post.min, 2_000_000.0);

        let row = sample.to_row();
        assert_eq!(row.len(), Table::PcieBandwidth.columns().len());
        assert_eq!(row[1], Value::Integer(1_001_000));
        assert_eq!(row[4], Value::Real(62_000_000.0));
    }

    #[test]
    fn test_process_sorts_by_time() {
        let calib = CalibrationRecord::new(0, 0, 0, 0, 1_000.0).expect("calib");
        let aligner = ClockAligner::new(calib, ClockDomain::DeviceCycles);
        let mk = |ts| PcieRecord {
            device_id: 0,
            timestamp: ts,
            tx_post: raw(1),
            tx_nonpost: raw(1),
            tx_cpl: raw(1),
            tx_nonpost_latency: raw(1),
            rx_post: raw(1),
            rx_nonpost: raw(1),
            rx_cpl: raw(1),
        };
        let samples = process_device_pcie(&[mk(30), mk(10), mk(20)], &aligner);
        let ts: Vec<u128> = samples.iter().map(|s| s.timestamp.as_nanos()).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }
}
