use std::sync::Arc;

use crate::clock::{ClockAligner, ClockDomain, HpTime};
use crate::export::{Row, Table, Value};
use crate::flip::{partition_by_stream, FlipError, StreamKey, StreamPartition, StreamStats};
use crate::record::event::{batch_id, task_id_low16};
use crate::record::{FlipMarker, TaskRecord};
use crate::source::{DataSource, FileStore};

use super::{read_kind, DataInventory, DomainReport, PartitionError, ProcessEnv};

/// Device task with its recovered composite id on the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTask {
    pub device_id: u16,
    pub stream_id: u16,
    pub task_type: u16,
    pub task_id: u32,
    pub timestamp: HpTime,
}

impl DeviceTask {
    pub fn from_record(record: &TaskRecord, aligner: &ClockAligner) -> Self {
        Self {
            device_id: record.device_id,
            stream_id: record.stream_id,
            task_type: record.task_type,
            task_id: record.task_id,
            timestamp: aligner.align(record.timestamp),
        }
    }

    pub fn task_id_low16(&self) -> u16 {
        task_id_low16(self.task_id)
    }

    pub fn batch_id(&self) -> u16 {
        batch_id(self.task_id)
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            device_id: self.device_id,
            stream_id: self.stream_id,
        }
    }

    /// Row of the `task_track` table.
    pub fn to_row(&self) -> Row {
        vec![
            Value::from(self.device_id),
            Value::from(self.stream_id),
            Value::from(u32::from(self.task_id_low16())),
            Value::from(u32::from(self.batch_id())),
            Value::from(self.task_type),
            Value::from_u64(self.timestamp.as_nanos_u64()),
        ]
    }
}

/// Streams of one device, ready to be recovered independently.
struct DeviceStreams {
    aligner: Option<ClockAligner>,
    partitions: Vec<StreamPartition>,
}

/// Result of recovering one stream on a worker.
struct StreamResult {
    tasks: Vec<DeviceTask>,
    result: Result<StreamStats, FlipError>,
}

/// Reads task and flip records, recovers batch ids per stream and aligns the
/// result onto the wall clock.
pub struct TaskProcessor;

impl TaskProcessor {
    pub const DOMAIN: &'static str = "task";

    /// Runs in two pool rounds: one unit per device to read and partition its
    /// records, then one unit per stream to recover batch ids. Injects all
    /// surviving tasks as `Vec<DeviceTask>`, grouped by stream and time ordered
    /// within a stream.
    ///
    /// A stream whose recovery fails keeps its raw ids and is reported as a
    /// failed partition.
    pub async fn run<F: FileStore + 'static>(
        env: &ProcessEnv<F>,
        inventory: &mut DataInventory,
    ) -> DomainReport {
        let mut report = DomainReport::new(Self::DOMAIN);
        let devices = env.ctx.devices.clone();

        let ctx = Arc::clone(&env.ctx);
        let files = Arc::clone(&env.files);
        let read = env
            .pool
            .run_all(
                devices.clone(),
                move |device_id: u32| -> Result<DeviceStreams, PartitionError> {
                    let source = DataSource::Device(device_id);
                    let tasks = read_kind::<TaskRecord, F>(&ctx, &files, source)?;
                    if tasks.is_empty() {
                        return Ok(DeviceStreams {
                            aligner: None,
                            partitions: Vec::new(),
                        });
                    }
                    let aligner = ctx
                        .calibration
                        .aligner(device_id, ClockDomain::DeviceCycles)?;
                    let markers = read_kind::<FlipMarker, F>(&ctx, &files, source)?;
                    Ok(DeviceStreams {
                        aligner: Some(aligner),
                        partitions: partition_by_stream(tasks, markers),
                    })
                },
            )
            .await;

        let mut units = Vec::new();
        for (device_id, result) in devices.iter().zip(read) {
            match result.map_err(PartitionError::from).and_then(|r| r) {
                Ok(DeviceStreams {
                    aligner: Some(aligner),
                    partitions,
                }) => {
                    units.extend(partitions.into_iter().map(|p| (p, aligner.clone())));
                }
                Ok(_) => {}
                Err(e) => report.partition_failed(&env.ctx, format!("device {device_id}"), &e),
            }
        }

        report.partitions = units.len();
        let keys: Vec<StreamKey> = units.iter().map(|(p, _)| p.key).collect();
        let recovered = env
            .pool
            .run_all(units, |(partition, aligner): (StreamPartition, ClockAligner)| {
                let outcome = partition.recover();
                StreamResult {
                    tasks: outcome
                        .tasks
                        .iter()
                        .map(|t| DeviceTask::from_record(t, &aligner))
                        .collect(),
                    result: outcome.result,
                }
            })
            .await;

        let mut tasks = Vec::new();
        let mut recalibrated = 0;
        for (key, result) in keys.iter().zip(recovered) {
            let partition = format!("device {} stream {}", key.device_id, key.stream_id);
            match result {
                Ok(stream) => {
                    match stream.result {
                        Ok(stats) => recalibrated += stats.recalibrated,
                        Err(e) => report.partition_failed(&env.ctx, partition, &e.into()),
                    }
                    tasks.extend(stream.tasks);
                }
                Err(e) => report.partition_failed(&env.ctx, partition, &e.into()),
            }
        }

        report.records = tasks.len();
        let rows = tasks.iter().map(DeviceTask::to_row).collect();
        env.store_rows(&mut report, Table::TaskTrack, rows);

        tracing::info!(
            streams = report.partitions,
            tasks = tasks.len(),
            recalibrated,
            failed = report.failures.len(),
            "task processing complete",
        );
        inventory.inject(tasks);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::CalibrationRecord;
    use crate::record::event::compose_task_id;

    #[test]
    fn test_device_task_row() {
        let calib = CalibrationRecord::new(1, 0, 0, 5_000, 1_000.0).expect("calib");
        let aligner = ClockAligner::new(calib, ClockDomain::DeviceCycles);
        let record = TaskRecord {
            device_id: 1,
            stream_id: 4,
            task_type: 2,
            task_id: compose_task_id(17, 3),
            timestamp: 2_000,
        };

        let task = DeviceTask::from_record(&record, &aligner);
        assert_eq!(task.timestamp.as_nanos(), 7_000);
        assert_eq!(task.task_id_low16(), 17);
        assert_eq!(task.batch_id(), 3);
        assert_eq!(
            task.stream_key(),
            StreamKey {
                device_id: 1,
                stream_id: 4
            }
        );

        let row = task.to_row();
        assert_eq!(row.len(), Table::TaskTrack.columns().len());
        assert_eq!(row[2], Value::Integer(17));
        assert_eq!(row[3], Value::Integer(3));
        assert_eq!(row[5], Value::Integer(7_000));
    }
}
