//! Batch-id ("flip") recovery for recycled 16-bit task ids.
//!
//! A hardware stream hands out 16-bit local task ids and wraps around; the
//! producer emits a [`FlipMarker`] at each wrap. Walking the timestamp-sorted
//! tasks of one stream against its sorted markers yields a monotonic batch
//! counter which is packed into the high 16 bits of each task id.

use std::collections::BTreeMap;
use std::collections::TryReserveError;

use thiserror::Error;

use crate::record::{FlipMarker, TaskRecord};

/// Flip number marking stream teardown. Also used for the terminal sentinel.
pub const STREAM_DESTROY: u16 = u16::MAX;

/// Errors that abort recovery of a single stream.
#[derive(Error, Debug)]
pub enum FlipError {
    #[error("device {device_id} stream {stream_id}: allocating recovery state: {source}")]
    Allocation {
        device_id: u16,
        stream_id: u16,
        #[source]
        source: TryReserveError,
    },
}

/// Identity of one hardware dispatch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub device_id: u16,
    pub stream_id: u16,
}

/// Counters from recovering one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub tasks: usize,
    /// Markers crossed, i.e. the final batch id before wrapping.
    pub flips: usize,
    /// Tasks moved into a later batch by the backward pass.
    pub recalibrated: usize,
}

/// Tasks and markers of one stream, owned so the unit can move to a worker.
#[derive(Debug, Clone)]
pub struct StreamPartition {
    pub key: StreamKey,
    pub tasks: Vec<TaskRecord>,
    pub markers: Vec<FlipMarker>,
}

impl StreamPartition {
    /// Runs recovery on this partition. On failure the tasks are handed back
    /// untouched together with the error.
    pub fn recover(mut self) -> PartitionOutcome {
        match recover_stream(&mut self.tasks, self.markers) {
            Ok(stats) => PartitionOutcome {
                key: self.key,
                tasks: self.tasks,
                result: Ok(stats),
            },
            Err(e) => PartitionOutcome {
                key: self.key,
                tasks: self.tasks,
                result: Err(e),
            },
        }
    }
}

/// Tasks of one stream after a recovery attempt.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub key: StreamKey,
    /// Recovered tasks, or the original tasks when `result` is an error.
    pub tasks: Vec<TaskRecord>,
    pub result: Result<StreamStats, FlipError>,
}

/// Splits tasks and markers by stream. Markers of streams without tasks are
/// discarded. Partitions come out in (device, stream) order.
pub fn partition_by_stream(
    tasks: Vec<TaskRecord>,
    markers: Vec<FlipMarker>,
) -> Vec<StreamPartition> {
    let mut streams: BTreeMap<StreamKey, StreamPartition> = BTreeMap::new();

    for task in tasks {
        let key = StreamKey {
            device_id: task.device_id,
            stream_id: task.stream_id,
        };
        streams
            .entry(key)
            .or_insert_with(|| StreamPartition {
                key,
                tasks: Vec::new(),
                markers: Vec::new(),
            })
            .tasks
            .push(task);
    }

    for marker in markers {
        let key = StreamKey {
            device_id: marker.device_id,
            stream_id: marker.stream_id,
        };
        if let Some(partition) = streams.get_mut(&key) {
            partition.markers.push(marker);
        }
    }

    streams.into_values().collect()
}

/// Assigns batch ids to the tasks of a single stream, in place.
///
/// Tasks end up sorted by timestamp (stable, so producer order breaks ties).
/// Both inputs must belong to the same stream. On error nothing was modified.
pub fn recover_stream(
    tasks: &mut Vec<TaskRecord>,
    mut markers: Vec<FlipMarker>,
) -> Result<StreamStats, FlipError> {
    let Some(first) = tasks.first().copied() else {
        return Ok(StreamStats::default());
    };

    markers
        .try_reserve_exact(1)
        .map_err(|source| FlipError::Allocation {
            device_id: first.device_id,
            stream_id: first.stream_id,
            source,
        })?;

    tasks.sort_by_key(|t| t.timestamp);
    markers.sort_by_key(|m| m.timestamp);
    markers.push(FlipMarker {
        device_id: first.device_id,
        stream_id: first.stream_id,
        flip_num: STREAM_DESTROY,
        task_id: 0,
        timestamp: u64::MAX,
    });

    let mut stats = StreamStats {
        tasks: tasks.len(),
        ..StreamStats::default()
    };
    let mut batch = 0usize;
    let mut task_idx = 0usize;

    while let Some(task) = tasks.get(task_idx).copied() {
        let Some(marker) = markers.get(batch).copied() else {
            break;
        };

        if task.timestamp > marker.timestamp {
            batch += 1;
            stats.flips = batch;
            if marker.flip_num != STREAM_DESTROY {
                stats.recalibrated += calibrate_backward(tasks, task_idx, marker.task_id, batch);
            }
            continue;
        }

        if let Some(t) = tasks.get_mut(task_idx) {
            t.set_batch_id(wrap_batch(batch));
        }
        task_idx += 1;
    }

    Ok(stats)
}

/// Moves the run of tasks right before `task_idx` whose local id is below the
/// marker's id into `batch`. Producer threads do not serialize id allocation
/// perfectly, so the first ids of a new batch can be stamped before the marker.
fn calibrate_backward(
    tasks: &mut [TaskRecord],
    task_idx: usize,
    marker_task_id: u16,
    batch: usize,
) -> usize {
    let mut moved = 0;
    let mut idx = task_idx;
    while idx > 0 {
        let Some(prev) = tasks.get_mut(idx - 1) else {
            break;
        };
        if prev.task_id_low16() >= marker_task_id {
            break;
        }
        prev.set_batch_id(wrap_batch(batch));
        moved += 1;
        idx -= 1;
    }
    moved
}

/// Batch ids past 65535 wrap modulo 2^16 in the composite id.
fn wrap_batch(batch: usize) -> u16 {
    (batch & 0xFFFF) as u16
}

/// Output of [`recover_batch_ids`].
#[derive(Debug, Default)]
pub struct BatchRecovery {
    /// All tasks, grouped by stream in (device, stream) order.
    pub tasks: Vec<TaskRecord>,
    pub recalibrated: usize,
    /// Streams whose recovery was skipped; their tasks keep their raw ids.
    pub failed_streams: Vec<StreamKey>,
}

/// Recovers batch ids for every stream in the input, one stream at a time.
///
/// A failing stream is logged and left unrecovered; the rest still complete.
pub fn recover_batch_ids(tasks: Vec<TaskRecord>, markers: Vec<FlipMarker>) -> BatchRecovery {
    let mut out = BatchRecovery::default();

    for partition in partition_by_stream(tasks, markers) {
        let outcome = partition.recover();
        match outcome.result {
            Ok(stats) => out.recalibrated += stats.recalibrated,
            Err(e) => {
                tracing::warn!(
                    device_id = outcome.key.device_id,
                    stream_id = outcome.key.stream_id,
                    error = %e,
                    "skipping batch id recovery for stream",
                );
                out.failed_streams.push(outcome.key);
            }
        }
        out.tasks.extend(outcome.tasks);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::event::compose_task_id;

    fn task(stream_id: u16, low: u16, timestamp: u64) -> TaskRecord {
        TaskRecord {
            device_id: 0,
            stream_id,
            task_type: 0,
            task_id: u32::from(low),
            timestamp,
        }
    }

    fn marker(stream_id: u16, task_id: u16, timestamp: u64) -> FlipMarker {
        FlipMarker {
            device_id: 0,
            stream_id,
            flip_num: 1,
            task_id,
            timestamp,
        }
    }

    fn batches(tasks: &[TaskRecord]) -> Vec<u16> {
        tasks.iter().map(TaskRecord::batch_id).collect()
    }

    #[test]
    fn test_empty_task_list_is_noop() {
        let mut tasks = Vec::new();
        let stats = recover_stream(&mut tasks, vec![marker(1, 0, 5)]).expect("recovers");
        assert_eq!(stats, StreamStats::default());
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_no_markers_all_batch_zero() {
        let mut tasks = vec![task(1, 3, 30), task(1, 1, 10), task(1, 2, 20)];
        // Stale high bits from the producer are overwritten.
        tasks[0].task_id = compose_task_id(3, 9);

        let stats = recover_stream(&mut tasks, Vec::new()).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 0, 0]);
        assert_eq!(
            tasks.iter().map(TaskRecord::task_id_low16).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(stats.flips, 0);
    }

    #[test]
    fn test_wrap_without_skew() {
        // Ids 5,6,7 then wrap to 0,1; the marker lands after id 7.
        let mut tasks = vec![
            task(1, 5, 10),
            task(1, 6, 20),
            task(1, 7, 30),
            task(1, 0, 40),
            task(1, 1, 50),
        ];
        let stats = recover_stream(&mut tasks, vec![marker(1, 0, 35)]).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 0, 0, 1, 1]);
        assert_eq!(stats.recalibrated, 0);
        assert_eq!(stats.flips, 1);
    }

    #[test]
    fn test_backward_calibration_moves_early_ids() {
        // Ids 0 and 1 of the new batch were stamped before the marker (id 2).
        let mut tasks = vec![
            task(1, 65534, 10),
            task(1, 65535, 20),
            task(1, 0, 30),
            task(1, 1, 40),
            task(1, 2, 60),
            task(1, 3, 70),
        ];
        let stats = recover_stream(&mut tasks, vec![marker(1, 2, 50)]).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 0, 1, 1, 1, 1]);
        assert_eq!(stats.recalibrated, 2);
    }

    #[test]
    fn test_backward_calibration_stops_at_stream_start() {
        // The very first tasks need recalibration; the scan must stop at index 0.
        let mut tasks = vec![task(1, 0, 10), task(1, 1, 20), task(1, 5, 40)];
        let stats = recover_stream(&mut tasks, vec![marker(1, 5, 30)]).expect("recovers");
        assert_eq!(batches(&tasks), vec![1, 1, 1]);
        assert_eq!(stats.recalibrated, 2);
    }

    #[test]
    fn test_stream_destroy_marker_skips_backward_pass() {
        let mut tasks = vec![task(1, 0, 10), task(1, 1, 20), task(1, 2, 40)];
        let destroy = FlipMarker {
            flip_num: STREAM_DESTROY,
            ..marker(1, 9, 30)
        };
        let stats = recover_stream(&mut tasks, vec![destroy]).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 0, 1]);
        assert_eq!(stats.recalibrated, 0);
    }

    #[test]
    fn test_multiple_flips_and_unsorted_input() {
        let mut tasks = vec![
            task(1, 0, 50),
            task(1, 65535, 30),
            task(1, 0, 90),
            task(1, 65535, 70),
            task(1, 65534, 10),
        ];
        let markers = vec![marker(1, 0, 80), marker(1, 0, 40)];
        let stats = recover_stream(&mut tasks, markers).expect("recovers");
        assert_eq!(
            tasks.iter().map(|t| t.timestamp).collect::<Vec<_>>(),
            vec![10, 30, 50, 70, 90]
        );
        assert_eq!(batches(&tasks), vec![0, 0, 1, 1, 2]);
        assert_eq!(stats.flips, 2);
    }

    #[test]
    fn test_consecutive_markers_without_tasks_between() {
        let mut tasks = vec![task(1, 10, 10), task(1, 11, 100)];
        let markers = vec![marker(1, 0, 20), marker(1, 0, 30), marker(1, 0, 40)];
        recover_stream(&mut tasks, markers).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 3]);
    }

    #[test]
    fn test_equal_timestamps_keep_producer_order() {
        let mut tasks = vec![task(1, 7, 10), task(1, 8, 10), task(1, 9, 10)];
        recover_stream(&mut tasks, Vec::new()).expect("recovers");
        assert_eq!(
            tasks.iter().map(TaskRecord::task_id_low16).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );
    }

    #[test]
    fn test_task_at_marker_timestamp_stays_in_old_batch() {
        let mut tasks = vec![task(1, 9, 30), task(1, 0, 31)];
        recover_stream(&mut tasks, vec![marker(1, 0, 30)]).expect("recovers");
        assert_eq!(batches(&tasks), vec![0, 1]);
    }

    #[test]
    fn test_streams_recovered_independently() {
        let tasks = vec![
            task(1, 7, 10),
            task(2, 3, 15),
            task(1, 0, 30),
            task(2, 4, 35),
        ];
        let markers = vec![marker(1, 0, 20), marker(3, 0, 1)];
        let out = recover_batch_ids(tasks, markers);

        assert!(out.failed_streams.is_empty());
        let stream1: Vec<u16> = out
            .tasks
            .iter()
            .filter(|t| t.stream_id == 1)
            .map(TaskRecord::batch_id)
            .collect();
        let stream2: Vec<u16> = out
            .tasks
            .iter()
            .filter(|t| t.stream_id == 2)
            .map(TaskRecord::batch_id)
            .collect();
        assert_eq!(stream1, vec![0, 1]);
        assert_eq!(stream2, vec![0, 0]);
    }

    #[test]
    fn test_partition_by_stream_orders_keys() {
        let tasks = vec![task(5, 0, 1), task(2, 0, 1), task(5, 1, 2)];
        let parts = partition_by_stream(tasks, vec![marker(5, 0, 1), marker(9, 0, 1)]);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].key.stream_id, 2);
        assert_eq!(parts[1].key.stream_id, 5);
        assert_eq!(parts[1].tasks.len(), 2);
        assert_eq!(parts[1].markers.len(), 1);
    }
}
