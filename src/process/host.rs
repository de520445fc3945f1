use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{ClockAligner, ClockDomain, HOST_DEVICE_ID};
use crate::pipeline::pool::PoolError;
use crate::record::ApiEventRecord;
use crate::source::{DataSource, FileStore};
use crate::tree::HostEvent;

use super::{read_kind, DataInventory, DomainReport, PartitionError, ProcessEnv};

/// Aligned events of one worker thread, in read order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadEvents {
    pub thread_id: u32,
    pub events: Vec<HostEvent>,
}

/// Host events partitioned by thread, ascending thread id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEvents {
    pub threads: Vec<ThreadEvents>,
}

impl HostEvents {
    /// Aligns every record and groups the result by thread.
    pub fn from_records(records: &[ApiEventRecord], aligner: &ClockAligner) -> Self {
        let mut by_thread: BTreeMap<u32, Vec<HostEvent>> = BTreeMap::new();
        for r in records {
            by_thread.entry(r.thread_id).or_default().push(HostEvent {
                thread_id: r.thread_id,
                level: r.level,
                start: aligner.align(r.begin),
                end: r.end.map(|end| aligner.align(end)),
                item_id: r.item_id,
                device_id: r.device_id,
                stream_id: r.stream_id,
                task_id: r.task_id,
            });
        }

        Self {
            threads: by_thread
                .into_iter()
                .map(|(thread_id, events)| ThreadEvents { thread_id, events })
                .collect(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.threads.iter().map(|t| t.events.len()).sum()
    }
}

/// Reads and aligns host API events.
pub struct HostProcessor;

impl HostProcessor {
    pub const DOMAIN: &'static str = "host";

    /// Host data is a single partition read on the pool; tree building is
    /// left to the pipeline. Injects [`HostEvents`].
    pub async fn run<F: FileStore + 'static>(
        env: &ProcessEnv<F>,
        inventory: &mut DataInventory,
    ) -> DomainReport {
        let mut report = DomainReport::new(Self::DOMAIN);
        report.partitions = 1;

        let ctx = Arc::clone(&env.ctx);
        let files = Arc::clone(&env.files);
        let read = env
            .pool
            .run_all(
                vec![DataSource::Host],
                move |source: DataSource| -> Result<HostEvents, PartitionError> {
                    let records = read_kind::<ApiEventRecord, F>(&ctx, &files, source)?;
                    if records.is_empty() {
                        return Ok(HostEvents::default());
                    }
                    let aligner = ctx
                        .calibration
                        .aligner(HOST_DEVICE_ID, ClockDomain::HostMonotonic)?;
                    Ok(HostEvents::from_records(&records, &aligner))
                },
            )
            .await;

        let result = read
            .into_iter()
            .next()
            .unwrap_or(Err(PoolError::Closed))
            .map_err(PartitionError::from)
            .and_then(|r| r);
        let events = match result {
            Ok(events) => events,
            Err(e) => {
                report.partition_failed(&env.ctx, "host", &e);
                HostEvents::default()
            }
        };

        report.records = events.event_count();
        tracing::info!(
            threads = events.threads.len(),
            events = report.records,
            "host processing complete",
        );
        inventory.inject(events);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{CalibrationRecord, HpTime};

    fn record(thread_id: u32, begin: u64, end: Option<u64>) -> ApiEventRecord {
        ApiEventRecord {
            level: 5000,
            thread_id,
            begin,
            end,
            item_id: 1,
            device_id: 0,
            stream_id: 2,
            task_id: 3,
        }
    }

    #[test]
    fn test_partitions_by_thread() {
        let calib = CalibrationRecord::new(HOST_DEVICE_ID, 1_000, 0, 50_000, 1.0).expect("calib");
        let aligner = ClockAligner::new(calib, ClockDomain::HostMonotonic);
        let records = [
            record(7, 1_100, Some(1_300)),
            record(3, 1_200, None),
            record(7, 1_150, Some(1_200)),
        ];

        let host = HostEvents::from_records(&records, &aligner);
        assert_eq!(host.event_count(), 3);
        let ids: Vec<u32> = host.threads.iter().map(|t| t.thread_id).collect();
        assert_eq!(ids, vec![3, 7]);

        let t7 = &host.threads[1].events;
        assert_eq!(t7[0].start, HpTime::from_nanos(50_100));
        assert_eq!(t7[0].end, Some(HpTime::from_nanos(50_300)));
        assert_eq!(t7[1].start, HpTime::from_nanos(50_150));
        assert_eq!(host.threads[0].events[0].end, None);
    }
}
