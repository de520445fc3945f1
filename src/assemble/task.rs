use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::clock::HpTime;
use crate::process::DeviceTask;
use crate::tree::{AnalyzedNode, AnalyzedTree, NodeKind};

use super::host::host_pid;
use super::trace::{format_pid, process_metadata, thread_metadata, Args, TraceEvent, NPU_SORT_INDEX};
use super::{AssembleError, Assembled};

const FLOW_NAME: &str = "HostToDevice";
const FLOW_CAT: &str = "HostToDevice";

/// A host dispatch matched to the device task it launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLink {
    /// Connection id of the host task node, shared by both flow ends.
    pub connection_id: u64,
    pub host_thread_id: u32,
    pub host_start: HpTime,
    pub device_task: DeviceTask,
}

/// Links analysed host tasks to device tasks on the same (device, stream,
/// local id). Host tasks of one key are taken in start order and each claims
/// the earliest unclaimed device task that starts no earlier than it, so a
/// recycled local id reaches the task of its own batch. Host tasks left
/// without such a device task stay unlinked. Links come back in connection id
/// order.
pub fn link_host_tasks(trees: &[AnalyzedTree], tasks: &[DeviceTask]) -> Vec<TaskLink> {
    type Key = (u16, u16, u16);

    let mut candidates: HashMap<Key, Vec<&DeviceTask>> = HashMap::new();
    for task in tasks {
        candidates
            .entry((task.device_id, task.stream_id, task.task_id_low16()))
            .or_default()
            .push(task);
    }

    let mut launches: HashMap<Key, Vec<&AnalyzedNode>> = HashMap::new();
    for node in trees.iter().flat_map(|t| &t.nodes) {
        if let NodeKind::HostTask {
            device_id,
            stream_id,
            task_id,
            ..
        } = node.kind
        {
            launches
                .entry((device_id, stream_id, task_id))
                .or_default()
                .push(node);
        }
    }

    let mut links = Vec::new();
    for (key, mut hosts) in launches {
        let Some(device_tasks) = candidates.get_mut(&key) else {
            continue;
        };
        device_tasks.sort_by_key(|t| t.timestamp);
        hosts.sort_by_key(|n| (n.start, n.connection_id));

        let mut cursor = 0;
        for node in hosts {
            while device_tasks
                .get(cursor)
                .is_some_and(|t| t.timestamp < node.start)
            {
                cursor += 1;
            }
            let Some(task) = device_tasks.get(cursor) else {
                break;
            };
            links.push(TaskLink {
                connection_id: node.connection_id,
                host_thread_id: node.thread_id,
                host_start: node.start,
                device_task: **task,
            });
            cursor += 1;
        }
    }
    links.sort_by_key(|l| l.connection_id);
    links
}

/// Puts device tasks on one "NPU <id>" process per device with a thread per
/// stream, and draws host-to-device flows for linked tasks.
#[derive(Debug, Clone)]
pub struct DeviceTaskAssembler {
    session_pid: u32,
}

impl DeviceTaskAssembler {
    pub const DOMAIN: &'static str = "task";

    pub fn new(session_pid: u32) -> Self {
        Self { session_pid }
    }

    fn device_pid(&self, device_id: u16) -> u64 {
        format_pid(self.session_pid, NPU_SORT_INDEX, u32::from(device_id))
    }

    /// Emits per device the process and stream metadata and a zero-duration
    /// span per task, followed by a flow start/end pair per link.
    pub fn assemble(
        &self,
        tasks: &[DeviceTask],
        links: &[TaskLink],
    ) -> Result<Assembled, AssembleError> {
        if tasks.is_empty() {
            return Ok(Assembled::NoData);
        }

        let mut streams: BTreeMap<u16, BTreeSet<u16>> = BTreeMap::new();
        for task in tasks {
            streams
                .entry(task.device_id)
                .or_default()
                .insert(task.stream_id);
        }

        let mut events = Vec::with_capacity(tasks.len() + 2 * links.len());
        for (&device_id, device_streams) in &streams {
            let pid = self.device_pid(device_id);
            events.extend(process_metadata(
                pid,
                &format!("NPU {device_id}"),
                "NPU",
                NPU_SORT_INDEX,
            ));
            for &stream_id in device_streams {
                events.extend(thread_metadata(
                    pid,
                    u64::from(stream_id),
                    &format!("Stream {stream_id}"),
                    u32::from(stream_id),
                ));
            }
        }

        let mut spans = 0usize;
        for task in tasks {
            let mut args = Args::new();
            args.insert("task_id", task.task_id_low16().into());
            args.insert("batch_id", task.batch_id().into());
            args.insert("task_type", task.task_type.into());
            events.push(
                TraceEvent::complete(
                    format!("Task {}", task.task_type),
                    self.device_pid(task.device_id),
                    u64::from(task.stream_id),
                    task.timestamp,
                    task.timestamp,
                    args,
                )
                .with_cat("device_task"),
            );
            spans += 1;
        }

        let host = host_pid(self.session_pid);
        for link in links {
            let task = &link.device_task;
            events.push(TraceEvent::flow_start(
                FLOW_NAME,
                FLOW_CAT,
                link.connection_id,
                host,
                u64::from(link.host_thread_id),
                link.host_start,
            ));
            events.push(TraceEvent::flow_end(
                FLOW_NAME,
                FLOW_CAT,
                link.connection_id,
                self.device_pid(task.device_id),
                u64::from(task.stream_id),
                task.timestamp,
            ));
        }

        if spans == 0 {
            return Err(AssembleError::AssembleFailed {
                domain: Self::DOMAIN,
                input: tasks.len(),
            });
        }
        Ok(Assembled::Events(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::Phase;
    use crate::record::event::compose_task_id;
    use crate::tree::QualityReport;

    fn device_task(stream_id: u16, low: u16, batch: u16, ts: u64) -> DeviceTask {
        DeviceTask {
            device_id: 0,
            stream_id,
            task_type: 1,
            task_id: compose_task_id(low, batch),
            timestamp: HpTime::from_nanos(ts),
        }
    }

    fn host_tree(tasks: &[(u64, u16, u16, u64)]) -> AnalyzedTree {
        AnalyzedTree {
            thread_id: 5,
            nodes: tasks
                .iter()
                .map(|&(id, stream_id, task_id, start)| AnalyzedNode {
                    connection_id: id,
                    parent_connection_id: None,
                    thread_id: 5,
                    start: HpTime::from_nanos(start),
                    end: HpTime::from_nanos(start + 10),
                    depth: 0,
                    kind: NodeKind::HostTask {
                        name: "launch".into(),
                        device_id: 0,
                        stream_id,
                        task_id,
                    },
                })
                .collect(),
            quality: QualityReport::default(),
        }
    }

    #[test]
    fn test_link_picks_first_task_after_host_start() {
        // Local id 7 recycled across two batches.
        let tasks = [
            device_task(2, 7, 0, 100),
            device_task(2, 7, 1, 900),
            device_task(3, 7, 0, 150),
        ];
        let tree = host_tree(&[(10, 2, 7, 50), (11, 2, 7, 500), (12, 2, 7, 1_000), (13, 4, 1, 0)]);

        let links = link_host_tasks(&[tree], &tasks);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].connection_id, 10);
        assert_eq!(links[0].device_task.batch_id(), 0);
        assert_eq!(links[1].connection_id, 11);
        assert_eq!(links[1].device_task.batch_id(), 1);
        assert_eq!(links[1].host_thread_id, 5);
    }

    #[test]
    fn test_link_consumes_each_device_task_once() {
        // Both launches precede the first device task of their local id.
        let tasks = [device_task(2, 7, 1, 900), device_task(2, 7, 0, 100)];
        let tree = host_tree(&[(2, 2, 7, 60), (1, 2, 7, 50)]);

        let links = link_host_tasks(&[tree], &tasks);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].connection_id, 1);
        assert_eq!(links[0].device_task.batch_id(), 0);
        assert_eq!(links[1].connection_id, 2);
        assert_eq!(links[1].device_task.batch_id(), 1);
        assert_eq!(links[1].host_start, HpTime::from_nanos(60));
    }

    #[test]
    fn test_assemble_tasks_and_flows() {
        let tasks = [device_task(2, 7, 0, 100), device_task(3, 8, 0, 200)];
        let links = link_host_tasks(&[host_tree(&[(4, 3, 8, 150)])], &tasks);
        let events = DeviceTaskAssembler::new(1234)
            .assemble(&tasks, &links)
            .expect("assemble")
            .into_events();

        // 3 process + 2x2 thread metadata, 2 spans, 1 flow pair.
        assert_eq!(events.len(), 11);
        let spans: Vec<&TraceEvent> = events.iter().filter(|e| e.ph == Phase::Complete).collect();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].dur.as_deref(), Some("0.000"));

        let start = &events[9];
        let end = &events[10];
        assert_eq!(start.ph, Phase::FlowStart);
        assert_eq!(start.pid, host_pid(1234));
        assert_eq!(start.tid, 5);
        assert_eq!(end.ph, Phase::FlowEnd);
        assert_eq!(end.tid, 3);
        assert_eq!(end.bp, Some("e"));
        assert_eq!(start.id, end.id);
        assert_eq!(end.ts.as_deref(), Some("0.200"));
    }

    #[test]
    fn test_empty_is_no_data() {
        let asm = DeviceTaskAssembler::new(1);
        assert_eq!(asm.assemble(&[], &[]), Ok(Assembled::NoData));
    }
}
