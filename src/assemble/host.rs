use crate::tree::{AnalyzedNode, AnalyzedTree, NodeKind};

use super::trace::{
    format_pid, process_metadata, thread_metadata, Args, TraceEvent, HOST_SORT_INDEX,
};
use super::{AssembleError, Assembled};

/// Process id of the host track group.
pub fn host_pid(session_pid: u32) -> u64 {
    format_pid(session_pid, HOST_SORT_INDEX, 0)
}

/// Turns analysed call trees into nested complete spans, one trace thread
/// per worker thread.
#[derive(Debug, Clone)]
pub struct HostTraceAssembler {
    session_pid: u32,
}

impl HostTraceAssembler {
    pub const DOMAIN: &'static str = "host";

    pub fn new(session_pid: u32) -> Self {
        Self { session_pid }
    }

    /// Emits the host process metadata, then per tree the thread metadata and
    /// one span per node in pre-order. Trees are expected in thread id order.
    pub fn assemble(&self, trees: &[AnalyzedTree]) -> Result<Assembled, AssembleError> {
        let input: usize = trees.iter().map(|t| t.nodes.len()).sum();
        if input == 0 {
            return Ok(Assembled::NoData);
        }

        let pid = host_pid(self.session_pid);
        let mut events = Vec::with_capacity(input + 3 + 2 * trees.len());
        events.extend(process_metadata(pid, "Host", "CPU", HOST_SORT_INDEX));

        let mut spans = 0usize;
        for (sort_index, tree) in trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                continue;
            }
            let tid = u64::from(tree.thread_id);
            events.extend(thread_metadata(
                pid,
                tid,
                &format!("Thread {}", tree.thread_id),
                u32::try_from(sort_index).unwrap_or(u32::MAX),
            ));

            for node in &tree.nodes {
                events.push(span(pid, tid, node));
                spans += 1;
            }
        }

        if spans == 0 {
            return Err(AssembleError::AssembleFailed {
                domain: Self::DOMAIN,
                input,
            });
        }
        Ok(Assembled::Events(events))
    }
}

fn span(pid: u64, tid: u64, node: &AnalyzedNode) -> TraceEvent {
    let mut args = Args::new();
    args.insert("connection_id", node.connection_id.into());
    if let Some(parent) = node.parent_connection_id {
        args.insert("parent_connection_id", parent.into());
    }

    let name = match &node.kind {
        NodeKind::HostTask {
            name,
            device_id,
            stream_id,
            task_id,
        } => {
            args.insert("device_id", (*device_id).into());
            args.insert("stream_id", (*stream_id).into());
            args.insert("task_id", (*task_id).into());
            name.clone()
        }
        NodeKind::ComputeOp { name }
        | NodeKind::CollectiveOp { name }
        | NodeKind::StepBoundary { name } => name.clone(),
        NodeKind::Unknown { level, item_id } => {
            args.insert("level", (*level).into());
            args.insert("item_id", (*item_id).into());
            "Unknown".to_string()
        }
    };

    TraceEvent::complete(name, pid, tid, node.start, node.end, args).with_cat(node.kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HpTime;
    use crate::tree::QualityReport;

    fn node(id: u64, parent: Option<u64>, start: u64, end: u64, kind: NodeKind) -> AnalyzedNode {
        AnalyzedNode {
            connection_id: id,
            parent_connection_id: parent,
            thread_id: 11,
            start: HpTime::from_nanos(start),
            end: HpTime::from_nanos(end),
            depth: u32::from(parent.is_some()),
            kind,
        }
    }

    #[test]
    fn test_empty_is_no_data() {
        let asm = HostTraceAssembler::new(1);
        assert_eq!(asm.assemble(&[]), Ok(Assembled::NoData));
        let empty = AnalyzedTree {
            thread_id: 3,
            nodes: Vec::new(),
            quality: QualityReport::default(),
        };
        assert_eq!(asm.assemble(&[empty]), Ok(Assembled::NoData));
    }

    #[test]
    fn test_spans_and_metadata() {
        let tree = AnalyzedTree {
            thread_id: 11,
            nodes: vec![
                node(
                    0,
                    None,
                    1_000,
                    9_000,
                    NodeKind::StepBoundary {
                        name: "step".into(),
                    },
                ),
                node(
                    1,
                    Some(0),
                    2_000,
                    2_500,
                    NodeKind::HostTask {
                        name: "launch".into(),
                        device_id: 0,
                        stream_id: 3,
                        task_id: 17,
                    },
                ),
            ],
            quality: QualityReport::default(),
        };

        let events = HostTraceAssembler::new(1234)
            .assemble(&[tree])
            .expect("assemble")
            .into_events();
        // 3 process + 2 thread metadata records, then the spans.
        assert_eq!(events.len(), 7);
        let pid = host_pid(1234);
        assert!(events.iter().all(|e| e.pid == pid));

        let task = serde_json::to_string(&events[6]).expect("serialize");
        assert_eq!(
            task,
            format!(
                concat!(
                    r#"{{"name":"launch","pid":{},"tid":11,"ts":"2.000","dur":"0.500","ph":"X","#,
                    r#""cat":"host_task","args":{{"connection_id":1,"device_id":0,"#,
                    r#""parent_connection_id":0,"stream_id":3,"task_id":17}}}}"#
                ),
                pid
            )
        );
    }
}
