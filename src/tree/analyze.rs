use crate::clock::HpTime;
use crate::context::NameTable;
use crate::record::EventLevel;

use super::{DataQuality, EventTree, HostEvent, QualityReport, TreeError};

/// Classification of one tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Runtime dispatch of a task onto a device stream.
    HostTask {
        name: String,
        device_id: u16,
        stream_id: u16,
        task_id: u16,
    },
    ComputeOp {
        name: String,
    },
    CollectiveOp {
        name: String,
    },
    /// Model execution step.
    StepBoundary {
        name: String,
    },
    /// Unrecognised level or unresolved name.
    Unknown {
        level: u16,
        item_id: u64,
    },
}

impl NodeKind {
    /// Classifies an event by level. The name hash must resolve for any known
    /// kind.
    pub fn classify(event: &HostEvent, names: &NameTable) -> Self {
        let unknown = Self::Unknown {
            level: event.level,
            item_id: event.item_id,
        };
        let (Some(level), Some(name)) = (
            EventLevel::from_u16(event.level),
            names.get(event.item_id),
        ) else {
            return unknown;
        };
        let name = name.to_string();

        match level {
            EventLevel::Model => Self::StepBoundary { name },
            EventLevel::Node => Self::ComputeOp { name },
            EventLevel::Hccl => Self::CollectiveOp { name },
            EventLevel::Runtime => Self::HostTask {
                name,
                device_id: event.device_id,
                stream_id: event.stream_id,
                task_id: event.task_id,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostTask { .. } => "host_task",
            Self::ComputeOp { .. } => "compute_op",
            Self::CollectiveOp { .. } => "collective_op",
            Self::StepBoundary { .. } => "step",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Display name, `None` for unknown nodes.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::HostTask { name, .. }
            | Self::ComputeOp { name }
            | Self::CollectiveOp { name }
            | Self::StepBoundary { name } => Some(name),
            Self::Unknown { .. } => None,
        }
    }
}

/// A classified node with its links expressed as connection ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedNode {
    pub connection_id: u64,
    /// `None` for top-level nodes.
    pub parent_connection_id: Option<u64>,
    pub thread_id: u32,
    pub start: HpTime,
    pub end: HpTime,
    pub depth: u32,
    pub kind: NodeKind,
}

/// Flattened result of analysing one thread's tree, in pre-order.
#[derive(Debug, Clone, Default)]
pub struct AnalyzedTree {
    pub thread_id: u32,
    pub nodes: Vec<AnalyzedNode>,
    /// Build warnings of the tree plus classification warnings.
    pub quality: QualityReport,
}

impl AnalyzedTree {
    pub fn unknown_count(&self) -> usize {
        self.quality.count(DataQuality::UnknownClassification)
    }

    pub fn host_tasks(&self) -> impl Iterator<Item = &AnalyzedNode> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::HostTask { .. }))
    }
}

/// Walks `tree` in pre-order and classifies every node. Connection ids are
/// `base`, `base + 1`, ... in visit order, so a parent's id is always assigned
/// before its children reference it.
pub fn analyze_tree(
    tree: &EventTree,
    names: &NameTable,
    base: u64,
) -> Result<AnalyzedTree, TreeError> {
    let count = tree.event_count();
    let mut nodes = Vec::new();
    let mut ids: Vec<Option<u64>> = Vec::new();
    nodes
        .try_reserve_exact(count)
        .and_then(|_| ids.try_reserve_exact(count + 1))
        .map_err(|source| TreeError::Allocation {
            thread_id: tree.thread_id(),
            what: "analysis rows",
            count,
            source,
        })?;
    ids.resize(count + 1, None);

    let mut quality = *tree.quality();
    let mut next_id = base;

    for (id, node) in tree.pre_order() {
        let Some(event) = node.event else {
            continue;
        };

        let kind = NodeKind::classify(&event, names);
        if let NodeKind::Unknown { level, item_id } = kind {
            tracing::debug!(
                thread_id = tree.thread_id(),
                level,
                item_id,
                "unclassified node",
            );
            quality.record(DataQuality::UnknownClassification);
        }

        let connection_id = next_id;
        next_id += 1;
        if let Some(slot) = ids.get_mut(id.index()) {
            *slot = Some(connection_id);
        }
        let parent_connection_id = node
            .parent
            .and_then(|p| ids.get(p.index()).copied().flatten());

        nodes.push(AnalyzedNode {
            connection_id,
            parent_connection_id,
            thread_id: tree.thread_id(),
            start: node.start,
            end: node.end,
            depth: node.depth,
            kind,
        });
    }

    Ok(AnalyzedTree {
        thread_id: tree.thread_id(),
        nodes,
        quality,
    })
}

/// Prefix sums of per-tree node counts: the first connection id of each tree
/// when ids are numbered globally across trees in the given order.
pub fn connection_bases(counts: &[usize]) -> Vec<u64> {
    let mut next = 0u64;
    counts
        .iter()
        .map(|c| {
            let base = next;
            next += *c as u64;
            base
        })
        .collect()
}
