//! Per-thread call trees rebuilt from flat host API events.
//!
//! [`build_tree`] nests one thread's aligned events into an [`EventTree`]; the
//! [`analyze`] pass walks it once and flattens it into classified rows linked by
//! connection ids.

pub mod analyze;
pub mod build;

use std::collections::TryReserveError;

use thiserror::Error;

use crate::clock::HpTime;

pub use analyze::{analyze_tree, connection_bases, AnalyzedNode, AnalyzedTree, NodeKind};
pub use build::{build_tree, EventTreeBuilder};

/// Errors that abort building or analysing one thread's tree.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("thread {thread_id}: allocating {what} for {count} events: {source}")]
    Allocation {
        thread_id: u32,
        what: &'static str,
        count: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Non-fatal data-quality conditions found while building or analysing trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataQuality {
    /// A child ended after its parent and was clipped to the parent's end.
    ContainmentClipped = 0,
    /// An event without a recorded end was closed with a fallback end.
    UnknownEnd = 1,
    /// A node could not be classified and was emitted as unknown.
    UnknownClassification = 2,
}

const DATA_QUALITY_COUNT: usize = 3;

impl DataQuality {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContainmentClipped => "containment_clipped",
            Self::UnknownEnd => "unknown_end",
            Self::UnknownClassification => "unknown_classification",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::ContainmentClipped,
            Self::UnknownEnd,
            Self::UnknownClassification,
        ]
    }
}

/// Counts of [`DataQuality`] conditions for one or more trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityReport {
    counts: [usize; DATA_QUALITY_COUNT],
}

impl QualityReport {
    pub fn record(&mut self, kind: DataQuality) {
        if let Some(c) = self.counts.get_mut(kind as usize) {
            *c += 1;
        }
    }

    pub fn count(&self, kind: DataQuality) -> usize {
        self.counts.get(kind as usize).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn merge(&mut self, other: &QualityReport) {
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += *b;
        }
    }
}

/// One host API event after clock alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEvent {
    pub thread_id: u32,
    /// Raw event level, classified during analysis.
    pub level: u16,
    pub start: HpTime,
    pub end: Option<HpTime>,
    /// Name hash.
    pub item_id: u64,
    pub device_id: u16,
    pub stream_id: u16,
    pub task_id: u16,
}

/// Index of a node inside its [`EventTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A span in the tree. Links are arena indices; the tree owns every node.
#[derive(Debug, Clone)]
pub struct Node {
    /// `None` only for the synthetic root.
    pub event: Option<HostEvent>,
    pub start: HpTime,
    /// Resolved end, always within the parent's interval.
    pub end: HpTime,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Zero for top-level events.
    pub depth: u32,
}

/// Call tree of one worker thread. `nodes[0]` is a synthetic root spanning
/// every top-level event.
#[derive(Debug, Clone)]
pub struct EventTree {
    thread_id: u32,
    nodes: Vec<Node>,
    quality: QualityReport,
}

impl EventTree {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Number of real events in the tree, excluding the root.
    pub fn event_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    pub fn quality(&self) -> &QualityReport {
        &self.quality
    }

    pub fn max_depth(&self) -> u32 {
        self.nodes.iter().skip(1).map(|n| n.depth).max().unwrap_or(0)
    }

    /// Depth-first pre-order walk over every event node, excluding the root.
    /// Children are visited in start order.
    pub fn pre_order(&self) -> PreOrder<'_> {
        let mut stack = Vec::with_capacity(16);
        stack.extend(self.children(NodeId::ROOT).iter().rev().copied());
        PreOrder { tree: self, stack }
    }
}

/// Iterator returned by [`EventTree::pre_order`].
pub struct PreOrder<'a> {
    tree: &'a EventTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = (NodeId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.stack.pop()?;
            if let Some(node) = self.tree.node(id) {
                self.stack.extend(node.children.iter().rev().copied());
                return Some((id, node));
            }
        }
    }
}
