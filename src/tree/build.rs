use crate::clock::HpTime;

use super::{DataQuality, EventTree, HostEvent, Node, NodeId, QualityReport, TreeError};

/// Interval-stack builder for one thread's events.
///
/// Every stack entry carries its containment bound: the node's own end, or the
/// nearest enclosing known end when its end is unknown. Bounds never grow going
/// up the stack, so checking the top is enough to decide what to close.
///
/// A top-level event without an end has no bound, so every later event on the
/// thread nests under it until the stream ends.
pub struct EventTreeBuilder {
    thread_id: u32,
    nodes: Vec<Node>,
    /// Latest end among each node's closed children.
    reach: Vec<HpTime>,
    stack: Vec<(NodeId, Option<HpTime>)>,
    quality: QualityReport,
}

impl EventTreeBuilder {
    pub fn new(thread_id: u32) -> Self {
        Self {
            thread_id,
            nodes: Vec::new(),
            reach: Vec::new(),
            stack: Vec::new(),
            quality: QualityReport::default(),
        }
    }

    /// Nests `events` into a tree. Input order does not matter; events are
    /// sorted by start, longer spans first on ties, unknown ends longest.
    pub fn build(mut self, mut events: Vec<HostEvent>) -> Result<EventTree, TreeError> {
        let count = events.len() + 1;
        self.nodes
            .try_reserve_exact(count)
            .and_then(|_| self.reach.try_reserve_exact(count))
            .map_err(|source| TreeError::Allocation {
                thread_id: self.thread_id,
                what: "tree nodes",
                count,
                source,
            })?;

        for e in events.iter_mut() {
            if matches!(e.end, Some(end) if end < e.start) {
                e.end = None;
            }
        }
        events.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| end_key(b.end).cmp(&end_key(a.end)))
        });

        let first_start = events.first().map(|e| e.start).unwrap_or(HpTime::ZERO);
        let stream_end = events
            .iter()
            .map(|e| e.end.unwrap_or(e.start))
            .max()
            .unwrap_or(first_start);

        self.nodes.push(Node {
            event: None,
            start: first_start,
            end: first_start,
            parent: None,
            children: Vec::new(),
            depth: 0,
        });
        self.reach.push(first_start);
        self.stack.push((NodeId::ROOT, None));

        for event in events {
            self.close_finished(event.start);
            self.open(event);
        }

        while self.stack.len() > 1 {
            if let Some((id, bound)) = self.stack.pop() {
                self.close(id, bound, Some(stream_end));
            }
        }

        if let (Some(root), Some(reach)) = (self.nodes.first_mut(), self.reach.first()) {
            root.end = *reach;
        }

        if self.quality.total() > 0 {
            tracing::debug!(
                thread_id = self.thread_id,
                clipped = self.quality.count(DataQuality::ContainmentClipped),
                unknown_end = self.quality.count(DataQuality::UnknownEnd),
                "tree built with data quality warnings",
            );
        }

        Ok(EventTree {
            thread_id: self.thread_id,
            nodes: self.nodes,
            quality: self.quality,
        })
    }

    /// Closes every open node whose bound is at or before `start`.
    fn close_finished(&mut self, start: HpTime) {
        while self.stack.len() > 1 {
            match self.stack.last().copied() {
                Some((id, Some(bound))) if bound <= start => {
                    self.stack.pop();
                    self.close(id, Some(bound), None);
                }
                _ => break,
            }
        }
    }

    fn open(&mut self, event: HostEvent) {
        let Some(&(parent, parent_bound)) = self.stack.last() else {
            return;
        };

        let mut end = event.end;
        if let (Some(e), Some(b)) = (end, parent_bound) {
            if e > b {
                tracing::debug!(
                    thread_id = self.thread_id,
                    start = %event.start,
                    end = %e,
                    parent_end = %b,
                    "child span ends after parent, clipping",
                );
                self.quality.record(DataQuality::ContainmentClipped);
                end = Some(b);
            }
        }
        let bound = end.or(parent_bound);

        let depth = match parent {
            NodeId::ROOT => 0,
            p => self.nodes.get(p.index()).map(|n| n.depth + 1).unwrap_or(0),
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            event: Some(event),
            start: event.start,
            end: end.unwrap_or(event.start),
            parent: Some(parent),
            children: Vec::new(),
            depth,
        });
        self.reach.push(event.start);
        if let Some(p) = self.nodes.get_mut(parent.index()) {
            p.children.push(id);
        }
        self.stack.push((id, bound));
    }

    /// Resolves the end of a node leaving the stack and propagates it to the
    /// parent's reach. Unknown ends use `fallback` when given, otherwise the
    /// latest end among the node's children.
    fn close(&mut self, id: NodeId, bound: Option<HpTime>, fallback: Option<HpTime>) {
        let reach = self.reach.get(id.index()).copied().unwrap_or(HpTime::ZERO);
        let Some(node) = self.nodes.get_mut(id.index()) else {
            return;
        };

        if node.event.is_some_and(|e| e.end.is_none()) {
            let mut end = fallback.unwrap_or(reach).max(reach).max(node.start);
            if let Some(b) = bound {
                end = end.min(b);
            }
            node.end = end;
            self.quality.record(DataQuality::UnknownEnd);
        }

        let end = node.end;
        if let Some(r) = node.parent.and_then(|p| self.reach.get_mut(p.index())) {
            *r = (*r).max(end);
        }
    }
}

/// Sort key for ends: unknown sorts as the longest span.
fn end_key(end: Option<HpTime>) -> u128 {
    end.map_or(u128::MAX, HpTime::as_picos)
}

/// Builds the call tree of one thread.
pub fn build_tree(thread_id: u32, events: Vec<HostEvent>) -> Result<EventTree, TreeError> {
    EventTreeBuilder::new(thread_id).build(events)
}
