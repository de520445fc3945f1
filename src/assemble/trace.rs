//! Trace event model shared by all assemblers.
//!
//! Events follow the Chrome trace event layout. Timestamps and durations are
//! microsecond strings with nanosecond decimals so no precision is lost in the
//! JSON float path.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::clock::{micros_string, HpTime};

/// Sort index of the host process group.
pub const HOST_SORT_INDEX: u32 = 4;
/// Sort index of the per-device task process groups.
pub const NPU_SORT_INDEX: u32 = 12;
/// Sort index of the PCIe counter process groups.
pub const PCIE_SORT_INDEX: u32 = 16;

const SORT_INDEX_BITS: u32 = 10;
const DEVICE_BITS: u32 = 5;

/// Event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[serde(rename = "X")]
    Complete,
    #[serde(rename = "C")]
    Counter,
    #[serde(rename = "M")]
    Metadata,
    #[serde(rename = "s")]
    FlowStart,
    #[serde(rename = "f")]
    FlowEnd,
}

/// A value inside `args`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(u64),
    Float(f64),
    Text(String),
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        Self::Int(u64::from(v))
    }
}

impl From<u16> for ArgValue {
    fn from(v: u16) -> Self {
        Self::Int(u64::from(v))
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Event arguments. Keys serialize in sorted order.
pub type Args = BTreeMap<&'static str, ArgValue>;

/// One self-contained trace object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub name: String,
    pub pid: u64,
    pub tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<String>,
    pub ph: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bp: Option<&'static str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: Args,
}

impl TraceEvent {
    fn base(name: impl Into<String>, pid: u64, tid: u64, ph: Phase) -> Self {
        Self {
            name: name.into(),
            pid,
            tid,
            ts: None,
            dur: None,
            ph,
            cat: None,
            id: None,
            bp: None,
            args: Args::new(),
        }
    }

    /// Metadata record carrying a single argument.
    pub fn metadata(
        name: &str,
        pid: u64,
        tid: u64,
        key: &'static str,
        value: impl Into<ArgValue>,
    ) -> Self {
        let mut event = Self::base(name, pid, tid, Phase::Metadata);
        event.args.insert(key, value.into());
        event
    }

    /// Counter sample.
    pub fn counter(name: impl Into<String>, pid: u64, tid: u64, ts: HpTime, args: Args) -> Self {
        let mut event = Self::base(name, pid, tid, Phase::Counter);
        event.ts = Some(ts.to_micros_string());
        event.args = args;
        event
    }

    /// Complete span from `start` to `end`.
    pub fn complete(
        name: impl Into<String>,
        pid: u64,
        tid: u64,
        start: HpTime,
        end: HpTime,
        args: Args,
    ) -> Self {
        let mut event = Self::base(name, pid, tid, Phase::Complete);
        event.ts = Some(start.to_micros_string());
        event.dur = Some(micros_string(start.nanos_until(end)));
        event.args = args;
        event
    }

    /// Flow arrow origin.
    pub fn flow_start(name: &str, cat: &str, id: u64, pid: u64, tid: u64, ts: HpTime) -> Self {
        let mut event = Self::base(name, pid, tid, Phase::FlowStart);
        event.ts = Some(ts.to_micros_string());
        event.cat = Some(cat.to_string());
        event.id = Some(id);
        event
    }

    /// Flow arrow target, bound to the enclosing slice.
    pub fn flow_end(name: &str, cat: &str, id: u64, pid: u64, tid: u64, ts: HpTime) -> Self {
        let mut event = Self::base(name, pid, tid, Phase::FlowEnd);
        event.ts = Some(ts.to_micros_string());
        event.cat = Some(cat.to_string());
        event.id = Some(id);
        event.bp = Some("e");
        event
    }

    pub fn with_cat(mut self, cat: &str) -> Self {
        self.cat = Some(cat.to_string());
        self
    }
}

/// Deterministic process id of one track group:
/// `((session_pid << 10 | sort_index) << 5) | device_id`.
///
/// Device ids wider than five bits are masked.
pub fn format_pid(session_pid: u32, sort_index: u32, device_id: u32) -> u64 {
    let mask = (1u64 << DEVICE_BITS) - 1;
    let index_mask = (1u64 << SORT_INDEX_BITS) - 1;
    (((u64::from(session_pid) << SORT_INDEX_BITS) | (u64::from(sort_index) & index_mask))
        << DEVICE_BITS)
        | (u64::from(device_id) & mask)
}

/// `process_name`, `process_labels` and `process_sort_index` records for one
/// process, in that order.
pub fn process_metadata(pid: u64, name: &str, labels: &str, sort_index: u32) -> [TraceEvent; 3] {
    [
        TraceEvent::metadata("process_name", pid, 0, "name", name),
        TraceEvent::metadata("process_labels", pid, 0, "labels", labels),
        TraceEvent::metadata("process_sort_index", pid, 0, "sort_index", sort_index),
    ]
}

/// `thread_name` and `thread_sort_index` records for one thread.
pub fn thread_metadata(pid: u64, tid: u64, name: &str, sort_index: u32) -> [TraceEvent; 2] {
    [
        TraceEvent::metadata("thread_name", pid, tid, "name", name),
        TraceEvent::metadata("thread_sort_index", pid, tid, "sort_index", sort_index),
    ]
}
