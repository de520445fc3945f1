use std::fmt;

/// Magic prefix of every binary trace record.
pub const RECORD_MAGIC: u16 = 0x5A5A;

/// Number of low bits of a composite task id holding the recycling local id.
pub const TASK_ID_BITS: u32 = 16;

/// RecordKind identifies a binary record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Pcie = 0,
    TaskTrack = 1,
    Flip = 2,
    ApiEvent = 3,
}

/// Number of RecordKind variants, used for array sizing.
pub const RECORD_KIND_COUNT: usize = 4;

impl RecordKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pcie => "pcie",
            Self::TaskTrack => "task_track",
            Self::Flip => "flip",
            Self::ApiEvent => "api_event",
        }
    }

    /// File name prefix of this record kind inside a `data/` directory.
    pub const fn file_prefix(self) -> &'static str {
        match self {
            Self::Pcie => "pcie.data",
            Self::TaskTrack => "task_track.data",
            Self::Flip => "flip.data",
            Self::ApiEvent => "api_event.data",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Pcie),
            1 => Some(Self::TaskTrack),
            2 => Some(Self::Flip),
            3 => Some(Self::ApiEvent),
            _ => None,
        }
    }

    /// Return all record kinds in numeric order.
    pub fn all() -> &'static [Self] {
        &[Self::Pcie, Self::TaskTrack, Self::Flip, Self::ApiEvent]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host API event level. Values match the host sampling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventLevel {
    /// Model execution / training step.
    Model = 15000,
    /// Compute operator launch.
    Node = 10000,
    /// Collective communication operator.
    Hccl = 5500,
    /// Runtime task dispatch.
    Runtime = 5000,
}

impl EventLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Node => "node",
            Self::Hccl => "communication",
            Self::Runtime => "runtime",
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            15000 => Some(Self::Model),
            10000 => Some(Self::Node),
            5500 => Some(Self::Hccl),
            5000 => Some(Self::Runtime),
            _ => None,
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interval-aggregated counter triple as sampled by hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawBandwidth {
    pub min: u32,
    pub max: u32,
    pub avg: u32,
}

/// PCIe bandwidth sample. Bandwidth in bytes/µs, latency in ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieRecord {
    pub device_id: u16,
    /// Device cycle counter.
    pub timestamp: u64,
    pub tx_post: RawBandwidth,
    pub tx_nonpost: RawBandwidth,
    pub tx_cpl: RawBandwidth,
    pub tx_nonpost_latency: RawBandwidth,
    pub rx_post: RawBandwidth,
    pub rx_nonpost: RawBandwidth,
    pub rx_cpl: RawBandwidth,
}

/// Task dispatch record from one hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub device_id: u16,
    pub stream_id: u16,
    pub task_type: u16,
    /// Composite id: recycling local id in the low 16 bits, batch id above.
    pub task_id: u32,
    /// Device cycle counter.
    pub timestamp: u64,
}

impl TaskRecord {
    /// The recycling 16-bit local task id.
    pub fn task_id_low16(&self) -> u16 {
        task_id_low16(self.task_id)
    }

    /// The batch id currently packed in the high bits.
    pub fn batch_id(&self) -> u16 {
        batch_id(self.task_id)
    }

    /// Replaces the batch id, keeping the local id.
    pub fn set_batch_id(&mut self, batch: u16) {
        self.task_id = compose_task_id(self.task_id_low16(), batch);
    }
}

/// Marker emitted when a stream's 16-bit task id space wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipMarker {
    pub device_id: u16,
    pub stream_id: u16,
    pub flip_num: u16,
    /// Local task id at the moment of the wrap.
    pub task_id: u16,
    /// Device cycle counter.
    pub timestamp: u64,
}

/// Host API enter/exit record from one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiEventRecord {
    /// Raw level; unrecognised values are kept and classified later.
    pub level: u16,
    pub thread_id: u32,
    /// Host monotonic-raw ns.
    pub begin: u64,
    /// Host monotonic-raw ns, `None` when the exit was never recorded.
    pub end: Option<u64>,
    /// Name hash resolved through the session name table.
    pub item_id: u64,
    pub device_id: u16,
    pub stream_id: u16,
    pub task_id: u16,
}

/// Builds a composite task id from its local id and batch id.
pub const fn compose_task_id(low: u16, batch: u16) -> u32 {
    (low as u32) | ((batch as u32) << TASK_ID_BITS)
}

/// Extracts the recycling local id from a composite task id.
pub const fn task_id_low16(task_id: u32) -> u16 {
    (task_id & 0xFFFF) as u16
}

/// Extracts the batch id from a composite task id.
pub const fn batch_id(task_id: u32) -> u16 {
    (task_id >> TASK_ID_BITS) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_roundtrip() {
        for kind in RecordKind::all() {
            assert_eq!(RecordKind::from_u8(*kind as u8), Some(*kind));
        }
        assert!(RecordKind::from_u8(RECORD_KIND_COUNT as u8).is_none());
    }

    #[test]
    fn test_event_level_from_u16() {
        assert_eq!(EventLevel::from_u16(5000), Some(EventLevel::Runtime));
        assert_eq!(EventLevel::from_u16(15000), Some(EventLevel::Model));
        assert_eq!(EventLevel::from_u16(20000), None);
        assert_eq!(EventLevel::Hccl.to_string(), "communication");
    }

    #[test]
    fn test_compose_task_id() {
        assert_eq!(compose_task_id(7, 0), 7);
        assert_eq!(compose_task_id(7, 1), 0x0001_0007);
        assert_eq!(compose_task_id(u16::MAX, u16::MAX), u32::MAX);
        assert_eq!(task_id_low16(0x0003_FFFE), 0xFFFE);
        assert_eq!(batch_id(0x0003_FFFE), 3);
    }

    #[test]
    fn test_set_batch_id_keeps_low_bits() {
        let mut task = TaskRecord {
            device_id: 0,
            stream_id: 2,
            task_type: 0,
            task_id: compose_task_id(42, 9),
            timestamp: 0,
        };
        task.set_batch_id(3);
        assert_eq!(task.task_id_low16(), 42);
        assert_eq!(task.batch_id(), 3);
    }
}
