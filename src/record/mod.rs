pub mod event;
pub mod parse;
pub mod stats;

pub use self::event::{
    ApiEventRecord, EventLevel, FlipMarker, PcieRecord, RawBandwidth, RecordKind, TaskRecord,
};
pub use self::parse::{decode_all, Decoded, ParseError, RecordShape};
pub use self::stats::RecordStats;
