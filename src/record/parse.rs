//! Decoding of packed little-endian trace records.
//!
//! Every layout is fixed width and starts with [`RECORD_MAGIC`]. A buffer holding
//! many records is walked in `SIZE` strides; records that fail validation are
//! dropped and counted, never fatal.

use thiserror::Error;

use super::event::{
    ApiEventRecord, FlipMarker, PcieRecord, RawBandwidth, RecordKind, TaskRecord, RECORD_MAGIC,
};

/// Errors that can occur while decoding a record (the MalformedRecord class).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{kind} record: bad magic {found:#06x}")]
    BadMagic { kind: RecordKind, found: u16 },

    #[error("{kind} record truncated: {size} of {need} bytes")]
    Truncated {
        kind: RecordKind,
        size: usize,
        need: usize,
    },
}

/// A fixed-width binary record layout.
pub trait RecordShape: Sized + Send + 'static {
    const KIND: RecordKind;
    /// Record size in bytes.
    const SIZE: usize;

    /// Decodes one record from exactly `SIZE` bytes.
    fn decode(data: &[u8]) -> Result<Self, ParseError>;
}

/// Result of decoding a byte stream of records.
#[derive(Debug)]
pub struct Decoded<R> {
    pub records: Vec<R>,
    pub dropped: usize,
    /// First decode error seen, for logging.
    pub first_error: Option<ParseError>,
}

/// Decodes every complete record in `data`. A trailing partial record counts
/// as one truncated drop.
pub fn decode_all<R: RecordShape>(data: &[u8]) -> Decoded<R> {
    let mut records = Vec::with_capacity(data.len() / R::SIZE);
    let mut dropped = 0;
    let mut first_error = None;

    let chunks = data.chunks_exact(R::SIZE);
    let tail = chunks.remainder();

    for chunk in chunks {
        match R::decode(chunk) {
            Ok(record) => records.push(record),
            Err(e) => {
                dropped += 1;
                first_error.get_or_insert(e);
            }
        }
    }

    if !tail.is_empty() {
        dropped += 1;
        first_error.get_or_insert(ParseError::Truncated {
            kind: R::KIND,
            size: tail.len(),
            need: R::SIZE,
        });
    }

    Decoded {
        records,
        dropped,
        first_error,
    }
}

// ---------------------------------------------------------------------------
// Safe byte-reading helpers (no indexing, no panics)
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

fn read_bandwidth(data: &[u8], offset: usize) -> RawBandwidth {
    RawBandwidth {
        min: read_u32_le(data, offset),
        max: read_u32_le(data, offset + 4),
        avg: read_u32_le(data, offset + 8),
    }
}

/// Checks length and magic, the structural validation shared by all layouts.
fn check_header(data: &[u8], kind: RecordKind, need: usize) -> Result<(), ParseError> {
    if data.len() < need {
        return Err(ParseError::Truncated {
            kind,
            size: data.len(),
            need,
        });
    }
    let magic = read_u16_le(data, 0);
    if magic != RECORD_MAGIC {
        return Err(ParseError::BadMagic { kind, found: magic });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-kind layouts
// ---------------------------------------------------------------------------

/// PCIe sample: 16 byte header + 7 bandwidth triples.
impl RecordShape for PcieRecord {
    const KIND: RecordKind = RecordKind::Pcie;
    const SIZE: usize = 100;

    fn decode(data: &[u8]) -> Result<Self, ParseError> {
        check_header(data, Self::KIND, Self::SIZE)?;
        Ok(Self {
            device_id: read_u16_le(data, 2),
            // pad[4] at 4-7
            timestamp: read_u64_le(data, 8),
            tx_post: read_bandwidth(data, 16),
            tx_nonpost: read_bandwidth(data, 28),
            tx_cpl: read_bandwidth(data, 40),
            tx_nonpost_latency: read_bandwidth(data, 52),
            rx_post: read_bandwidth(data, 64),
            rx_nonpost: read_bandwidth(data, 76),
            rx_cpl: read_bandwidth(data, 88),
        })
    }
}

/// Task dispatch record: 24 bytes.
impl RecordShape for TaskRecord {
    const KIND: RecordKind = RecordKind::TaskTrack;
    const SIZE: usize = 24;

    fn decode(data: &[u8]) -> Result<Self, ParseError> {
        check_header(data, Self::KIND, Self::SIZE)?;
        Ok(Self {
            device_id: read_u16_le(data, 2),
            stream_id: read_u16_le(data, 4),
            task_type: read_u16_le(data, 6),
            task_id: read_u32_le(data, 8),
            // pad[4] at 12-15
            timestamp: read_u64_le(data, 16),
        })
    }
}

/// Flip marker: 24 bytes.
impl RecordShape for FlipMarker {
    const KIND: RecordKind = RecordKind::Flip;
    const SIZE: usize = 24;

    fn decode(data: &[u8]) -> Result<Self, ParseError> {
        check_header(data, Self::KIND, Self::SIZE)?;
        Ok(Self {
            device_id: read_u16_le(data, 2),
            stream_id: read_u16_le(data, 4),
            flip_num: read_u16_le(data, 6),
            task_id: read_u16_le(data, 8),
            // pad[6] at 10-15
            timestamp: read_u64_le(data, 16),
        })
    }
}

/// Host API event: 48 bytes.
impl RecordShape for ApiEventRecord {
    const KIND: RecordKind = RecordKind::ApiEvent;
    const SIZE: usize = 48;

    fn decode(data: &[u8]) -> Result<Self, ParseError> {
        check_header(data, Self::KIND, Self::SIZE)?;
        let end = read_u64_le(data, 16);
        Ok(Self {
            level: read_u16_le(data, 2),
            thread_id: read_u32_le(data, 4),
            begin: read_u64_le(data, 8),
            end: (end != 0).then_some(end),
            item_id: read_u64_le(data, 24),
            device_id: read_u16_le(data, 32),
            stream_id: read_u16_le(data, 34),
            task_id: read_u16_le(data, 36),
            // pad[2] at 38-39, reserved u64 at 40-47
        })
    }
}
