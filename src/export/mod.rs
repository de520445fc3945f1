//! Output side of the pipeline: record store, trace writer and run metrics.

pub mod metrics;
pub mod schema;
pub mod store;
pub mod trace;

pub use metrics::PipelineMetrics;
pub use store::{MemoryRecordStore, RecordStore, Row, Selector, SqliteRecordStore, Table, Value};
pub use trace::{JsonTraceWriter, TraceWriter};
