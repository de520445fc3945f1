//! Offline post-processing of NPU profiling data.
//!
//! Raw host and device records are aligned onto one wall clock
//! ([`clock`]), task ids recycled by the hardware get their batch ids back
//! ([`flip`]), host API events are rebuilt into per-thread call trees
//! ([`tree`]) and everything is stored as rows and written as one trace
//! ([`assemble`], [`export`]). [`pipeline`] drives a whole run.

pub mod assemble;
pub mod clock;
pub mod config;
pub mod context;
pub mod export;
pub mod flip;
pub mod pipeline;
pub mod process;
pub mod record;
pub mod source;
pub mod tree;
