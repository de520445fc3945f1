//! Assembly of processed data into trace events.

pub mod host;
pub mod pcie;
pub mod task;
pub mod trace;

use thiserror::Error;

pub use host::HostTraceAssembler;
pub use pcie::CounterSeriesAssembler;
pub use task::{link_host_tasks, DeviceTaskAssembler, TaskLink};
pub use trace::{ArgValue, Args, Phase, TraceEvent};

/// Errors surfaced by an assembler for its whole domain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    #[error("{domain}: assembled no events from {input} input records")]
    AssembleFailed { domain: &'static str, input: usize },
}

/// Output of an assembler. Empty input is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    NoData,
    Events(Vec<TraceEvent>),
}

impl Assembled {
    pub fn len(&self) -> usize {
        match self {
            Self::NoData => 0,
            Self::Events(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        match self {
            Self::NoData => Vec::new(),
            Self::Events(events) => events,
        }
    }
}
