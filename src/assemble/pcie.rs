use std::collections::BTreeMap;

use crate::process::PcieSample;

use super::trace::{format_pid, process_metadata, ArgValue, Args, TraceEvent, PCIE_SORT_INDEX};
use super::{AssembleError, Assembled};

const BYTES_PER_MB: f64 = 1_048_576.0;
const NANOS_PER_MICRO: f64 = 1_000.0;

/// Counter tracks are not OS threads; every point goes on thread 0.
const COUNTER_TID: u64 = 0;

/// One counter track emitted per sample, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricGroup {
    Completion,
    NonPost,
    NonPostLatency,
    Post,
}

impl MetricGroup {
    const ALL: [MetricGroup; 4] = [
        Self::Completion,
        Self::NonPost,
        Self::NonPostLatency,
        Self::Post,
    ];

    fn series_name(self) -> &'static str {
        match self {
            Self::Completion => "PCIe_cpl",
            Self::NonPost => "PCIe_nonpost",
            Self::NonPostLatency => "PCIe_nonpost_latency",
            Self::Post => "PCIe_post",
        }
    }

    /// Display values keyed by direction. Bandwidth in MB/s, latency in µs.
    fn values(self, s: &PcieSample) -> Args {
        let mut args = Args::new();
        match self {
            Self::Completion => {
                args.insert("Tx", (s.tx_cpl.avg / BYTES_PER_MB).into());
                args.insert("Rx", (s.rx_cpl.avg / BYTES_PER_MB).into());
            }
            Self::NonPost => {
                args.insert("Tx", (s.tx_nonpost.avg / BYTES_PER_MB).into());
                args.insert("Rx", (s.rx_nonpost.avg / BYTES_PER_MB).into());
            }
            Self::NonPostLatency => {
                args.insert("Tx", (s.tx_nonpost_latency.avg / NANOS_PER_MICRO).into());
            }
            Self::Post => {
                args.insert("Tx", (s.tx_post.avg / BYTES_PER_MB).into());
                args.insert("Rx", (s.rx_post.avg / BYTES_PER_MB).into());
            }
        }
        args
    }
}

/// Turns aligned PCIe samples into counter series, one process per device.
#[derive(Debug, Clone)]
pub struct CounterSeriesAssembler {
    session_pid: u32,
}

impl CounterSeriesAssembler {
    pub const DOMAIN: &'static str = "pcie";

    pub fn new(session_pid: u32) -> Self {
        Self { session_pid }
    }

    /// Emits, per device, the process metadata followed by one point per
    /// sample and metric group. Points with a non-finite value are dropped.
    pub fn assemble(&self, samples: &[PcieSample]) -> Result<Assembled, AssembleError> {
        if samples.is_empty() {
            return Ok(Assembled::NoData);
        }

        let mut by_device: BTreeMap<u16, Vec<&PcieSample>> = BTreeMap::new();
        for sample in samples {
            by_device.entry(sample.device_id).or_default().push(sample);
        }

        let mut events =
            Vec::with_capacity(samples.len() * MetricGroup::ALL.len() + 3 * by_device.len());
        let mut points = 0usize;
        let mut skipped = 0usize;

        for (device_id, device_samples) in by_device {
            let pid = format_pid(self.session_pid, PCIE_SORT_INDEX, u32::from(device_id));
            events.extend(process_metadata(
                pid,
                "PCIe",
                &format!("NPU {device_id}"),
                PCIE_SORT_INDEX,
            ));

            for sample in device_samples {
                for group in MetricGroup::ALL {
                    let args = group.values(sample);
                    let finite = args.values().all(|v| match v {
                        ArgValue::Float(f) => f.is_finite(),
                        _ => true,
                    });
                    if !finite {
                        skipped += 1;
                        continue;
                    }
                    events.push(TraceEvent::counter(
                        group.series_name(),
                        pid,
                        COUNTER_TID,
                        sample.timestamp,
                        args,
                    ));
                    points += 1;
                }
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, "dropped PCIe points with non-finite values");
        }

        if points == 0 {
            return Err(AssembleError::AssembleFailed {
                domain: Self::DOMAIN,
                input: samples.len(),
            });
        }

        Ok(Assembled::Events(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HpTime;
    use crate::process::Bandwidth;

    fn sample(device_id: u16, ts: u64, tx_post_avg: f64) -> PcieSample {
        PcieSample {
            device_id,
            timestamp: HpTime::from_nanos(ts),
            tx_post: Bandwidth::avg_only(tx_post_avg),
            ..PcieSample::zeroed(device_id)
        }
    }

    #[test]
    fn test_empty_input_is_no_data() {
        let assembler = CounterSeriesAssembler::new(1);
        assert!(matches!(assembler.assemble(&[]), Ok(Assembled::NoData)));
        assert!(matches!(assembler.assemble(&[]), Ok(Assembled::NoData)));
    }

    #[test]
    fn test_unit_conversion() {
        let assembler = CounterSeriesAssembler::new(1);
        let mut s = sample(0, 1_000, 62_000_000.0);
        s.tx_nonpost_latency = Bandwidth::avg_only(12_500.0);
        let events = assembler
            .assemble(&[s])
            .expect("assemble")
            .into_events();

        let post = events
            .iter()
            .find(|e| e.name == "PCIe_post")
            .expect("post point");
        assert_eq!(post.args.get("Tx"), Some(&59.127_807_617_187_5f64.into()));

        let latency = events
            .iter()
            .find(|e| e.name == "PCIe_nonpost_latency")
            .expect("latency point");
        assert_eq!(latency.args.get("Tx"), Some(&12.5f64.into()));
        assert_eq!(latency.args.get("Rx"), None);
    }

    #[test]
    fn test_devices_get_separate_processes() {
        let assembler = CounterSeriesAssembler::new(1);
        let events = assembler
            .assemble(&[sample(1, 10, 1.0), sample(0, 20, 1.0)])
            .expect("assemble")
            .into_events();

        assert_eq!(events.len(), 2 * (3 + 4));
        assert_eq!(events[0].name, "process_name");
        assert_eq!(events[0].pid & 0x1F, 0);
        assert_eq!(events[7].name, "process_name");
        assert_eq!(events[7].pid & 0x1F, 1);
    }

    #[test]
    fn test_all_points_dropped_is_failure() {
        let assembler = CounterSeriesAssembler::new(1);
        let mut s = sample(0, 10, f64::NAN);
        s.tx_cpl = Bandwidth::avg_only(f64::INFINITY);
        s.tx_nonpost = Bandwidth::avg_only(f64::NAN);
        s.tx_nonpost_latency = Bandwidth::avg_only(f64::NAN);

        let err = assembler.assemble(&[s]).expect_err("no points");
        assert!(matches!(
            err,
            AssembleError::AssembleFailed {
                domain: "pcie",
                input: 1
            }
        ));
    }
}
