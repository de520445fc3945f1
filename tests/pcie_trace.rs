use npuprof::assemble::CounterSeriesAssembler;
use npuprof::clock::{CalibrationRecord, ClockAligner, ClockDomain};
use npuprof::export::{JsonTraceWriter, TraceWriter};
use npuprof::process::pcie::process_device_pcie;
use npuprof::record::{PcieRecord, RawBandwidth};

const PID: u64 = 40_436_224;

fn record(timestamp: u64, tx_post_avg: u32) -> PcieRecord {
    let zero = RawBandwidth::default();
    PcieRecord {
        device_id: 0,
        timestamp,
        tx_post: RawBandwidth {
            min: tx_post_avg,
            max: tx_post_avg,
            avg: tx_post_avg,
        },
        tx_nonpost: zero,
        tx_cpl: zero,
        tx_nonpost_latency: zero,
        rx_post: zero,
        rx_nonpost: zero,
        rx_cpl: zero,
    }
}

fn counters(ts: &str, tx_post: &str) -> Vec<String> {
    vec![
        format!(r#"{{"name":"PCIe_cpl","pid":{PID},"tid":0,"ts":"{ts}","ph":"C","args":{{"Rx":0.0,"Tx":0.0}}}}"#),
        format!(r#"{{"name":"PCIe_nonpost","pid":{PID},"tid":0,"ts":"{ts}","ph":"C","args":{{"Rx":0.0,"Tx":0.0}}}}"#),
        format!(r#"{{"name":"PCIe_nonpost_latency","pid":{PID},"tid":0,"ts":"{ts}","ph":"C","args":{{"Tx":0.0}}}}"#),
        format!(r#"{{"name":"PCIe_post","pid":{PID},"tid":0,"ts":"{ts}","ph":"C","args":{{"Rx":0.0,"Tx":{tx_post}}}}}"#),
    ]
}

/// Two samples of device 0 in session 1234, from raw cycles to JSON text.
#[test]
fn test_pcie_counter_trace_text() {
    // 1 GHz counter, so one cycle is one nanosecond past the calibration point.
    let calib = CalibrationRecord::new(0, 0, 1_000_000, 1_719_621_074_668_030_430, 1000.0)
        .expect("calibration");
    let aligner = ClockAligner::new(calib, ClockDomain::DeviceCycles);

    // Out of order on purpose; samples come back sorted by aligned time.
    let records = [record(21_834_950, 77), record(2_000_000, 62)];
    let samples = process_device_pcie(&records, &aligner);

    let events = CounterSeriesAssembler::new(1234)
        .assemble(&samples)
        .expect("assemble")
        .into_events();

    let mut writer = JsonTraceWriter::new(Vec::new()).expect("open");
    writer.write_all(&events).expect("write");
    assert_eq!(writer.events_written(), 11);
    let text = String::from_utf8(writer.finish().expect("finish")).expect("utf8");

    let mut lines = vec![
        format!(r#"{{"name":"process_name","pid":{PID},"tid":0,"ph":"M","args":{{"name":"PCIe"}}}}"#),
        format!(r#"{{"name":"process_labels","pid":{PID},"tid":0,"ph":"M","args":{{"labels":"NPU 0"}}}}"#),
        format!(r#"{{"name":"process_sort_index","pid":{PID},"tid":0,"ph":"M","args":{{"sort_index":16}}}}"#),
    ];
    lines.extend(counters("1719621074669030.430", "59.1278076171875"));
    lines.extend(counters("1719621074688865.380", "73.43292236328125"));
    let expected = format!("[\n{}\n]\n", lines.join(",\n"));

    assert_eq!(text, expected);

    let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid JSON");
    assert_eq!(parsed.as_array().map(Vec::len), Some(11));
}

#[test]
fn test_latency_converted_to_micros() {
    let calib = CalibrationRecord::new(0, 0, 0, 0, 1000.0).expect("calibration");
    let aligner = ClockAligner::new(calib, ClockDomain::DeviceCycles);
    let mut raw = record(1_500, 0);
    raw.tx_nonpost_latency.avg = 2_500;

    let samples = process_device_pcie(&[raw], &aligner);
    let events = CounterSeriesAssembler::new(1)
        .assemble(&samples)
        .expect("assemble")
        .into_events();

    let latency = events
        .iter()
        .find(|e| e.name == "PCIe_nonpost_latency")
        .expect("latency series");
    assert_eq!(latency.ts.as_deref(), Some("1.500"));
    assert_eq!(
        serde_json::to_value(&latency.args).expect("serialize"),
        serde_json::json!({ "Tx": 2.5 })
    );
}
