use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::assemble::TraceEvent;

/// Sink for assembled trace events.
pub trait TraceWriter: Send {
    /// Appends one self-contained event.
    fn write_event(&mut self, event: &TraceEvent) -> Result<()>;

    fn events_written(&self) -> usize;

    fn write_all(&mut self, events: &[TraceEvent]) -> Result<()> {
        for event in events {
            self.write_event(event)?;
        }
        Ok(())
    }
}

/// Writes events as a JSON array, one object per line. Separators are
/// handled here, so every event is serialized on its own.
pub struct JsonTraceWriter<W: Write> {
    out: W,
    written: usize,
}

impl JsonTraceWriter<BufWriter<File>> {
    /// Creates (or truncates) `path` and opens the array.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> JsonTraceWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(b"[").context("opening trace array")?;
        Ok(Self { out, written: 0 })
    }

    /// Closes the array, flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let tail: &[u8] = if self.written == 0 { b"]\n" } else { b"\n]\n" };
        self.out.write_all(tail).context("closing trace array")?;
        self.out.flush().context("flushing trace output")?;
        Ok(self.out)
    }
}

impl<W: Write + Send> TraceWriter for JsonTraceWriter<W> {
    fn write_event(&mut self, event: &TraceEvent) -> Result<()> {
        let sep: &[u8] = if self.written == 0 { b"\n" } else { b",\n" };
        self.out.write_all(sep).context("writing trace separator")?;
        serde_json::to_writer(&mut self.out, event).context("serializing trace event")?;
        self.written += 1;
        Ok(())
    }

    fn events_written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> TraceEvent {
        TraceEvent::metadata(name, 1, 0, "name", "x")
    }

    #[test]
    fn test_empty_array() {
        let writer = JsonTraceWriter::new(Vec::new()).expect("open");
        let out = writer.finish().expect("finish");
        assert_eq!(String::from_utf8(out).expect("utf8"), "[]\n");
    }

    #[test]
    fn test_events_form_valid_array() {
        let mut writer = JsonTraceWriter::new(Vec::new()).expect("open");
        writer
            .write_all(&[meta("process_name"), meta("thread_name")])
            .expect("write");
        assert_eq!(writer.events_written(), 2);
        let out = writer.finish().expect("finish");

        let text = String::from_utf8(out).expect("utf8");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        let array = parsed.as_array().expect("array");
        assert_eq!(array.len(), 2);
        assert_eq!(array[1]["name"], "thread_name");

        // Every line between the brackets is an independent object.
        for line in text.lines().filter(|l| l.starts_with('{')) {
            let obj = line.trim_end_matches(',');
            serde_json::from_str::<serde_json::Value>(obj).expect("self-contained object");
        }
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.json");
        let mut writer = JsonTraceWriter::create(&path).expect("create");
        writer.write_event(&meta("process_name")).expect("write");
        writer.finish().expect("finish");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("[\n{\"name\":\"process_name\""));
    }
}
