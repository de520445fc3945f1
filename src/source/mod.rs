//! Access to a collected profiling directory.
//!
//! ```text
//! <root>/info.json
//! <root>/host/calibration.json
//! <root>/host/data/hash_dic.json
//! <root>/host/data/api_event.data.<n>
//! <root>/device_<id>/calibration.json
//! <root>/device_<id>/data/{pcie,task_track,flip}.data.<n>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::clock::{CalibrationRecord, HOST_DEVICE_ID};
use crate::context::NameTable;
use crate::record::{decode_all, Decoded, RecordShape};

const SESSION_FILE: &str = "info.json";
const CALIBRATION_FILE: &str = "calibration.json";
const NAME_TABLE_FILE: &str = "hash_dic.json";
const DATA_DIR: &str = "data";
const HOST_DIR: &str = "host";
const DEVICE_DIR_PREFIX: &str = "device_";

/// Where a group of records was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    Host,
    Device(u32),
}

impl DataSource {
    /// Directory name under the profiling root.
    pub fn dir_name(self) -> String {
        match self {
            Self::Host => HOST_DIR.to_string(),
            Self::Device(id) => format!("{DEVICE_DIR_PREFIX}{id}"),
        }
    }

    /// Id the calibration of this source is registered under.
    pub fn calibration_id(self) -> u32 {
        match self {
            Self::Host => HOST_DEVICE_ID,
            Self::Device(id) => id,
        }
    }
}

/// Contents of `info.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    /// Profiling session id.
    pub pid: u32,
    /// Devices in the session. Discovered from the directory layout when empty.
    #[serde(default)]
    pub devices: Vec<u32>,
    #[serde(default)]
    pub hostname: String,
}

/// Read access to raw profiling data.
pub trait FileStore: Send + Sync {
    fn read_session(&self) -> Result<SessionInfo>;

    /// Reads and validates the calibration of `source`.
    fn read_calibration(&self, source: DataSource) -> Result<CalibrationRecord>;

    fn read_name_table(&self) -> Result<NameTable>;

    /// Decodes every record of type `R` collected for `source`. A source
    /// without any data yields no records.
    fn read_records<R: RecordShape>(&self, source: DataSource) -> Result<Decoded<R>>;
}

/// [`FileStore`] over a profiling directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("profiling directory {} does not exist", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_dir(&self, source: DataSource) -> PathBuf {
        self.root.join(source.dir_name())
    }

    /// Device ids from the `device_<id>` directories under the root.
    fn discover_devices(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(DEVICE_DIR_PREFIX))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            devices.push(id);
        }
        devices.sort_unstable();
        Ok(devices)
    }
}

impl FileStore for LocalFileStore {
    fn read_session(&self) -> Result<SessionInfo> {
        let path = self.root.join(SESSION_FILE);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut session: SessionInfo = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;

        if session.devices.is_empty() {
            session.devices = self.discover_devices()?;
        }
        Ok(session)
    }

    fn read_calibration(&self, source: DataSource) -> Result<CalibrationRecord> {
        let path = self.source_dir(source).join(CALIBRATION_FILE);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let record: CalibrationRecord = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;

        let expected = source.calibration_id();
        if record.device_id != expected {
            bail!(
                "{}: calibration is for device {}, expected {expected}",
                path.display(),
                record.device_id,
            );
        }
        Ok(record.validated()?)
    }

    fn read_name_table(&self) -> Result<NameTable> {
        let path = self
            .source_dir(DataSource::Host)
            .join(DATA_DIR)
            .join(NAME_TABLE_FILE);
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw: std::collections::HashMap<String, String> = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;

        let mut names = NameTable::new();
        for (key, name) in raw {
            match key.parse::<u64>() {
                Ok(hash) => names.insert(hash, name),
                Err(_) => tracing::warn!(key = %key, "ignoring name table entry with a non-numeric hash"),
            }
        }
        Ok(names)
    }

    fn read_records<R: RecordShape>(&self, source: DataSource) -> Result<Decoded<R>> {
        let dir = self.source_dir(source).join(DATA_DIR);
        let mut out = Decoded {
            records: Vec::new(),
            dropped: 0,
            first_error: None,
        };
        if !dir.is_dir() {
            return Ok(out);
        }

        for path in slice_files(&dir, R::KIND.file_prefix())? {
            let data = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let decoded = decode_all::<R>(&data);

            if decoded.dropped > 0 {
                tracing::warn!(
                    file = %path.display(),
                    kind = %R::KIND,
                    dropped = decoded.dropped,
                    first_error = ?decoded.first_error,
                    "dropped malformed records",
                );
            }

            out.records.extend(decoded.records);
            out.dropped += decoded.dropped;
            if out.first_error.is_none() {
                out.first_error = decoded.first_error;
            }
        }

        tracing::debug!(
            source = %source.dir_name(),
            kind = %R::KIND,
            records = out.records.len(),
            dropped = out.dropped,
            "records read",
        );
        Ok(out)
    }
}

/// Files named `<prefix>.<n>` in `dir`, ordered by slice number.
fn slice_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;

    let mut slices = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(slice) = name
            .to_str()
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        slices.push((slice, entry.path()));
    }
    slices.sort_unstable_by_key(|(slice, _)| *slice);

    Ok(slices.into_iter().map(|(_, path)| path).collect())
}
