//! Mapping of TPU device nodes to the processes holding them open
//!
//! Every numeric directory under the proc root is treated as a process. Its
//! `fd` directory is listed and each descriptor link resolved; links pointing
//! at `/dev/accel<N>` or `/dev/vfio/<N>` are recorded against the pid.

use crate::{Result, TpuError};
use nix::errno::Errno;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Default procfs mount point
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Canonical TPU device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DevicePath {
    /// `/dev/accel<N>`, used by v2 through v4
    Accel(u32),
    /// `/dev/vfio/<N>`, used by v5e and later
    Vfio(u32),
}

impl DevicePath {
    /// Parse a descriptor link target, `None` unless it names a TPU node
    pub fn parse(target: &str) -> Option<DevicePath> {
        if let Some(index) = target.strip_prefix("/dev/accel") {
            return parse_index(index).map(DevicePath::Accel);
        }
        if let Some(index) = target.strip_prefix("/dev/vfio/") {
            return parse_index(index).map(DevicePath::Vfio);
        }
        None
    }
}

/// Device node index in canonical form; `01` is not the node `1`
fn parse_index(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePath::Accel(index) => write!(f, "/dev/accel{}", index),
            DevicePath::Vfio(index) => write!(f, "/dev/vfio/{}", index),
        }
    }
}

/// Device path to owning pid, iterated in lexicographic path order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProcessOwnerMap {
    owners: BTreeMap<String, i64>,
}

impl ProcessOwnerMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` as the owner of `path`, replacing any previous owner
    pub fn insert(&mut self, path: DevicePath, pid: i64) -> Option<i64> {
        self.owners.insert(path.to_string(), pid)
    }

    /// Owner of `path`, if any
    pub fn get(&self, path: &str) -> Option<i64> {
        self.owners.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// `(path, pid)` pairs sorted by path string
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.owners.iter().map(|(path, pid)| (path.as_str(), *pid))
    }

    /// One pid per device: each owner is repeated `devices_per_chip` times,
    /// in path order
    pub fn expand(&self, devices_per_chip: usize) -> Vec<i64> {
        self.owners
            .values()
            .flat_map(|pid| std::iter::repeat(*pid).take(devices_per_chip))
            .collect()
    }
}

impl FromIterator<(DevicePath, i64)> for ProcessOwnerMap {
    fn from_iter<I: IntoIterator<Item = (DevicePath, i64)>>(iter: I) -> Self {
        let mut map = ProcessOwnerMap::new();
        for (path, pid) in iter {
            map.insert(path, pid);
        }
        map
    }
}

/// Walks a procfs tree to find which processes hold TPU devices open
#[derive(Debug, Clone)]
pub struct ProcessOwnerScanner {
    proc_root: PathBuf,
    skip_inaccessible: bool,
}

impl ProcessOwnerScanner {
    /// Create a scanner over `proc_root`, normally `/proc`
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            skip_inaccessible: false,
        }
    }

    /// Skip processes whose descriptor table cannot be opened instead of
    /// failing the scan
    pub fn with_skip_inaccessible(mut self, skip: bool) -> Self {
        self.skip_inaccessible = skip;
        self
    }

    /// Build a fresh owner map
    pub fn scan(&self) -> Result<ProcessOwnerMap> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| {
            TpuError::OwnerScanIo(format!("failed to read {}: {}", self.proc_root.display(), e))
        })?;

        let mut owners = ProcessOwnerMap::new();

        for entry in entries {
            let entry = entry.map_err(|e| {
                TpuError::OwnerScanIo(format!("failed to list {}: {}", self.proc_root.display(), e))
            })?;

            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };

            self.scan_process(pid, &entry.path(), &mut owners)?;
        }

        debug!("Found {} TPU device owners", owners.len());
        Ok(owners)
    }

    fn scan_process(&self, pid: i64, process_dir: &Path, owners: &mut ProcessOwnerMap) -> Result<()> {
        let fd_dir = process_dir.join("fd");

        let descriptors = match fs::read_dir(&fd_dir) {
            Ok(descriptors) => descriptors,
            Err(e) if process_vanished(&e) => {
                trace!("Process {} exited during scan", pid);
                return Ok(());
            }
            Err(e) if self.skip_inaccessible => {
                debug!("Skipping process {}: {}", pid, e);
                return Ok(());
            }
            Err(e) => {
                return Err(TpuError::OwnerScanIo(format!(
                    "failed to read {}: {}",
                    fd_dir.display(),
                    e
                )))
            }
        };

        for descriptor in descriptors {
            let descriptor = match descriptor {
                Ok(descriptor) => descriptor,
                Err(e) if process_vanished(&e) => return Ok(()),
                Err(e) => {
                    return Err(TpuError::OwnerScanIo(format!(
                        "failed to list {}: {}",
                        fd_dir.display(),
                        e
                    )))
                }
            };

            let is_fd_number = descriptor
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u64>().is_ok());
            if !is_fd_number {
                continue;
            }

            let link = descriptor.path();
            let target = match fs::read_link(&link) {
                Ok(target) => target,
                Err(e) if process_vanished(&e) => continue,
                Err(e) => {
                    return Err(TpuError::OwnerScanIo(format!(
                        "readlink failed for {}: {}",
                        link.display(),
                        e
                    )))
                }
            };

            if let Some(device) = target.to_str().and_then(DevicePath::parse) {
                trace!("Process {} holds {}", pid, device);
                owners.insert(device, pid);
            }
        }

        Ok(())
    }
}

impl Default for ProcessOwnerScanner {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

/// The process or descriptor went away between listing and resolving it
fn process_vanished(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound || error.raw_os_error() == Some(Errno::ESRCH as i32)
}
