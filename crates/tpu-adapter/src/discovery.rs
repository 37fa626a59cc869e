//! TPU chip discovery on the PCI bus

use crate::catalog::{parse_pci_id, ChipModel, GOOGLE_PCI_VENDOR_ID};
use crate::{Result, TpuError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default sysfs directory holding one entry per PCI device
pub const DEFAULT_PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";

/// TPU discovery interface
pub trait ChipDiscovery: Send + Sync {
    /// Enumerate the TPU chips attached to this host
    fn discover(&self) -> Result<DiscoveryResult>;
}

impl<T: ChipDiscovery + ?Sized> ChipDiscovery for Arc<T> {
    fn discover(&self) -> Result<DiscoveryResult> {
        (**self).discover()
    }
}

/// Outcome of one enumeration: the single chip model present and how many
/// physical chips of it were found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Chip model, `None` when no TPU is attached
    pub model: Option<ChipModel>,

    /// Number of physical chips (not cores)
    pub chip_count: usize,
}

impl DiscoveryResult {
    /// Result for a host without TPUs
    pub fn none() -> Self {
        Self::default()
    }

    /// Result for `chip_count` chips of `model`
    pub fn new(model: ChipModel, chip_count: usize) -> Self {
        Self {
            model: Some(model),
            chip_count,
        }
    }

    /// Devices exposed per chip, 1 when no model was found
    pub fn devices_per_chip(&self) -> usize {
        self.model.map_or(1, |m| m.devices_per_chip())
    }

    /// Number of addressable devices (cores)
    pub fn device_count(&self) -> usize {
        match self.model {
            Some(model) => self.chip_count * model.devices_per_chip(),
            None => 0,
        }
    }
}

/// Scans a sysfs PCI device directory for Google TPU chips
#[derive(Debug, Clone)]
pub struct SysfsScanner {
    root: PathBuf,
}

impl SysfsScanner {
    /// Create a scanner over `root`, normally `/sys/bus/pci/devices`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory being scanned
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate and classify every TPU chip under the root
    ///
    /// Entries with unreadable or malformed attributes are skipped. More than
    /// one distinct chip model is reported as
    /// [`TpuError::ClassificationInconsistency`].
    pub fn scan(&self) -> Result<DiscoveryResult> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            TpuError::ScanUnavailable(format!("failed to read {}: {}", self.root.display(), e))
        })?;

        let mut tally: BTreeMap<ChipModel, usize> = BTreeMap::new();

        for entry in entries.flatten() {
            let device_dir = entry.path();
            if let Some(model) = classify_entry(&device_dir) {
                debug!("Found TPU {} at {}", model, device_dir.display());
                *tally.entry(model).or_insert(0) += 1;
            }
        }

        if tally.len() > 1 {
            let found = tally
                .iter()
                .map(|(model, count)| format!("{}={}", model, count))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TpuError::ClassificationInconsistency(found));
        }

        let result = tally
            .into_iter()
            .next()
            .map_or_else(DiscoveryResult::none, |(model, count)| DiscoveryResult::new(model, count));

        info!(
            "Discovered {} TPU chips ({})",
            result.chip_count,
            result.model.map_or("none", |m| m.name())
        );
        Ok(result)
    }
}

impl Default for SysfsScanner {
    fn default() -> Self {
        Self::new(DEFAULT_PCI_DEVICES_ROOT)
    }
}

impl ChipDiscovery for SysfsScanner {
    fn discover(&self) -> Result<DiscoveryResult> {
        match self.scan() {
            Ok(result) => Ok(result),
            Err(TpuError::ScanUnavailable(reason)) => {
                warn!("Treating host as TPU-less: {}", reason);
                Ok(DiscoveryResult::none())
            }
            Err(e) => Err(e),
        }
    }
}

/// Classify one PCI device directory, `None` for anything that is not a
/// readable, known TPU
fn classify_entry(device_dir: &Path) -> Option<ChipModel> {
    let vendor_id = read_pci_attr(device_dir, "vendor")?;
    if vendor_id != GOOGLE_PCI_VENDOR_ID {
        return None;
    }

    let device_id = read_pci_attr(device_dir, "device")?;
    let subsystem_id = read_pci_attr(device_dir, "subsystem_device")?;

    let model = ChipModel::classify(device_id, subsystem_id);
    if model.is_none() {
        debug!(
            "Ignoring unknown Google device {:#06x}/{:#06x} at {}",
            device_id,
            subsystem_id,
            device_dir.display()
        );
    }
    model
}

fn read_pci_attr(device_dir: &Path, attr: &str) -> Option<u16> {
    let path = device_dir.join(attr);
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let id = parse_pci_id(&raw);
            if id.is_none() {
                debug!("Malformed PCI attribute {}: {:?}", path.display(), raw);
            }
            id
        }
        Err(e) => {
            debug!("Skipping {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_device(root: &Path, addr: &str, vendor: &str, device: &str, subsystem: &str) {
        let dir = root.join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        fs::write(dir.join("subsystem_device"), format!("{}\n", subsystem)).unwrap();
    }

    #[test]
    fn test_discovery_result_device_count() {
        assert_eq!(DiscoveryResult::none().device_count(), 0);
        assert_eq!(DiscoveryResult::new(ChipModel::V4, 4).device_count(), 4);
        assert_eq!(DiscoveryResult::new(ChipModel::V3, 4).device_count(), 8);
        assert_eq!(DiscoveryResult::none().devices_per_chip(), 1);
    }

    #[test]
    fn test_scan_counts_single_model() {
        let root = TempDir::new().unwrap();
        for i in 0..4 {
            add_device(root.path(), &format!("0000:00:0{}.0", i), "0x1ae0", "0x005e", "0x0000");
        }
        // Unrelated hardware
        add_device(root.path(), "0000:01:00.0", "0x8086", "0x005e", "0x0000");
        add_device(root.path(), "0000:02:00.0", "0x1ae0", "0x0042", "0x0000");

        let result = SysfsScanner::new(root.path()).scan().unwrap();
        assert_eq!(result, DiscoveryResult::new(ChipModel::V4, 4));
    }

    #[test]
    fn test_scan_without_tpus() {
        let root = TempDir::new().unwrap();
        add_device(root.path(), "0000:01:00.0", "0x10de", "0x2330", "0x16c1");

        let result = SysfsScanner::new(root.path()).scan().unwrap();
        assert_eq!(result, DiscoveryResult::none());
    }

    #[test]
    fn test_scan_mixed_models_is_inconsistent() {
        let root = TempDir::new().unwrap();
        add_device(root.path(), "0000:00:04.0", "0x1ae0", "0x0027", "0x004e");
        add_device(root.path(), "0000:00:05.0", "0x1ae0", "0x0027", "0x004f");

        let err = SysfsScanner::new(root.path()).scan().unwrap_err();
        assert!(matches!(err, TpuError::ClassificationInconsistency(_)));
        assert!(err.to_string().contains("v2=1"));
        assert!(err.to_string().contains("v3=1"));
    }

    #[test]
    fn test_scan_skips_unreadable_entries() {
        let root = TempDir::new().unwrap();
        add_device(root.path(), "0000:00:04.0", "0x1ae0", "0x0063", "0x0000");

        // Google vendor but no device attribute
        let partial = root.path().join("0000:00:05.0");
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("vendor"), "0x1ae0\n").unwrap();

        // Stray file at the top level
        fs::write(root.path().join("not-a-device"), "").unwrap();

        let result = SysfsScanner::new(root.path()).scan().unwrap();
        assert_eq!(result, DiscoveryResult::new(ChipModel::V5e, 1));
    }

    #[test]
    fn test_missing_root_degrades_to_none() {
        let root = TempDir::new().unwrap();
        let scanner = SysfsScanner::new(root.path().join("missing"));

        assert!(matches!(scanner.scan(), Err(TpuError::ScanUnavailable(_))));
        assert_eq!(scanner.discover().unwrap(), DiscoveryResult::none());
    }

    #[test]
    fn test_inconsistency_survives_discover() {
        let root = TempDir::new().unwrap();
        add_device(root.path(), "0000:00:04.0", "0x1ae0", "0x005e", "0x0000");
        add_device(root.path(), "0000:00:05.0", "0x1ae0", "0x006f", "0x0000");

        let result = SysfsScanner::new(root.path()).discover();
        assert!(matches!(result, Err(TpuError::ClassificationInconsistency(_))));
    }
}
