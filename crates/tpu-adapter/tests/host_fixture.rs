//! Discovery, caching and owner scanning against a fake host tree

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tpu_adapter::{
    ChipModel, DiscoveryCache, DiscoveryResult, ProcessOwnerScanner, SysfsScanner, TpuError,
    TpuInfoConfig,
};

struct FakeHost {
    _dir: TempDir,
    pci: PathBuf,
    proc: PathBuf,
}

impl FakeHost {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pci = dir.path().join("sys/bus/pci/devices");
        let proc = dir.path().join("proc");
        fs::create_dir_all(&pci).unwrap();
        fs::create_dir_all(&proc).unwrap();
        Self { _dir: dir, pci, proc }
    }

    fn add_chip(&self, addr: &str, device: &str, subsystem: &str) {
        write_device(&self.pci, addr, "0x1ae0", device, subsystem);
    }

    fn remove_chip(&self, addr: &str) {
        fs::remove_dir_all(self.pci.join(addr)).unwrap();
    }

    fn open_device(&self, pid: u32, fd: u32, target: &str) {
        let fd_dir = self.proc.join(pid.to_string()).join("fd");
        fs::create_dir_all(&fd_dir).unwrap();
        symlink(target, fd_dir.join(fd.to_string())).unwrap();
    }

    fn config(&self) -> TpuInfoConfig {
        TpuInfoConfig {
            pci_devices_root: self.pci.clone(),
            proc_root: self.proc.clone(),
            ..TpuInfoConfig::default()
        }
    }
}

fn write_device(root: &Path, addr: &str, vendor: &str, device: &str, subsystem: &str) {
    let dir = root.join(addr);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
    fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
    fs::write(dir.join("subsystem_device"), format!("{}\n", subsystem)).unwrap();
    fs::write(dir.join("class"), "0x120000\n").unwrap();
}

#[test]
fn test_v4_host_end_to_end() {
    let host = FakeHost::new();
    for i in 0..4 {
        host.add_chip(&format!("0000:00:0{}.0", i + 4), "0x005e", "0x0000");
    }
    write_device(&host.pci, "0000:00:01.0", "0x8086", "0x7110", "0x0000");

    for (i, pid) in [10, 20, 30, 40].into_iter().enumerate() {
        host.open_device(pid, 0, "/dev/null");
        host.open_device(pid, 9, &format!("/dev/accel{}", i));
    }
    host.open_device(55, 3, "pipe:[991]");

    let config = host.config();
    let cache = DiscoveryCache::new(
        Box::new(SysfsScanner::new(&config.pci_devices_root)),
        config.cache_ttl(),
    );
    let discovered = cache.get().unwrap();
    assert_eq!(discovered, DiscoveryResult::new(ChipModel::V4, 4));
    assert_eq!(discovered.device_count(), 4);

    let owners = ProcessOwnerScanner::new(&config.proc_root).scan().unwrap();
    assert_eq!(owners.len() * discovered.devices_per_chip(), discovered.device_count());
    assert_eq!(owners.expand(discovered.devices_per_chip()), vec![10, 20, 30, 40]);
}

#[test]
fn test_v3_chips_expose_two_devices() {
    let host = FakeHost::new();
    host.add_chip("0000:00:04.0", "0x0027", "0x004f");
    host.add_chip("0000:00:05.0", "0x0027", "0x004f");
    host.open_device(100, 4, "/dev/accel1");
    host.open_device(200, 4, "/dev/accel0");

    let discovered = SysfsScanner::new(&host.pci).scan().unwrap();
    assert_eq!(discovered.model, Some(ChipModel::V3));
    assert_eq!(discovered.device_count(), 4);

    let owners = ProcessOwnerScanner::new(&host.proc).scan().unwrap();
    assert_eq!(owners.expand(discovered.devices_per_chip()), vec![200, 200, 100, 100]);
}

#[test]
fn test_cache_hides_hardware_changes_until_expiry() {
    let host = FakeHost::new();
    host.add_chip("0000:00:04.0", "0x006f", "0x0000");
    host.add_chip("0000:00:05.0", "0x006f", "0x0000");

    let cache = DiscoveryCache::new(
        Box::new(SysfsScanner::new(&host.pci)),
        Duration::from_millis(50),
    );
    assert_eq!(cache.get().unwrap().chip_count, 2);

    host.remove_chip("0000:00:05.0");
    assert_eq!(cache.get().unwrap().chip_count, 2);

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(cache.get().unwrap(), DiscoveryResult::new(ChipModel::V6e, 1));
}

#[test]
fn test_mixed_models_are_not_cached() {
    let host = FakeHost::new();
    host.add_chip("0000:00:04.0", "0x0063", "0x0000");
    host.add_chip("0000:00:05.0", "0x0062", "0x0000");

    let cache = DiscoveryCache::new(Box::new(SysfsScanner::new(&host.pci)), Duration::from_secs(60));
    assert!(matches!(cache.get(), Err(TpuError::ClassificationInconsistency(_))));

    host.remove_chip("0000:00:05.0");
    assert_eq!(cache.get().unwrap(), DiscoveryResult::new(ChipModel::V5e, 1));
}

#[test]
fn test_missing_sysfs_means_no_tpus() {
    let dir = TempDir::new().unwrap();
    let cache = DiscoveryCache::new(
        Box::new(SysfsScanner::new(dir.path().join("absent"))),
        Duration::from_secs(3),
    );
    assert_eq!(cache.get().unwrap().device_count(), 0);
}
