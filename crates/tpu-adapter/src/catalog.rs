//! TPU chip models and PCI identifier classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PCI vendor id of Google devices
pub const GOOGLE_PCI_VENDOR_ID: u16 = 0x1ae0;

/// Device id shared by TPU v2 and v3, told apart by subsystem id
const SHARED_V2_V3_DEVICE_ID: u16 = 0x0027;
const V2_SUBSYSTEM_ID: u16 = 0x004e;
const V3_SUBSYSTEM_ID: u16 = 0x004f;

/// Known TPU chip generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipModel {
    V2,
    V3,
    V4,
    V5e,
    V5p,
    V6e,
}

impl ChipModel {
    /// Every model in the catalog
    pub const ALL: [ChipModel; 6] = [
        ChipModel::V2,
        ChipModel::V3,
        ChipModel::V4,
        ChipModel::V5e,
        ChipModel::V5p,
        ChipModel::V6e,
    ];

    /// Classify a chip from its PCI device and subsystem ids
    ///
    /// Unknown ids are not an error: the bus routinely carries unrelated
    /// Google hardware.
    pub fn classify(device_id: u16, subsystem_id: u16) -> Option<ChipModel> {
        match (device_id, subsystem_id) {
            (SHARED_V2_V3_DEVICE_ID, V2_SUBSYSTEM_ID) => Some(ChipModel::V2),
            (SHARED_V2_V3_DEVICE_ID, V3_SUBSYSTEM_ID) => Some(ChipModel::V3),
            (SHARED_V2_V3_DEVICE_ID, _) => None,
            (0x005e, _) => Some(ChipModel::V4),
            (0x0063, _) => Some(ChipModel::V5e),
            (0x0062, _) => Some(ChipModel::V5p),
            (0x006f, _) => Some(ChipModel::V6e),
            _ => None,
        }
    }

    /// Short model name, e.g. `v5e`
    pub fn name(&self) -> &'static str {
        match self {
            ChipModel::V2 => "v2",
            ChipModel::V3 => "v3",
            ChipModel::V4 => "v4",
            ChipModel::V5e => "v5e",
            ChipModel::V5p => "v5p",
            ChipModel::V6e => "v6e",
        }
    }

    /// High bandwidth memory per chip in GiB
    pub fn hbm_gib(&self) -> u32 {
        match self {
            ChipModel::V2 => 8,
            ChipModel::V3 => 16,
            ChipModel::V4 => 32,
            ChipModel::V5e => 16,
            ChipModel::V5p => 95,
            ChipModel::V6e => 32,
        }
    }

    /// Number of addressable devices (cores) each physical chip exposes
    pub fn devices_per_chip(&self) -> usize {
        match self {
            ChipModel::V2 | ChipModel::V3 => 2,
            ChipModel::V4 | ChipModel::V5e | ChipModel::V5p | ChipModel::V6e => 1,
        }
    }

    /// Whether the chip is exposed through VFIO rather than the accel driver
    pub fn uses_vfio(&self) -> bool {
        matches!(self, ChipModel::V5e | ChipModel::V5p | ChipModel::V6e)
    }

    /// Expected device node of chip `index`
    pub fn device_path(&self, index: u32) -> String {
        if self.uses_vfio() {
            format!("/dev/vfio/{}", index)
        } else {
            format!("/dev/accel{}", index)
        }
    }
}

/// Parse a sysfs PCI id attribute such as `"0x1ae0\n"`
pub fn parse_pci_id(raw: &str) -> Option<u16> {
    let trimmed = raw.trim_end_matches('\n').trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))?;
    u16::from_str_radix(hex, 16).ok()
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChipModel::ALL
            .iter()
            .copied()
            .find(|model| model.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown TPU chip model: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_device_id_disambiguated_by_subsystem() {
        assert_eq!(ChipModel::classify(0x0027, 0x004e), Some(ChipModel::V2));
        assert_eq!(ChipModel::classify(0x0027, 0x004f), Some(ChipModel::V3));
        assert_eq!(ChipModel::classify(0x0027, 0x0050), None);
    }

    #[test]
    fn test_direct_device_ids() {
        assert_eq!(ChipModel::classify(0x005e, 0x0000), Some(ChipModel::V4));
        assert_eq!(ChipModel::classify(0x0063, 0x1234), Some(ChipModel::V5e));
        assert_eq!(ChipModel::classify(0x0062, 0x0000), Some(ChipModel::V5p));
        assert_eq!(ChipModel::classify(0x006f, 0x0000), Some(ChipModel::V6e));
    }

    #[test]
    fn test_unknown_device_id() {
        assert_eq!(ChipModel::classify(0x0001, 0x004e), None);
        assert_eq!(ChipModel::classify(0xffff, 0xffff), None);
    }

    #[test]
    fn test_model_attributes() {
        assert_eq!(ChipModel::V2.devices_per_chip(), 2);
        assert_eq!(ChipModel::V3.devices_per_chip(), 2);
        assert_eq!(ChipModel::V4.devices_per_chip(), 1);
        assert_eq!(ChipModel::V5p.hbm_gib(), 95);
        assert_eq!(ChipModel::V6e.hbm_gib(), 32);
    }

    #[test]
    fn test_device_paths() {
        assert_eq!(ChipModel::V4.device_path(3), "/dev/accel3");
        assert_eq!(ChipModel::V2.device_path(0), "/dev/accel0");
        assert_eq!(ChipModel::V5e.device_path(1), "/dev/vfio/1");
        assert_eq!(ChipModel::V6e.device_path(7), "/dev/vfio/7");
    }

    #[test]
    fn test_parse_pci_id() {
        assert_eq!(parse_pci_id("0x1ae0\n"), Some(GOOGLE_PCI_VENDOR_ID));
        assert_eq!(parse_pci_id("0x005e"), Some(0x005e));
        assert_eq!(parse_pci_id("1ae0\n"), None);
        assert_eq!(parse_pci_id("0xzzzz\n"), None);
        assert_eq!(parse_pci_id(""), None);
    }

    #[test]
    fn test_model_name_round_trip() {
        for model in ChipModel::ALL {
            assert_eq!(model.to_string().parse::<ChipModel>().unwrap(), model);
        }
        assert_eq!("V5E".parse::<ChipModel>().unwrap(), ChipModel::V5e);
        assert!("v9".parse::<ChipModel>().is_err());
    }

    #[test]
    fn test_serde_uses_model_name() {
        let json = serde_json::to_string(&ChipModel::V5p).unwrap();
        assert_eq!(json, "\"v5p\"");
    }
}
