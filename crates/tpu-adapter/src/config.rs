//! Configuration for libtpuinfo
//!
//! Values come from built-in defaults, an optional YAML file named by
//! `LIBTPUINFO_CONFIG`, and `LIBTPUINFO_*` environment variables, in
//! increasing order of precedence.

use crate::cache::DEFAULT_DISCOVERY_TTL;
use crate::discovery::DEFAULT_PCI_DEVICES_ROOT;
use crate::owners::DEFAULT_PROC_ROOT;
use crate::{Result, TpuError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LIBTPUINFO";

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "LIBTPUINFO_CONFIG";

/// Port the TPU runtime metric service listens on by default
pub const DEFAULT_GRPC_PORT: u16 = 8431;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpuInfoConfig {
    /// Metric service port used when the caller does not supply one
    pub grpc_port: u16,

    /// Enable debug logging
    pub debug: bool,

    /// Discovery cache TTL in milliseconds
    pub cache_ttl_ms: u64,

    /// Connect and per-request timeout in milliseconds
    pub rpc_timeout_ms: u64,

    /// sysfs PCI devices directory
    pub pci_devices_root: PathBuf,

    /// procfs mount point
    pub proc_root: PathBuf,

    /// Skip processes whose descriptor table cannot be read
    pub skip_inaccessible_processes: bool,
}

impl TpuInfoConfig {
    /// Load configuration from defaults, the optional file named by
    /// `LIBTPUINFO_CONFIG`, and the process environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::build(file, None)
    }

    /// Load configuration from a specific file, ignoring the environment
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from defaults and an explicit set of
    /// `LIBTPUINFO_*` variables instead of the process environment
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self> {
        Self::build(None, Some(vars))
    }

    fn build(file: Option<PathBuf>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.grpc_port == 0 {
            return Err(TpuError::Configuration("grpc_port must be non-zero".to_string()));
        }
        if self.cache_ttl_ms == 0 {
            return Err(TpuError::Configuration("cache_ttl_ms must be non-zero".to_string()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(TpuError::Configuration("rpc_timeout_ms must be non-zero".to_string()));
        }
        if self.pci_devices_root.as_os_str().is_empty() {
            return Err(TpuError::Configuration("pci_devices_root is empty".to_string()));
        }
        if self.proc_root.as_os_str().is_empty() {
            return Err(TpuError::Configuration("proc_root is empty".to_string()));
        }

        Ok(())
    }

    /// Discovery cache TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Connect and per-request timeout
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for TpuInfoConfig {
    fn default() -> Self {
        Self {
            grpc_port: DEFAULT_GRPC_PORT,
            debug: false,
            cache_ttl_ms: DEFAULT_DISCOVERY_TTL.as_millis() as u64,
            rpc_timeout_ms: 1000,
            pci_devices_root: PathBuf::from(DEFAULT_PCI_DEVICES_ROOT),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            skip_inaccessible_processes: false,
        }
    }
}
