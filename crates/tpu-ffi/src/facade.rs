//! Status-code query surface over discovery, owner scanning and telemetry
//!
//! Each operation validates the caller's device count against discovery,
//! gathers and checks all of its data, and only then writes the caller's
//! buffers. Failures are reported as small integer codes; detail goes to
//! the log.

use crate::buffer::OutBuffer;
use std::os::raw::c_int;
use tpu_adapter::{
    fetch_metric_set, DiscoveryCache, DiscoveryResult, GrpcConnector, ProcessOwnerScanner,
    Result, SysfsScanner, TelemetryConnector, TpuError, TpuInfoConfig,
};
use tracing::{debug, warn};

/// Operation succeeded
pub const STATUS_OK: c_int = 0;
/// Device count mismatch, bad arguments, or connect failure
pub const STATUS_COUNT_MISMATCH: c_int = 1;
/// Owner resolution, metric fetch or cardinality failure
pub const STATUS_FETCH_FAILURE: c_int = 2;
/// Metric sequences disagree in length after reconciliation
pub const STATUS_LENGTH_MISMATCH: c_int = 3;

/// Output buffers of a metrics query
pub struct MetricBuffers<'a> {
    pub device_ids: OutBuffer<'a, i64>,
    pub memory_usage: OutBuffer<'a, i64>,
    pub total_memory: OutBuffer<'a, i64>,
    pub duty_cycle_pct: OutBuffer<'a, f64>,
}

/// Answers chip count, owner and metric queries for the local host
pub struct QueryFacade {
    cache: DiscoveryCache,
    owners: ProcessOwnerScanner,
    connector: Box<dyn TelemetryConnector>,
    default_port: u16,
}

impl QueryFacade {
    pub fn new(
        cache: DiscoveryCache,
        owners: ProcessOwnerScanner,
        connector: Box<dyn TelemetryConnector>,
        default_port: u16,
    ) -> Self {
        Self {
            cache,
            owners,
            connector,
            default_port,
        }
    }

    /// Build a facade over the real sysfs, procfs and gRPC sources
    pub fn from_config(config: &TpuInfoConfig) -> Result<Self> {
        config.validate()?;

        let cache = DiscoveryCache::new(
            Box::new(SysfsScanner::new(&config.pci_devices_root)),
            config.cache_ttl(),
        );
        let owners = ProcessOwnerScanner::new(&config.proc_root)
            .with_skip_inaccessible(config.skip_inaccessible_processes);
        let connector = GrpcConnector::new(config.rpc_timeout())?;

        Ok(Self::new(cache, owners, Box::new(connector), config.grpc_port))
    }

    /// Port used when the caller passes `port <= 0`
    pub fn default_port(&self) -> u16 {
        self.default_port
    }

    /// Current, possibly cached, discovery result
    pub fn discovered(&self) -> Result<DiscoveryResult> {
        self.cache.get()
    }

    /// Number of addressable TPU devices, 0 when none or on error
    pub fn chip_count(&self) -> c_int {
        match self.cache.get() {
            Ok(discovered) => c_int::try_from(discovered.device_count()).unwrap_or(c_int::MAX),
            Err(e) => {
                warn!("TPU discovery failed: {}", e);
                0
            }
        }
    }

    /// Fill `out` with the owning pid of every device, in device path order
    pub fn pids(&self, out: &mut OutBuffer<'_, i64>, n: c_int) -> c_int {
        match self.try_pids(out, n) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                debug!("tpu_pids failed ({}): {}", e.category(), e);
                pids_status(&e)
            }
        }
    }

    /// Fill the four metric buffers with one row per device
    pub fn metrics(&self, port: c_int, out: &mut MetricBuffers<'_>, n: c_int) -> c_int {
        match self.try_metrics(port, out, n) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                debug!("tpu_metrics failed ({}): {}", e.category(), e);
                metrics_status(&e)
            }
        }
    }

    /// Explicit port, or the default when `port <= 0`
    pub fn resolve_port(&self, port: c_int) -> Result<u16> {
        if port <= 0 {
            return Ok(self.default_port);
        }
        u16::try_from(port).map_err(|_| TpuError::Configuration(format!("port {} out of range", port)))
    }

    fn discover_expecting(&self, n: c_int) -> Result<DiscoveryResult> {
        let discovered = self.cache.get()?;
        let requested = usize::try_from(n).map_err(|_| TpuError::CountMismatch {
            requested: 0,
            discovered: discovered.device_count(),
        })?;

        if requested != discovered.device_count() {
            return Err(TpuError::CountMismatch {
                requested,
                discovered: discovered.device_count(),
            });
        }
        Ok(discovered)
    }

    fn try_pids(&self, out: &mut OutBuffer<'_, i64>, n: c_int) -> Result<()> {
        let discovered = self.discover_expecting(n)?;
        let expected = discovered.device_count();
        let per_chip = discovered.devices_per_chip();

        let owners = self.owners.scan()?;
        if owners.len() * per_chip != expected {
            return Err(TpuError::Cardinality {
                context: "TPU device owners",
                expected,
                actual: owners.len() * per_chip,
            });
        }

        out.copy_from(&owners.expand(per_chip))
    }

    fn try_metrics(&self, port: c_int, out: &mut MetricBuffers<'_>, n: c_int) -> Result<()> {
        let discovered = self.discover_expecting(n)?;
        let expected = discovered.device_count();
        if expected == 0 {
            return Ok(());
        }

        let port = self.resolve_port(port)?;
        let set = fetch_metric_set(self.connector.as_ref(), port, expected)?;

        let capacities = [
            out.device_ids.capacity(),
            out.memory_usage.capacity(),
            out.total_memory.capacity(),
            out.duty_cycle_pct.capacity(),
        ];
        if let Some(&capacity) = capacities.iter().find(|&&c| c != set.len()) {
            return Err(TpuError::BufferOverflow {
                requested: set.len(),
                capacity,
            });
        }

        out.device_ids.copy_from(&set.device_ids)?;
        out.memory_usage.copy_from(&set.memory_usage)?;
        out.total_memory.copy_from(&set.total_memory)?;
        out.duty_cycle_pct.copy_from(&set.duty_cycle_pct)
    }
}

/// Status code of a failed pids query
pub fn pids_status(error: &TpuError) -> c_int {
    match error {
        TpuError::CountMismatch { .. } | TpuError::ClassificationInconsistency(_) => {
            STATUS_COUNT_MISMATCH
        }
        _ => STATUS_FETCH_FAILURE,
    }
}

/// Status code of a failed metrics query
pub fn metrics_status(error: &TpuError) -> c_int {
    match error {
        TpuError::CountMismatch { .. }
        | TpuError::ClassificationInconsistency(_)
        | TpuError::Connect(_)
        | TpuError::Configuration(_) => STATUS_COUNT_MISMATCH,
        TpuError::LengthMismatch(_) | TpuError::BufferOverflow { .. } => STATUS_LENGTH_MISMATCH,
        _ => STATUS_FETCH_FAILURE,
    }
}
