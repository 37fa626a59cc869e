//! # tpu-adapter
//!
//! TPU discovery, process ownership and runtime metric adapters.
//!
//! This crate provides:
//! - Chip model classification from PCI identifiers
//! - Enumeration of TPU chips on the PCI bus, memoized behind a short TTL
//! - Mapping of TPU device nodes to the processes holding them open
//! - A synchronous gRPC client for the local TPU runtime metric service
//! - Alignment of per-core and per-chip metric samples into per-device rows
//!
//! ## Example
//!
//! ```rust,no_run
//! use tpu_adapter::{DiscoveryCache, SysfsScanner, TpuInfoConfig};
//!
//! let config = TpuInfoConfig::default();
//! let cache = DiscoveryCache::new(
//!     Box::new(SysfsScanner::new(&config.pci_devices_root)),
//!     config.cache_ttl(),
//! );
//!
//! let discovered = cache.get()?;
//! println!("Found {} TPU devices", discovered.device_count());
//! # Ok::<(), tpu_adapter::TpuError>(())
//! ```

use thiserror::Error;

pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod metrics;
pub mod owners;
pub mod reconcile;

// Mock implementations for testing
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use cache::DiscoveryCache;
pub use catalog::{ChipModel, GOOGLE_PCI_VENDOR_ID};
pub use client::{fetch_metric_set, GrpcConnector, TelemetryConnector, TelemetrySession};
pub use config::TpuInfoConfig;
pub use discovery::{ChipDiscovery, DiscoveryResult, SysfsScanner};
pub use metrics::{GaugeValue, MetricName, MetricSample, MetricSet, SortedSeries};
pub use owners::{DevicePath, ProcessOwnerMap, ProcessOwnerScanner};
pub use reconcile::reconcile;

/// Result type for TPU operations
pub type Result<T> = std::result::Result<T, TpuError>;

/// Errors that can occur while discovering TPUs or collecting their metrics
#[derive(Error, Debug)]
pub enum TpuError {
    #[error("PCI device enumeration unavailable: {0}")]
    ScanUnavailable(String),

    #[error("Expected one TPU chip type, found {0}")]
    ClassificationInconsistency(String),

    #[error("Process owner scan failed: {0}")]
    OwnerScanIo(String),

    #[error("Could not connect to the TPU runtime metric service: {0}")]
    Connect(String),

    #[error("Could not get {metric} metrics: {message}")]
    Rpc {
        /// Metric name that was being fetched
        metric: &'static str,
        /// Transport or status detail
        message: String,
    },

    #[error("Invalid metric response: {0}")]
    InvalidResponse(String),

    #[error("Requested data for {requested} TPU devices, but {discovered} found")]
    CountMismatch {
        /// Device count supplied by the caller
        requested: usize,
        /// Device count established by discovery
        discovered: usize,
    },

    #[error("{context}: expected {expected}, got {actual}")]
    Cardinality {
        /// What was being counted
        context: &'static str,
        /// Count required by discovery
        expected: usize,
        /// Count actually observed
        actual: usize,
    },

    #[error("{per_core} per-core samples cannot be split evenly across {per_chip} chips")]
    Reconciliation {
        /// Number of per-core samples
        per_core: usize,
        /// Number of per-chip samples
        per_chip: usize,
    },

    #[error("Lengths of metrics do not agree: {0}")]
    LengthMismatch(String),

    #[error("Output buffer overflow: requested {requested}, capacity {capacity}")]
    BufferOverflow {
        /// Number of values to write
        requested: usize,
        /// Declared buffer capacity
        capacity: usize,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl TpuError {
    /// Check if a later identical call could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TpuError::Connect(_) | TpuError::Rpc { .. } | TpuError::ScanUnavailable(_)
        )
    }

    /// Check if this error reports disagreeing counts between data sources
    pub fn is_cardinality_issue(&self) -> bool {
        matches!(
            self,
            TpuError::CountMismatch { .. }
                | TpuError::Cardinality { .. }
                | TpuError::Reconciliation { .. }
                | TpuError::LengthMismatch(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TpuError::ScanUnavailable(_) => "scan_unavailable",
            TpuError::ClassificationInconsistency(_) => "classification",
            TpuError::OwnerScanIo(_) => "owner_scan",
            TpuError::Connect(_) => "connect",
            TpuError::Rpc { .. } => "rpc",
            TpuError::InvalidResponse(_) => "invalid_response",
            TpuError::CountMismatch { .. } => "count_mismatch",
            TpuError::Cardinality { .. } => "cardinality",
            TpuError::Reconciliation { .. } => "reconciliation",
            TpuError::LengthMismatch(_) => "length_mismatch",
            TpuError::BufferOverflow { .. } => "buffer_overflow",
            TpuError::Configuration(_) => "configuration",
            TpuError::Io(_) => "io",
            TpuError::Config(_) => "config",
        }
    }
}
