//! # libtpuinfo
//!
//! C ABI for querying the TPU chips attached to this host, the processes
//! holding them, and their runtime metrics.
//!
//! The exported functions mirror `include/tpuinfo.h`:
//!
//! - `tpu_chip_count()` returns the number of addressable TPU devices
//! - `tpu_pids(pids, n)` fills `pids` with the owning process of each device
//! - `tpu_metrics(port, ids, usage, total, duty, n)` fills four arrays with
//!   per-device memory and duty cycle readings
//!
//! Configuration is read once, on the first call, from `LIBTPUINFO_*`
//! environment variables and the optional file named by `LIBTPUINFO_CONFIG`.
//! Set `LIBTPUINFO_DEBUG=1` or `RUST_LOG` for diagnostics on stderr.

use std::os::raw::{c_double, c_int, c_longlong};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use tpu_adapter::TpuInfoConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub mod buffer;
pub mod facade;

pub use buffer::OutBuffer;
pub use facade::{
    MetricBuffers, QueryFacade, STATUS_COUNT_MISMATCH, STATUS_FETCH_FAILURE,
    STATUS_LENGTH_MISMATCH, STATUS_OK,
};

static FACADE: OnceLock<Option<QueryFacade>> = OnceLock::new();

fn facade() -> Option<&'static QueryFacade> {
    FACADE
        .get_or_init(|| {
            let loaded = TpuInfoConfig::load();
            let config = loaded.as_ref().cloned().unwrap_or_default();
            init_logging(config.debug);

            if let Err(e) = &loaded {
                warn!("Invalid libtpuinfo configuration, using defaults: {}", e);
            }

            match QueryFacade::from_config(&config) {
                Ok(facade) => {
                    info!("libtpuinfo initialized with metric port {}", config.grpc_port);
                    Some(facade)
                }
                Err(e) => {
                    error!("Failed to initialize libtpuinfo: {}", e);
                    None
                }
            }
        })
        .as_ref()
}

/// Run `query` against the shared facade. A library that failed to
/// initialise answers every query with `STATUS_FETCH_FAILURE`.
fn with_facade(
    facade: Option<&QueryFacade>,
    query: impl FnOnce(&QueryFacade) -> c_int,
) -> c_int {
    facade.map_or(STATUS_FETCH_FAILURE, query)
}

/// Install a stderr subscriber unless the host process already has one
fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "off" }));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn guarded(operation: &str, fallback: c_int, f: impl FnOnce() -> c_int) -> c_int {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("{} panicked", operation);
        fallback
    })
}

/// Number of addressable TPU devices on this host, 0 when there are none
#[no_mangle]
pub extern "C" fn tpu_chip_count() -> c_int {
    guarded("tpu_chip_count", 0, || facade().map_or(0, QueryFacade::chip_count))
}

/// Write the pid owning each TPU device into `pids`
///
/// Returns 0 on success, 1 when `n` does not match the device count, and 2
/// when owners could not be resolved for every device or the library failed
/// to initialise.
///
/// # Safety
///
/// `pids` must point to at least `n` writable `long long` values, or be null
/// when `n` is 0.
#[no_mangle]
pub unsafe extern "C" fn tpu_pids(pids: *mut c_longlong, n: c_int) -> c_int {
    guarded("tpu_pids", STATUS_FETCH_FAILURE, || {
        // SAFETY: upheld by the caller per the function contract
        let Some(mut out) = (unsafe { OutBuffer::from_raw(pids, n) }) else {
            return STATUS_COUNT_MISMATCH;
        };
        with_facade(facade(), |facade| facade.pids(&mut out, n))
    })
}

/// Write per-device ids, HBM usage, HBM total and duty cycle into the four
/// arrays, each of length `n`
///
/// `port <= 0` selects the configured metric service port. Returns 0 on
/// success, 1 on device count mismatch or connect failure, 2 when a metric
/// could not be fetched or its samples do not line up with the devices, and
/// 3 when the reconciled sequences disagree in length. A library that failed
/// to initialise returns 2.
///
/// # Safety
///
/// Each pointer must point to at least `n` writable values of its type, or
/// be null when `n` is 0.
#[no_mangle]
pub unsafe extern "C" fn tpu_metrics(
    port: c_int,
    device_ids: *mut c_longlong,
    memory_usage: *mut c_longlong,
    total_memory: *mut c_longlong,
    duty_cycle_pct: *mut c_double,
    n: c_int,
) -> c_int {
    guarded("tpu_metrics", STATUS_FETCH_FAILURE, || {
        // SAFETY: upheld by the caller per the function contract
        let buffers = unsafe {
            (
                OutBuffer::from_raw(device_ids, n),
                OutBuffer::from_raw(memory_usage, n),
                OutBuffer::from_raw(total_memory, n),
                OutBuffer::from_raw(duty_cycle_pct, n),
            )
        };
        let (Some(device_ids), Some(memory_usage), Some(total_memory), Some(duty_cycle_pct)) =
            buffers
        else {
            return STATUS_COUNT_MISMATCH;
        };

        let mut out = MetricBuffers {
            device_ids,
            memory_usage,
            total_memory,
            duty_cycle_pct,
        };
        with_facade(facade(), |facade| facade.metrics(port, &mut out, n))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_buffer_with_length_is_rejected() {
        let status = unsafe { tpu_pids(std::ptr::null_mut(), 4) };
        assert_eq!(status, STATUS_COUNT_MISMATCH);
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut storage = [0 as c_longlong; 1];
        let status = unsafe { tpu_pids(storage.as_mut_ptr(), -1) };
        assert_eq!(status, STATUS_COUNT_MISMATCH);

        let status = unsafe {
            tpu_metrics(
                0,
                storage.as_mut_ptr(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                -3,
            )
        };
        assert_eq!(status, STATUS_COUNT_MISMATCH);
    }

    #[test]
    fn test_uninitialized_library_reports_fetch_failure() {
        assert_eq!(with_facade(None, |_| STATUS_OK), STATUS_FETCH_FAILURE);
    }

    #[test]
    fn test_guarded_catches_panics() {
        let status = guarded("test", 7, || panic!("boom"));
        assert_eq!(status, 7);
    }
}
