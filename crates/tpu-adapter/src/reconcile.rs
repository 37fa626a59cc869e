//! Alignment of per-core and per-chip gauges into per-device rows
//!
//! Memory gauges are reported per core while duty cycle is reported per
//! chip. The number of cores per chip is inferred from the ratio of the two
//! series lengths and the duty cycle of each chip is repeated across its
//! cores.

use crate::metrics::{MetricSet, SortedSeries};
use crate::{Result, TpuError};
use tracing::debug;

/// Assemble a [`MetricSet`] from three sorted series and the device count
/// established by discovery
pub fn reconcile(
    usage: SortedSeries<i64>,
    total: SortedSeries<i64>,
    duty_per_chip: SortedSeries<f64>,
    expected: usize,
) -> Result<MetricSet> {
    if usage.device_ids.len() != expected {
        return Err(TpuError::Cardinality {
            context: "memory usage samples",
            expected,
            actual: usage.device_ids.len(),
        });
    }

    let duty_cycle_pct = expand_per_core(&duty_per_chip.values, total.len())?;

    let set = MetricSet {
        device_ids: usage.device_ids,
        memory_usage: usage.values,
        total_memory: total.values,
        duty_cycle_pct,
    };

    let lengths = [
        set.device_ids.len(),
        set.memory_usage.len(),
        set.total_memory.len(),
        set.duty_cycle_pct.len(),
    ];
    if lengths.iter().any(|&len| len != lengths[0]) {
        return Err(TpuError::LengthMismatch(format!(
            "device ids {}, memory usage {}, total memory {}, duty cycle {}",
            lengths[0], lengths[1], lengths[2], lengths[3]
        )));
    }

    Ok(set)
}

/// Repeat each per-chip value contiguously so the result has `per_core`
/// entries, preserving chip order
pub fn expand_per_core(per_chip: &[f64], per_core: usize) -> Result<Vec<f64>> {
    if per_chip.is_empty() {
        if per_core == 0 {
            return Ok(Vec::new());
        }
        return Err(TpuError::Reconciliation {
            per_core,
            per_chip: 0,
        });
    }

    if per_core % per_chip.len() != 0 {
        return Err(TpuError::Reconciliation {
            per_core,
            per_chip: per_chip.len(),
        });
    }

    let cores_per_chip = per_core / per_chip.len();
    debug!("Expanding duty cycle with {} cores per chip", cores_per_chip);

    Ok(per_chip
        .iter()
        .flat_map(|value| std::iter::repeat(*value).take(cores_per_chip))
        .collect())
}
