//! Runtime metric names, samples and per-device series

use crate::{Result, TpuError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tpu_proto::{gauge, Metric};

/// Gauges the runtime metric service is queried for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    /// Total HBM per core, in bytes
    TotalMemory,
    /// HBM in use per core, in bytes
    MemoryUsage,
    /// TensorCore duty cycle per chip, in percent
    DutyCycle,
}

impl MetricName {
    pub const ALL: [MetricName; 3] = [
        MetricName::TotalMemory,
        MetricName::MemoryUsage,
        MetricName::DutyCycle,
    ];

    /// Name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::TotalMemory => "tpu.runtime.hbm.memory.total.bytes",
            MetricName::MemoryUsage => "tpu.runtime.hbm.memory.usage.bytes",
            MetricName::DutyCycle => "tpu.runtime.tensorcore.dutycycle.percent",
        }
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Option<MetricName> {
        MetricName::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric gauge reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GaugeValue {
    Int(i64),
    Double(f64),
}

impl GaugeValue {
    /// Reading as an integer, truncating toward zero
    pub fn as_i64(&self) -> i64 {
        match *self {
            GaugeValue::Int(v) => v,
            GaugeValue::Double(v) => v as i64,
        }
    }

    /// Reading as a float
    pub fn as_f64(&self) -> f64 {
        match *self {
            GaugeValue::Int(v) => v as f64,
            GaugeValue::Double(v) => v,
        }
    }
}

impl TryFrom<&gauge::Value> for GaugeValue {
    type Error = TpuError;

    fn try_from(value: &gauge::Value) -> Result<Self> {
        match value {
            gauge::Value::AsInt(v) => Ok(GaugeValue::Int(*v)),
            gauge::Value::AsDouble(v) => Ok(GaugeValue::Double(*v)),
            gauge::Value::AsString(_) => Err(TpuError::InvalidResponse(
                "string gauge where a number was expected".to_string(),
            )),
            gauge::Value::AsBool(_) => Err(TpuError::InvalidResponse(
                "bool gauge where a number was expected".to_string(),
            )),
        }
    }
}

/// One device's reading of one gauge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSample {
    pub device_id: i64,
    pub value: GaugeValue,
}

impl MetricSample {
    pub fn new(device_id: i64, value: GaugeValue) -> Self {
        Self { device_id, value }
    }
}

impl TryFrom<&Metric> for MetricSample {
    type Error = TpuError;

    fn try_from(metric: &Metric) -> Result<Self> {
        let device_id = metric.device_id().ok_or_else(|| {
            TpuError::InvalidResponse("sample without an integer device id".to_string())
        })?;
        let value = metric.gauge_value().ok_or_else(|| {
            TpuError::InvalidResponse(format!("sample for device {} has no gauge", device_id))
        })?;

        Ok(MetricSample {
            device_id,
            value: GaugeValue::try_from(value)?,
        })
    }
}

/// Values of one gauge ordered by ascending device id
#[derive(Debug, Clone, PartialEq)]
pub struct SortedSeries<T> {
    pub device_ids: Vec<i64>,
    pub values: Vec<T>,
}

impl<T> SortedSeries<T> {
    /// Sort `samples` by device id, converting each reading with `convert`
    ///
    /// A device id reported twice is an [`TpuError::InvalidResponse`].
    pub fn from_samples(samples: &[MetricSample], convert: impl Fn(GaugeValue) -> T) -> Result<Self> {
        let mut by_device = BTreeMap::new();
        for sample in samples {
            if by_device.insert(sample.device_id, sample.value).is_some() {
                return Err(TpuError::InvalidResponse(format!(
                    "device id {} reported more than once",
                    sample.device_id
                )));
            }
        }

        let (device_ids, values) = by_device
            .into_iter()
            .map(|(id, value)| (id, convert(value)))
            .unzip();

        Ok(Self { device_ids, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Aligned per-device metric rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    /// Device ids in ascending order
    pub device_ids: Vec<i64>,
    /// HBM in use, in bytes
    pub memory_usage: Vec<i64>,
    /// Total HBM, in bytes
    pub total_memory: Vec<i64>,
    /// Duty cycle of the owning chip, in percent
    pub duty_cycle_pct: Vec<f64>,
}

impl MetricSet {
    /// Number of device rows
    pub fn len(&self) -> usize {
        self.device_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty()
    }

    /// Iterate rows as `(device_id, usage, total, duty_cycle_pct)`
    pub fn rows(&self) -> impl Iterator<Item = (i64, i64, i64, f64)> + '_ {
        self.device_ids
            .iter()
            .zip(&self.memory_usage)
            .zip(&self.total_memory)
            .zip(&self.duty_cycle_pct)
            .map(|(((id, usage), total), duty)| (*id, *usage, *total, *duty))
    }
}
