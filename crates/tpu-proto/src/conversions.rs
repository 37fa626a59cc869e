//! Accessors and constructors for runtime metric messages
//!
//! Every sample the runtime reports carries its device id as an integer
//! attribute and its reading as a gauge. These helpers pull both out without
//! callers having to walk the nested `oneof` wrappers.

use crate::{attr_value, gauge, metric, AttrValue, Attribute, Gauge, Metric, MetricResponse, TpuMetric};

/// Attribute key the runtime uses for the device index
pub const DEVICE_ID_KEY: &str = "device-id";

impl Metric {
    /// Integer device id attached to this sample, if any
    pub fn device_id(&self) -> Option<i64> {
        match self.attribute.as_ref()?.value.as_ref()?.attr.as_ref()? {
            attr_value::Attr::IntAttr(id) => Some(*id),
            _ => None,
        }
    }

    /// Gauge reading of this sample, if the measure is a gauge
    pub fn gauge_value(&self) -> Option<&gauge::Value> {
        match self.measure.as_ref()? {
            metric::Measure::Gauge(g) => g.value.as_ref(),
            metric::Measure::Counter(_) => None,
        }
    }

    /// Build an integer gauge sample for `device_id`
    pub fn int_gauge(device_id: i64, value: i64) -> Self {
        Self::with_gauge(device_id, gauge::Value::AsInt(value))
    }

    /// Build a floating point gauge sample for `device_id`
    pub fn double_gauge(device_id: i64, value: f64) -> Self {
        Self::with_gauge(device_id, gauge::Value::AsDouble(value))
    }

    fn with_gauge(device_id: i64, value: gauge::Value) -> Self {
        Self {
            attribute: Some(Attribute {
                key: DEVICE_ID_KEY.to_string(),
                value: Some(AttrValue {
                    attr: Some(attr_value::Attr::IntAttr(device_id)),
                }),
            }),
            measure: Some(metric::Measure::Gauge(Gauge { value: Some(value) })),
        }
    }
}

impl MetricResponse {
    /// Samples carried by this response, empty when the metric is absent
    pub fn samples(&self) -> &[Metric] {
        self.metric.as_ref().map(|m| m.metrics.as_slice()).unwrap_or_default()
    }

    /// Wrap a list of samples into a response for `name`
    pub fn from_samples(name: impl Into<String>, metrics: Vec<Metric>) -> Self {
        Self {
            metric: Some(TpuMetric {
                name: name.into(),
                description: String::new(),
                metrics,
            }),
        }
    }
}
