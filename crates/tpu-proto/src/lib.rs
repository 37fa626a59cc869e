//! # tpu-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for the TPU
//! runtime metric service.
//!
//! The TPU runtime exposes a small, unauthenticated gRPC service on the local
//! host. This crate compiles its contract and provides:
//! - The `RuntimeMetricService` client used by the metrics adapter
//! - The matching server trait, used by the loopback mock service in tests
//! - Accessors for pulling device ids and gauge values out of responses

pub mod conversions;

// Generated protobuf code
pub mod runtime {
    pub mod v1 {
        tonic::include_proto!("tpu.monitoring.runtime");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use runtime::v1::{
    runtime_metric_service_client::RuntimeMetricServiceClient,
    runtime_metric_service_server::{RuntimeMetricService, RuntimeMetricServiceServer},
    attr_value, gauge, metric, AttrValue, Attribute, Counter, Gauge, ListAttrValue,
    ListSupportedMetricsRequest, ListSupportedMetricsResponse, Metric, MetricRequest,
    MetricResponse, SupportedMetric, TpuMetric,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_request_default() {
        let request = MetricRequest::default();
        assert!(request.metric_name.is_empty());
    }
}
