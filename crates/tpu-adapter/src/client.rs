//! Synchronous client for the local TPU runtime metric service

use crate::metrics::{MetricName, MetricSample, MetricSet, SortedSeries};
use crate::reconcile::reconcile;
use crate::{Result, TpuError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tonic::transport::{Channel, Endpoint};
use tpu_proto::{MetricRequest, RuntimeMetricServiceClient};
use tracing::{debug, info};

/// Opens sessions against the metric service on a local port
pub trait TelemetryConnector: Send + Sync {
    /// Connect to the service on `localhost:port`
    fn connect(&self, port: u16) -> Result<Box<dyn TelemetrySession + '_>>;
}

impl<T: TelemetryConnector + ?Sized> TelemetryConnector for Arc<T> {
    fn connect(&self, port: u16) -> Result<Box<dyn TelemetrySession + '_>> {
        (**self).connect(port)
    }
}

/// An established connection to the metric service
pub trait TelemetrySession {
    /// Fetch every sample of one gauge, in the order the service sent them
    fn fetch_gauge(&mut self, metric: MetricName) -> Result<Vec<MetricSample>>;
}

/// gRPC implementation of [`TelemetryConnector`]
///
/// Owns a current-thread tokio runtime so callers stay synchronous. Every
/// connect and every request is bounded by the configured timeout; nothing
/// is retried.
pub struct GrpcConnector {
    runtime: Runtime,
    timeout: Duration,
}

impl GrpcConnector {
    /// Create a connector with the given connect and request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime, timeout })
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for GrpcConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcConnector")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TelemetryConnector for GrpcConnector {
    fn connect(&self, port: u16) -> Result<Box<dyn TelemetrySession + '_>> {
        let address = format!("http://localhost:{}", port);
        debug!("Connecting to TPU runtime metric service at {}", address);

        let endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| TpuError::Connect(format!("invalid address {}: {}", address, e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let channel = self
            .runtime
            .block_on(endpoint.connect())
            .map_err(|e| TpuError::Connect(format!("{}: {}", address, e)))?;

        info!("Connected to TPU runtime metric service on port {}", port);

        Ok(Box::new(GrpcSession {
            runtime: &self.runtime,
            client: RuntimeMetricServiceClient::new(channel),
        }))
    }
}

struct GrpcSession<'a> {
    runtime: &'a Runtime,
    client: RuntimeMetricServiceClient<Channel>,
}

impl TelemetrySession for GrpcSession<'_> {
    fn fetch_gauge(&mut self, metric: MetricName) -> Result<Vec<MetricSample>> {
        let request = MetricRequest {
            metric_name: metric.as_str().to_string(),
        };

        let response = self
            .runtime
            .block_on(self.client.get_runtime_metric(request))
            .map_err(|status| TpuError::Rpc {
                metric: metric.as_str(),
                message: format!("{:?}: {}", status.code(), status.message()),
            })?
            .into_inner();

        let samples = response
            .samples()
            .iter()
            .map(MetricSample::try_from)
            .collect::<Result<Vec<_>>>()?;

        debug!("Fetched {} samples of {}", samples.len(), metric);
        Ok(samples)
    }
}

/// Fetch one gauge and sort it by device id
pub fn fetch_sorted<T>(
    session: &mut dyn TelemetrySession,
    metric: MetricName,
    convert: impl Fn(crate::GaugeValue) -> T,
) -> Result<SortedSeries<T>> {
    let samples = session.fetch_gauge(metric)?;
    SortedSeries::from_samples(&samples, convert)
}

/// Connect, fetch memory usage, total memory and duty cycle in that order,
/// and align them into `expected` device rows
pub fn fetch_metric_set(
    connector: &dyn TelemetryConnector,
    port: u16,
    expected: usize,
) -> Result<MetricSet> {
    let mut session = connector.connect(port)?;

    let usage = fetch_sorted(session.as_mut(), MetricName::MemoryUsage, |v| v.as_i64())?;
    let total = fetch_sorted(session.as_mut(), MetricName::TotalMemory, |v| v.as_i64())?;
    let duty = fetch_sorted(session.as_mut(), MetricName::DutyCycle, |v| v.as_f64())?;

    reconcile(usage, total, duty, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMetricServer, MockTelemetry};
    use crate::metrics::GaugeValue;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_connect_failure() {
        let connector = GrpcConnector::new(Duration::from_millis(200)).unwrap();
        let result = connector.connect(free_port());
        assert!(matches!(result, Err(TpuError::Connect(_))));
    }

    #[test]
    fn test_fetch_gauge_over_grpc() {
        let server = MockMetricServer::start()
            .unwrap()
            .with_gauge(MetricName::MemoryUsage, vec![
                MetricSample::new(1, GaugeValue::Int(200)),
                MetricSample::new(0, GaugeValue::Int(100)),
            ]);

        let connector = GrpcConnector::new(Duration::from_secs(1)).unwrap();
        let mut session = connector.connect(server.port()).unwrap();
        let samples = session.fetch_gauge(MetricName::MemoryUsage).unwrap();

        assert_eq!(
            samples,
            vec![
                MetricSample::new(1, GaugeValue::Int(200)),
                MetricSample::new(0, GaugeValue::Int(100)),
            ]
        );
    }

    #[test]
    fn test_unknown_metric_is_rpc_error() {
        let server = MockMetricServer::start().unwrap();
        let connector = GrpcConnector::new(Duration::from_secs(1)).unwrap();
        let mut session = connector.connect(server.port()).unwrap();

        match session.fetch_gauge(MetricName::DutyCycle) {
            Err(TpuError::Rpc { metric, .. }) => {
                assert_eq!(metric, "tpu.runtime.tensorcore.dutycycle.percent")
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_metric_set_sorts_and_expands() {
        let telemetry = MockTelemetry::new()
            .with_gauge(MetricName::MemoryUsage, vec![
                MetricSample::new(3, GaugeValue::Int(40)),
                MetricSample::new(2, GaugeValue::Int(30)),
                MetricSample::new(1, GaugeValue::Int(20)),
                MetricSample::new(0, GaugeValue::Int(10)),
            ])
            .with_gauge(MetricName::TotalMemory, vec![
                MetricSample::new(0, GaugeValue::Int(100)),
                MetricSample::new(1, GaugeValue::Int(100)),
                MetricSample::new(2, GaugeValue::Int(100)),
                MetricSample::new(3, GaugeValue::Int(100)),
            ])
            .with_gauge(MetricName::DutyCycle, vec![
                MetricSample::new(1, GaugeValue::Double(75.0)),
                MetricSample::new(0, GaugeValue::Double(25.0)),
            ]);

        let set = fetch_metric_set(&telemetry, 8431, 4).unwrap();
        assert_eq!(set.device_ids, vec![0, 1, 2, 3]);
        assert_eq!(set.memory_usage, vec![10, 20, 30, 40]);
        assert_eq!(set.duty_cycle_pct, vec![25.0, 25.0, 75.0, 75.0]);
        assert_eq!(telemetry.connected_ports(), vec![8431]);
    }

    #[test]
    fn test_fetch_metric_set_stops_at_first_failure() {
        let telemetry = MockTelemetry::new()
            .with_gauge(MetricName::MemoryUsage, vec![MetricSample::new(0, GaugeValue::Int(1))])
            .fail_gauge(MetricName::TotalMemory);

        let result = fetch_metric_set(&telemetry, 8431, 1);
        assert!(matches!(result, Err(TpuError::Rpc { .. })));
        assert_eq!(
            telemetry.fetched(),
            vec![MetricName::MemoryUsage, MetricName::TotalMemory]
        );
    }
}
