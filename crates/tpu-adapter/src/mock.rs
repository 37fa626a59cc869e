//! Mock discovery and telemetry sources for testing

use crate::client::{TelemetryConnector, TelemetrySession};
use crate::discovery::{ChipDiscovery, DiscoveryResult};
use crate::metrics::{GaugeValue, MetricName, MetricSample};
use crate::{Result, TpuError};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tpu_proto::{
    ListSupportedMetricsRequest, ListSupportedMetricsResponse, Metric, MetricRequest,
    MetricResponse, RuntimeMetricService, RuntimeMetricServiceServer, SupportedMetric,
};
use tracing::{debug, info};

/// Discovery source returning a settable result
#[derive(Debug)]
pub struct MockDiscovery {
    result: Mutex<DiscoveryResult>,
    failure: Mutex<Option<TpuError>>,
    scans: AtomicUsize,
}

impl MockDiscovery {
    pub fn new(result: DiscoveryResult) -> Self {
        Self {
            result: Mutex::new(result),
            failure: Mutex::new(None),
            scans: AtomicUsize::new(0),
        }
    }

    /// Replace the result and clear any pending failure
    pub fn set_result(&self, result: DiscoveryResult) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = result;
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Fail the next scan with `error`
    pub fn fail_with(&self, error: TpuError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Number of scans performed so far
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl ChipDiscovery for MockDiscovery {
    fn discover(&self) -> Result<DiscoveryResult> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(error);
        }
        Ok(*self.result.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// In-process telemetry source serving canned gauges
#[derive(Debug, Default)]
pub struct MockTelemetry {
    gauges: HashMap<MetricName, Vec<MetricSample>>,
    failing: Vec<MetricName>,
    refuse_connect: bool,
    connected: Mutex<Vec<u16>>,
    fetched: Mutex<Vec<MetricName>>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `samples` for `metric`
    pub fn with_gauge(mut self, metric: MetricName, samples: Vec<MetricSample>) -> Self {
        self.gauges.insert(metric, samples);
        self
    }

    /// Serve one device row per entry: usage and total per core, duty cycle
    /// per chip
    pub fn with_devices(self, usage: &[i64], total: &[i64], duty: &[f64]) -> Self {
        let ints = |values: &[i64]| {
            values
                .iter()
                .enumerate()
                .map(|(id, v)| MetricSample::new(id as i64, GaugeValue::Int(*v)))
                .collect()
        };
        let doubles = duty
            .iter()
            .enumerate()
            .map(|(id, v)| MetricSample::new(id as i64, GaugeValue::Double(*v)))
            .collect();

        self.with_gauge(MetricName::MemoryUsage, ints(usage))
            .with_gauge(MetricName::TotalMemory, ints(total))
            .with_gauge(MetricName::DutyCycle, doubles)
    }

    /// Fail every fetch of `metric`
    pub fn fail_gauge(mut self, metric: MetricName) -> Self {
        self.failing.push(metric);
        self
    }

    /// Refuse every connection attempt
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Ports connected to, in order
    pub fn connected_ports(&self) -> Vec<u16> {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Gauges fetched, in order
    pub fn fetched(&self) -> Vec<MetricName> {
        self.fetched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TelemetryConnector for MockTelemetry {
    fn connect(&self, port: u16) -> Result<Box<dyn TelemetrySession + '_>> {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner).push(port);
        if self.refuse_connect {
            return Err(TpuError::Connect(format!("connection to port {} refused", port)));
        }
        Ok(Box::new(MockSession { telemetry: self }))
    }
}

struct MockSession<'a> {
    telemetry: &'a MockTelemetry,
}

impl TelemetrySession for MockSession<'_> {
    fn fetch_gauge(&mut self, metric: MetricName) -> Result<Vec<MetricSample>> {
        self.telemetry
            .fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metric);

        if self.telemetry.failing.contains(&metric) {
            return Err(TpuError::Rpc {
                metric: metric.as_str(),
                message: "mock failure".to_string(),
            });
        }
        Ok(self.telemetry.gauges.get(&metric).cloned().unwrap_or_default())
    }
}

type GaugeTable = Arc<Mutex<HashMap<String, Vec<Metric>>>>;

/// Runtime metric service on a loopback port, serving canned gauges
///
/// The server runs on its own thread and runtime and stops when dropped.
pub struct MockMetricServer {
    addr: SocketAddr,
    gauges: GaugeTable,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockMetricServer {
    /// Start serving on `127.0.0.1` with an ephemeral port
    pub fn start() -> Result<Self> {
        let gauges: GaugeTable = Arc::default();
        let service = MockMetricService {
            gauges: Arc::clone(&gauges),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<std::io::Result<SocketAddr>>();

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = addr_tx.send(Err(e));
                    return;
                }
            };

            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = addr_tx.send(Err(e));
                        return;
                    }
                };
                let local = listener.local_addr();
                let _ = addr_tx.send(local);

                let result = tonic::transport::Server::builder()
                    .add_service(RuntimeMetricServiceServer::new(service))
                    .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                        let _ = shutdown_rx.await;
                    })
                    .await;
                if let Err(e) = result {
                    debug!("Mock metric server stopped: {}", e);
                }
            });
        });

        let addr = addr_rx
            .recv()
            .map_err(|_| TpuError::Connect("mock metric server thread exited".to_string()))??;

        info!("Mock metric server listening on {}", addr);

        Ok(Self {
            addr,
            gauges,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Port the server listens on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Serve `samples` for `metric`
    pub fn with_gauge(self, metric: MetricName, samples: Vec<MetricSample>) -> Self {
        let metrics = samples.iter().map(to_proto).collect();
        self.set_raw(metric.as_str(), metrics);
        self
    }

    /// Serve arbitrary proto samples under `name`
    pub fn set_raw(&self, name: &str, metrics: Vec<Metric>) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), metrics);
    }
}

impl Drop for MockMetricServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn to_proto(sample: &MetricSample) -> Metric {
    match sample.value {
        GaugeValue::Int(v) => Metric::int_gauge(sample.device_id, v),
        GaugeValue::Double(v) => Metric::double_gauge(sample.device_id, v),
    }
}

struct MockMetricService {
    gauges: GaugeTable,
}

#[tonic::async_trait]
impl RuntimeMetricService for MockMetricService {
    async fn get_runtime_metric(
        &self,
        request: Request<MetricRequest>,
    ) -> std::result::Result<Response<MetricResponse>, Status> {
        let name = request.into_inner().metric_name;
        let metrics = self
            .gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned();

        match metrics {
            Some(metrics) => Ok(Response::new(MetricResponse::from_samples(name, metrics))),
            None => Err(Status::not_found(format!("metric {} not supported", name))),
        }
    }

    async fn list_supported_metrics(
        &self,
        _request: Request<ListSupportedMetricsRequest>,
    ) -> std::result::Result<Response<ListSupportedMetricsResponse>, Status> {
        let mut names: Vec<String> = self
            .gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();

        Ok(Response::new(ListSupportedMetricsResponse {
            supported_metric: names
                .into_iter()
                .map(|metric_name| SupportedMetric { metric_name })
                .collect(),
        }))
    }
}
