//! Subcommand implementations

use crate::output::{format_bytes, Formattable, OutputFormatter};
use anyhow::{Context, Result};
use libtpuinfo::{MetricBuffers, OutBuffer, QueryFacade, STATUS_OK};
use serde::Serialize;
use std::time::{Duration, Instant};
use tpu_adapter::{ChipModel, ProcessOwnerScanner, SysfsScanner, TpuInfoConfig};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ChipSummary {
    model: Option<ChipModel>,
    hbm_gib: Option<u32>,
    chip_count: usize,
    devices_per_chip: usize,
    device_count: usize,
    device_paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PidRow {
    device: usize,
    pid: i64,
}

impl Formattable for PidRow {
    fn table_headers() -> Vec<&'static str> {
        vec!["Device", "PID"]
    }

    fn table_row(&self) -> Vec<String> {
        vec![self.device.to_string(), self.pid.to_string()]
    }
}

#[derive(Debug, Serialize)]
struct MetricRow {
    device_id: i64,
    model: Option<ChipModel>,
    memory_usage_bytes: i64,
    total_memory_bytes: i64,
    duty_cycle_pct: f64,
    pid: Option<i64>,
}

impl Formattable for MetricRow {
    fn table_headers() -> Vec<&'static str> {
        vec!["Device", "Model", "HBM Used", "HBM Total", "Duty Cycle", "PID"]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.device_id.to_string(),
            self.model.map_or_else(|| "-".to_string(), |m| m.to_string()),
            format_bytes(self.memory_usage_bytes),
            format_bytes(self.total_memory_bytes),
            format!("{:.2}%", self.duty_cycle_pct),
            self.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
        ]
    }
}

#[derive(Debug, Serialize)]
struct BenchRow {
    operation: &'static str,
    iterations: u32,
    failures: u32,
    min_us: u128,
    mean_us: u128,
    max_us: u128,
}

impl Formattable for BenchRow {
    fn table_headers() -> Vec<&'static str> {
        vec!["Operation", "Iterations", "Failures", "Min (us)", "Mean (us)", "Max (us)"]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.operation.to_string(),
            self.iterations.to_string(),
            self.failures.to_string(),
            self.min_us.to_string(),
            self.mean_us.to_string(),
            self.max_us.to_string(),
        ]
    }
}

fn device_count(facade: &QueryFacade) -> Result<usize> {
    Ok(facade.discovered().context("TPU discovery failed")?.device_count())
}

fn query_pids(facade: &QueryFacade, n: usize) -> (i32, Vec<i64>) {
    let mut pids = vec![0; n];
    let status = facade.pids(&mut OutBuffer::from_slice(&mut pids), n as i32);
    (status, pids)
}

struct MetricColumns {
    device_ids: Vec<i64>,
    memory_usage: Vec<i64>,
    total_memory: Vec<i64>,
    duty_cycle_pct: Vec<f64>,
}

fn query_metrics(facade: &QueryFacade, port: i32, n: usize) -> (i32, MetricColumns) {
    let mut columns = MetricColumns {
        device_ids: vec![0; n],
        memory_usage: vec![0; n],
        total_memory: vec![0; n],
        duty_cycle_pct: vec![0.0; n],
    };
    let status = {
        let mut out = MetricBuffers {
            device_ids: OutBuffer::from_slice(&mut columns.device_ids),
            memory_usage: OutBuffer::from_slice(&mut columns.memory_usage),
            total_memory: OutBuffer::from_slice(&mut columns.total_memory),
            duty_cycle_pct: OutBuffer::from_slice(&mut columns.duty_cycle_pct),
        };
        facade.metrics(port, &mut out, n as i32)
    };
    (status, columns)
}

/// `tpuinfo chips`
pub fn chips(facade: &QueryFacade, out: &OutputFormatter) -> Result<i32> {
    let discovered = facade.discovered().context("TPU discovery failed")?;

    let summary = ChipSummary {
        model: discovered.model,
        hbm_gib: discovered.model.map(|m| m.hbm_gib()),
        chip_count: discovered.chip_count,
        devices_per_chip: discovered.devices_per_chip(),
        device_count: discovered.device_count(),
        device_paths: discovered
            .model
            .map(|m| (0..discovered.chip_count as u32).map(|i| m.device_path(i)).collect())
            .unwrap_or_default(),
    };

    let pairs = [
        ("Model", summary.model.map_or_else(|| "none".to_string(), |m| m.to_string())),
        ("HBM per chip", summary.hbm_gib.map_or_else(|| "-".to_string(), |g| format!("{} GiB", g))),
        ("Chips", summary.chip_count.to_string()),
        ("Devices per chip", summary.devices_per_chip.to_string()),
        ("Devices", summary.device_count.to_string()),
        ("Device nodes", summary.device_paths.join(", ")),
    ];
    out.print_item(&summary, &pairs)?;
    Ok(0)
}

/// `tpuinfo pids`
pub fn pids(facade: &QueryFacade, out: &OutputFormatter) -> Result<i32> {
    let n = device_count(facade)?;
    let (status, pids) = query_pids(facade, n);
    if status != STATUS_OK {
        out.print_failure("tpu_pids", status)?;
        return Ok(status);
    }

    let rows: Vec<PidRow> = pids
        .into_iter()
        .enumerate()
        .map(|(device, pid)| PidRow { device, pid })
        .collect();
    out.print_list(&rows)?;
    Ok(0)
}

/// `tpuinfo metrics`
pub fn metrics(facade: &QueryFacade, port: i32, out: &OutputFormatter) -> Result<i32> {
    let discovered = facade.discovered().context("TPU discovery failed")?;
    let n = discovered.device_count();

    let (status, columns) = query_metrics(facade, port, n);
    if status != STATUS_OK {
        out.print_failure("tpu_metrics", status)?;
        return Ok(status);
    }

    // Owners are best effort here
    let (pid_status, pids) = query_pids(facade, n);
    if pid_status != STATUS_OK {
        debug!("Owner lookup failed with status {}", pid_status);
    }

    let rows: Vec<MetricRow> = (0..n)
        .map(|i| MetricRow {
            device_id: columns.device_ids[i],
            model: discovered.model,
            memory_usage_bytes: columns.memory_usage[i],
            total_memory_bytes: columns.total_memory[i],
            duty_cycle_pct: columns.duty_cycle_pct[i],
            pid: (pid_status == STATUS_OK).then(|| pids[i]),
        })
        .collect();
    out.print_list(&rows)?;
    Ok(0)
}

fn time_iterations(
    operation: &'static str,
    iterations: u32,
    mut f: impl FnMut() -> bool,
) -> BenchRow {
    let mut timings = Vec::with_capacity(iterations as usize);
    let mut failures = 0;

    for _ in 0..iterations {
        let start = Instant::now();
        if !f() {
            failures += 1;
        }
        timings.push(start.elapsed());
    }

    let total: Duration = timings.iter().sum();
    BenchRow {
        operation,
        iterations,
        failures,
        min_us: timings.iter().min().map_or(0, Duration::as_micros),
        mean_us: total.as_micros() / u128::from(iterations.max(1)),
        max_us: timings.iter().max().map_or(0, Duration::as_micros),
    }
}

/// `tpuinfo bench`
pub fn bench(
    facade: &QueryFacade,
    config: &TpuInfoConfig,
    iterations: u32,
    port: i32,
    out: &OutputFormatter,
) -> Result<i32> {
    let scanner = SysfsScanner::new(&config.pci_devices_root);
    let owners = ProcessOwnerScanner::new(&config.proc_root)
        .with_skip_inaccessible(config.skip_inaccessible_processes);
    let n = device_count(facade)?;

    let rows = vec![
        time_iterations("discovery (uncached)", iterations, || scanner.scan().is_ok()),
        time_iterations("discovery (cached)", iterations, || facade.discovered().is_ok()),
        time_iterations("owner scan", iterations, || match owners.scan() {
            Ok(_) => true,
            Err(e) => {
                warn!("Owner scan failed: {}", e);
                false
            }
        }),
        time_iterations("metrics", iterations, || query_metrics(facade, port, n).0 == STATUS_OK),
    ];

    out.print_list(&rows)?;
    Ok(0)
}
