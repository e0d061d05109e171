use crate::collectors::status::StatusSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub pve_host_up: GaugeVec,
    pub pve_cpu_usage_percent: GaugeVec,
    pub pve_load_average: GaugeVec,
    pub pve_memory_total_mb: GaugeVec,
    pub pve_memory_usage_percent: GaugeVec,
    pub pve_swap_usage_percent: GaugeVec,
    pub pve_disk_total_mb: GaugeVec,
    pub pve_disk_usage_percent: GaugeVec,
    pub pve_cpu_temperature_celsius: GaugeVec,
    pub pve_disk_temperature_celsius: GaugeVec,
    pub pve_io_delay_ms: GaugeVec,
    pub pve_last_collect_timestamp_seconds: GaugeVec,
    pub pve_operations_total: CounterVec,
    pub pve_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let pve_host_up = GaugeVec::new(
            opts!("pve_host_up", "1 if the last status collection reached the host"),
            &["host"],
        )?;
        let pve_cpu_usage_percent = GaugeVec::new(
            opts!("pve_cpu_usage_percent", "CPU usage in percent (100 - idle)"),
            &["host"],
        )?;
        let pve_load_average = GaugeVec::new(
            opts!("pve_load_average", "Load average by window"),
            &["host", "window"],
        )?;
        let pve_memory_total_mb = GaugeVec::new(
            opts!("pve_memory_total_mb", "Total RAM in MiB"),
            &["host"],
        )?;
        let pve_memory_usage_percent = GaugeVec::new(
            opts!("pve_memory_usage_percent", "RAM usage in percent"),
            &["host"],
        )?;
        let pve_swap_usage_percent = GaugeVec::new(
            opts!("pve_swap_usage_percent", "Swap usage in percent, 0 without swap"),
            &["host"],
        )?;
        let pve_disk_total_mb = GaugeVec::new(
            opts!("pve_disk_total_mb", "Root filesystem size in MiB"),
            &["host"],
        )?;
        let pve_disk_usage_percent = GaugeVec::new(
            opts!("pve_disk_usage_percent", "Root filesystem usage in percent"),
            &["host"],
        )?;
        let pve_cpu_temperature_celsius = GaugeVec::new(
            opts!("pve_cpu_temperature_celsius", "CPU temperature in Celsius"),
            &["host"],
        )?;
        let pve_disk_temperature_celsius = GaugeVec::new(
            opts!(
                "pve_disk_temperature_celsius",
                "Temperature of the first block device in Celsius"
            ),
            &["host"],
        )?;
        let pve_io_delay_ms = GaugeVec::new(
            opts!("pve_io_delay_ms", "Average I/O wait in milliseconds"),
            &["host"],
        )?;
        let pve_last_collect_timestamp_seconds = GaugeVec::new(
            opts!(
                "pve_last_collect_timestamp_seconds",
                "Unix time of the last status collection"
            ),
            &["host"],
        )?;
        let pve_operations_total = CounterVec::new(
            opts!("pve_operations_total", "Remote operations by outcome"),
            &["operation", "outcome"],
        )?;
        let pve_scrape_count_total = Counter::with_opts(opts!(
            "pve_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &pve_host_up)?;
        register(&registry, &pve_cpu_usage_percent)?;
        register(&registry, &pve_load_average)?;
        register(&registry, &pve_memory_total_mb)?;
        register(&registry, &pve_memory_usage_percent)?;
        register(&registry, &pve_swap_usage_percent)?;
        register(&registry, &pve_disk_total_mb)?;
        register(&registry, &pve_disk_usage_percent)?;
        register(&registry, &pve_cpu_temperature_celsius)?;
        register(&registry, &pve_disk_temperature_celsius)?;
        register(&registry, &pve_io_delay_ms)?;
        register(&registry, &pve_last_collect_timestamp_seconds)?;
        register(&registry, &pve_operations_total)?;
        register(&registry, &pve_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            pve_host_up,
            pve_cpu_usage_percent,
            pve_load_average,
            pve_memory_total_mb,
            pve_memory_usage_percent,
            pve_swap_usage_percent,
            pve_disk_total_mb,
            pve_disk_usage_percent,
            pve_cpu_temperature_celsius,
            pve_disk_temperature_celsius,
            pve_io_delay_ms,
            pve_last_collect_timestamp_seconds,
            pve_operations_total,
            pve_scrape_count_total,
        }))
    }

    // Undetermined metrics are removed, not zeroed.
    pub fn update_from_snapshot(&self, host: &str, snapshot: &StatusSnapshot) {
        self.pve_host_up
            .with_label_values(&[host])
            .set(if snapshot.online { 1.0 } else { 0.0 });
        self.pve_last_collect_timestamp_seconds
            .with_label_values(&[host])
            .set(now_unix() as f64);

        set_or_clear(&self.pve_cpu_usage_percent, host, snapshot.cpu_usage);
        set_or_clear(
            &self.pve_memory_total_mb,
            host,
            snapshot.mem_total.map(|v| v as f64),
        );
        set_or_clear(&self.pve_memory_usage_percent, host, snapshot.mem_usage);
        set_or_clear(&self.pve_swap_usage_percent, host, snapshot.swap_usage);
        set_or_clear(
            &self.pve_disk_total_mb,
            host,
            snapshot.disk_total.map(|v| v as f64),
        );
        set_or_clear(&self.pve_disk_usage_percent, host, snapshot.disk_usage);
        set_or_clear(&self.pve_cpu_temperature_celsius, host, snapshot.cpu_temp);
        set_or_clear(
            &self.pve_disk_temperature_celsius,
            host,
            snapshot.disk_temp.map(|v| v as f64),
        );
        set_or_clear(&self.pve_io_delay_ms, host, snapshot.io_delay);

        for (i, window) in ["1m", "5m", "15m"].into_iter().enumerate() {
            match snapshot.load_avg {
                Some(load) => self
                    .pve_load_average
                    .with_label_values(&[host, window])
                    .set(load[i]),
                None => {
                    let _ = self.pve_load_average.remove_label_values(&[host, window]);
                }
            }
        }
    }

    pub fn inc_operation(&self, operation: &str, ok: bool) {
        self.pve_operations_total
            .with_label_values(&[operation, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.pve_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn set_or_clear(gauge: &GaugeVec, host: &str, value: Option<f64>) {
    match value {
        Some(v) => gauge.with_label_values(&[host]).set(v),
        None => {
            let _ = gauge.remove_label_values(&[host]);
        }
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
