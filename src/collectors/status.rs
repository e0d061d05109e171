use crate::collectors::probes;
use crate::collectors::{parse_f64_loose, read_output, round_to, usage_percent};
use crate::session::{Connector, HostCredential, RemoteShell};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

// `None` means the metric could not be determined on this host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub online: bool,
    pub error: String,
    pub cpu_usage: Option<f64>,
    pub load_avg: Option<[f64; 3]>,
    pub mem_total: Option<u64>,
    pub mem_used: Option<u64>,
    pub mem_usage: Option<f64>,
    pub swap_total: Option<u64>,
    pub swap_used: Option<u64>,
    pub swap_usage: Option<f64>,
    pub disk_total: Option<u64>,
    pub disk_used: Option<u64>,
    pub disk_usage: Option<f64>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<u32>,
    pub kernel: Option<String>,
    pub platform_version: Option<String>,
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub cpu_temp: Option<f64>,
    pub disk_temp: Option<i64>,
    pub io_delay: Option<f64>,
}

impl StatusSnapshot {
    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            online: false,
            error: error.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    pub percent: f64,
}

pub const CPU_CMD: &str = "top -bn1 | grep 'Cpu(s)'";
pub const LOADAVG_CMD: &str = "cat /proc/loadavg";
pub const FREE_CMD: &str = "free -m";
pub const DF_CMD: &str = "df -m / | tail -1";
pub const CPU_MODEL_CMD: &str = "lscpu | grep 'Model name'";
pub const NPROC_CMD: &str = "nproc";
pub const KERNEL_CMD: &str = "uname -r";
pub const VERSION_CMD: &str = "pveversion";
pub const HOSTNAME_CMD: &str = "hostname";
pub const IP_CMD: &str = "hostname -I";

pub fn collect(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
) -> StatusSnapshot {
    match connector.open(credential, timeout) {
        Ok(mut session) => collect_from(&mut *session),
        Err(err) => {
            warn!(host = %credential.host, error = %err, "хост недоступен");
            StatusSnapshot::offline(err.to_string())
        }
    }
}

pub fn collect_from(shell: &mut dyn RemoteShell) -> StatusSnapshot {
    let mut snapshot = StatusSnapshot {
        online: true,
        ..StatusSnapshot::default()
    };

    snapshot.cpu_usage = read_output(shell, CPU_CMD).and_then(|out| parse_cpu_usage(&out));
    snapshot.load_avg = read_output(shell, LOADAVG_CMD).and_then(|out| parse_load_avg(&out));

    if let Some(out) = read_output(shell, FREE_CMD) {
        if let Some(mem) = parse_free_line(&out, "Mem:") {
            snapshot.mem_total = Some(mem.total);
            snapshot.mem_used = Some(mem.used);
            snapshot.mem_usage = Some(mem.percent);
        }
        if let Some(swap) = parse_free_line(&out, "Swap:") {
            snapshot.swap_total = Some(swap.total);
            snapshot.swap_used = Some(swap.used);
            snapshot.swap_usage = Some(swap.percent);
        }
    }

    if let Some(disk) = read_output(shell, DF_CMD).and_then(|out| parse_df(&out)) {
        snapshot.disk_total = Some(disk.total);
        snapshot.disk_used = Some(disk.used);
        snapshot.disk_usage = Some(disk.percent);
    }

    snapshot.cpu_model = read_output(shell, CPU_MODEL_CMD).and_then(|out| parse_cpu_model(&out));
    snapshot.cpu_cores = read_output(shell, NPROC_CMD).and_then(|out| out.parse().ok());
    snapshot.kernel = read_output(shell, KERNEL_CMD);
    snapshot.platform_version = read_output(shell, VERSION_CMD);
    snapshot.hostname = read_output(shell, HOSTNAME_CMD);
    snapshot.ip = Some(first_routable_ip(
        read_output(shell, IP_CMD).as_deref().unwrap_or_default(),
    ));

    snapshot.cpu_temp = probes::cpu_temp(shell);
    snapshot.disk_temp = probes::disk_temp(shell);
    snapshot.io_delay = probes::io_delay(shell);

    debug!(
        hostname = snapshot.hostname.as_deref().unwrap_or("-"),
        cpu_temp = ?snapshot.cpu_temp,
        disk_temp = ?snapshot.disk_temp,
        io_delay = ?snapshot.io_delay,
        "снимок состояния собран"
    );
    snapshot
}

fn idle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*id").expect("valid regex"))
}

pub fn parse_cpu_usage(line: &str) -> Option<f64> {
    let caps = idle_re().captures(line)?;
    let idle = parse_f64_loose(&caps[1])?;
    Some(round_to(100.0 - idle, 2))
}

pub fn parse_load_avg(text: &str) -> Option<[f64; 3]> {
    let mut parts = text.split_whitespace().map(parse_f64_loose);
    Some([parts.next()??, parts.next()??, parts.next()??])
}

pub fn parse_free_line(text: &str, label: &str) -> Option<Usage> {
    let line = text.lines().find(|l| l.trim_start().starts_with(label))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    let total = parts.get(1)?.parse::<u64>().ok()?;
    let used = parts.get(2)?.parse::<u64>().ok()?;
    Some(Usage {
        total,
        used,
        percent: usage_percent(used, total),
    })
}

// The percentage column is taken as is.
pub fn parse_df(text: &str) -> Option<Usage> {
    let parts: Vec<&str> = text.lines().last()?.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    Some(Usage {
        total: parts[1].parse().ok()?,
        used: parts[2].parse().ok()?,
        percent: parse_f64_loose(parts[4].trim_end_matches('%'))?,
    })
}

pub fn parse_cpu_model(text: &str) -> Option<String> {
    let model = text.lines().next()?.rsplit(':').next()?.trim();
    (!model.is_empty()).then(|| model.to_string())
}

pub fn first_routable_ip(text: &str) -> String {
    text.split_whitespace()
        .find(|addr| !addr.starts_with("127."))
        .unwrap_or("-")
        .to_string()
}
