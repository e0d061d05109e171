use crate::collectors::{parse_f64_loose, read_output, round_to};
use crate::session::RemoteShell;
use regex::Regex;
use std::fmt::Debug;
use std::sync::OnceLock;
use tracing::debug;

type ProbeFn<'a, T> = Box<dyn Fn(&mut dyn RemoteShell) -> Option<T> + 'a>;

pub struct Probe<'a, T> {
    pub method: &'static str,
    run: ProbeFn<'a, T>,
}

impl<'a, T> Probe<'a, T> {
    pub fn new(method: &'static str, run: impl Fn(&mut dyn RemoteShell) -> Option<T> + 'a) -> Self {
        Self {
            method,
            run: Box::new(run),
        }
    }
}

pub fn first_value<T: Debug>(
    shell: &mut dyn RemoteShell,
    metric: &str,
    chain: &[Probe<'_, T>],
) -> Option<T> {
    for probe in chain {
        if let Some(value) = (probe.run)(shell) {
            debug!(metric, method = probe.method, value = ?value, "метрика получена");
            return Some(value);
        }
        debug!(metric, method = probe.method, "метод не дал значения");
    }
    None
}

pub const SENSORS_CMD: &str =
    "sensors 2>/dev/null | grep -E '(Core 0|Tctl|CPU Temperature|Package id)' | head -1";
pub const THERMAL_ZONE_CMD: &str = "cat /sys/class/thermal/thermal_zone*/temp 2>/dev/null | head -1";
pub const VCGENCMD_CMD: &str = "vcgencmd measure_temp 2>/dev/null";
pub const BLOCK_DEVICE_CMD: &str =
    "lsblk -dn -o NAME,TYPE 2>/dev/null | grep -E 'disk' | head -1 | awk '{print $1}'";
pub const IOSTAT_CMD: &str = "iostat -x 1 1 2>/dev/null | grep -v '^$' | tail -n +4 | awk 'NF>=10 {sum+=$10; count++} END {if(count>0 && sum>0) print sum/count; else print 0}'";
pub const PROC_STAT_CMD: &str = "grep '^cpu ' /proc/stat | head -1";

const FALLBACK_DEVICE: &str = "sda";
const MAX_IO_DELAY_MS: f64 = 10_000.0;
// 1% of CPU time in iowait is taken as roughly 10 ms of latency.
const IOWAIT_MS_PER_PERCENT: f64 = 10.0;
const MIN_IOWAIT_ESTIMATE_MS: f64 = 0.1;

fn sensors_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+?(\d+(?:\.\d+)?)\s*°?C").expect("valid regex"))
}

fn vcgencmd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"temp=(\d+(?:\.\d+)?)").expect("valid regex"))
}

fn hddtemp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*°C").expect("valid regex"))
}

fn nvme_sensor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\s*(\d+)").expect("valid regex"))
}

fn plausible_celsius(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0 && v <= 130.0).then_some(v)
}

pub fn parse_sensors_line(text: &str) -> Option<f64> {
    let caps = sensors_re().captures(text)?;
    plausible_celsius(parse_f64_loose(&caps[1])?)
}

// Thermal zones report millidegrees.
pub fn parse_thermal_zone(text: &str) -> Option<f64> {
    let raw = text.lines().next()?.trim().parse::<i64>().ok()?;
    plausible_celsius(round_to(raw as f64 / 1000.0, 1))
}

pub fn parse_vcgencmd(text: &str) -> Option<f64> {
    let caps = vcgencmd_re().captures(text)?;
    plausible_celsius(parse_f64_loose(&caps[1])?)
}

pub fn cpu_temp_chain<'a>() -> Vec<Probe<'a, f64>> {
    vec![
        Probe::new("sensors", |shell| {
            parse_sensors_line(&read_output(shell, SENSORS_CMD)?)
        }),
        Probe::new("thermal_zone", |shell| {
            parse_thermal_zone(&read_output(shell, THERMAL_ZONE_CMD)?)
        }),
        Probe::new("vcgencmd", |shell| {
            parse_vcgencmd(&read_output(shell, VCGENCMD_CMD)?)
        }),
    ]
}

pub fn cpu_temp(shell: &mut dyn RemoteShell) -> Option<f64> {
    first_value(shell, "cpu_temp", &cpu_temp_chain())
}

pub fn first_block_device(shell: &mut dyn RemoteShell) -> String {
    read_output(shell, BLOCK_DEVICE_CMD)
        .and_then(|out| out.lines().next().map(|l| l.trim().to_string()))
        .filter(|name| is_device_name(name))
        .unwrap_or_else(|| FALLBACK_DEVICE.to_string())
}

fn is_device_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_whole_number(text: &str) -> Option<i64> {
    text.lines().next()?.trim().parse::<i64>().ok()
}

pub fn smartctl_command(device: &str) -> String {
    if device.starts_with("nvme") {
        format!("smartctl -A /dev/{device} 2>/dev/null | grep -i 'Temperature:' | head -1 | awk '{{print $2}}'")
    } else {
        format!("smartctl -A /dev/{device} 2>/dev/null | grep -i 'Temperature_Celsius' | awk '{{print $10}}' | head -1")
    }
}

pub fn parse_hddtemp(text: &str) -> Option<i64> {
    let caps = hddtemp_re().captures(text)?;
    caps[1].parse().ok()
}

pub fn parse_nvme_sensor(text: &str) -> Option<i64> {
    let caps = nvme_sensor_re().captures(text)?;
    caps[1].parse().ok()
}

pub fn disk_temp_chain(device: &str) -> Vec<Probe<'_, i64>> {
    let nvme = device.starts_with("nvme");
    vec![
        Probe::new("smartctl", move |shell| {
            parse_whole_number(&read_output(shell, &smartctl_command(device))?)
        }),
        Probe::new("hddtemp", move |shell| {
            if nvme {
                return None;
            }
            parse_hddtemp(&read_output(shell, &format!("hddtemp /dev/{device} 2>/dev/null"))?)
        }),
        Probe::new("smartctl_nvme_sensor", move |shell| {
            if !nvme {
                return None;
            }
            let cmd = format!(
                "smartctl -a /dev/{device} 2>/dev/null | grep -i 'temperature sensor' | head -1"
            );
            parse_nvme_sensor(&read_output(shell, &cmd)?)
        }),
    ]
}

pub fn disk_temp(shell: &mut dyn RemoteShell) -> Option<i64> {
    let device = first_block_device(shell);
    let chain = disk_temp_chain(&device);
    first_value(shell, "disk_temp", &chain)
}

pub fn parse_iostat_await(text: &str) -> Option<f64> {
    let v = parse_f64_loose(text.lines().next()?)?;
    (v > 0.0 && v < MAX_IO_DELAY_MS).then(|| round_to(v, 2))
}

pub fn estimate_from_proc_stat(line: &str) -> Option<f64> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 || parts[0] != "cpu" {
        return None;
    }
    let iowait = parts[5].parse::<u64>().ok()?;
    let total: u64 = parts[1..].iter().filter_map(|p| p.parse::<u64>().ok()).sum();
    if total == 0 || iowait == 0 {
        return None;
    }
    let estimate = iowait as f64 / total as f64 * 100.0 * IOWAIT_MS_PER_PERCENT;
    (estimate > MIN_IOWAIT_ESTIMATE_MS).then(|| round_to(estimate, 2))
}

pub fn io_delay_chain<'a>() -> Vec<Probe<'a, f64>> {
    vec![
        Probe::new("iostat", |shell| {
            parse_iostat_await(&read_output(shell, IOSTAT_CMD)?)
        }),
        Probe::new("proc_stat_iowait", |shell| {
            estimate_from_proc_stat(&read_output(shell, PROC_STAT_CMD)?)
        }),
    ]
}

pub fn io_delay(shell: &mut dyn RemoteShell) -> Option<f64> {
    first_value(shell, "io_delay", &io_delay_chain())
}
