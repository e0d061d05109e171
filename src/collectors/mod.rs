pub mod inventory;
pub mod probes;
pub mod status;

use crate::session::RemoteShell;
use tracing::debug;

// A transport error and empty output both mean the metric is unavailable.
pub(crate) fn read_output(shell: &mut dyn RemoteShell, command: &str) -> Option<String> {
    match shell.exec(command) {
        Ok(out) => {
            let text = out.stdout.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }
        Err(err) => {
            debug!(command, error = %err, "команда не выполнена");
            None
        }
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

// An empty total (no swap) is 0%.
pub(crate) fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(used as f64 / total as f64 * 100.0, 2)
}

pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }
    trimmed.replace(',', ".").parse::<f64>().ok()
}
