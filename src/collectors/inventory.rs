use crate::collectors::read_output;
use crate::session::{Connector, HostCredential, RemoteShell, SessionError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("команда списка завершилась с ошибкой: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Vm,
    Container,
}

impl GuestKind {
    pub fn tool(self) -> &'static str {
        match self {
            Self::Vm => "qm",
            Self::Container => "pct",
        }
    }

    fn list_command(self) -> String {
        format!("{} list", self.tool())
    }

    fn config_command(self, vmid: &str) -> String {
        format!("{} config {vmid}", self.tool())
    }

    fn name_key(self) -> &'static str {
        match self {
            Self::Vm => "name:",
            Self::Container => "hostname:",
        }
    }

    fn api_segment(self) -> &'static str {
        match self {
            Self::Vm => "qemu",
            Self::Container => "lxc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Vm => "VM",
            Self::Container => "LXC",
        }
    }
}

impl FromStr for GuestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vm" | "qemu" => Ok(Self::Vm),
            "ct" | "lxc" | "container" => Ok(Self::Container),
            other => Err(format!("неизвестный тип гостя: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryItem {
    pub vmid: String,
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub lock: String,
    pub uptime: u64,
    pub cpu: String,
    pub mem: String,
    pub maxmem: String,
    pub disk: String,
    pub maxdisk: String,
    pub pid: String,
    pub netin: String,
    pub netout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxswap: Option<String>,
    pub kind: GuestKind,
    pub tags: String,
}

pub fn list(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    kind: GuestKind,
) -> Result<Vec<InventoryItem>, InventoryError> {
    let mut session = connector.open(credential, timeout).map_err(|err| {
        warn!(host = %credential.host, error = %err, "хост недоступен");
        err
    })?;
    list_from(&mut *session, kind)
}

pub fn list_from(
    shell: &mut dyn RemoteShell,
    kind: GuestKind,
) -> Result<Vec<InventoryItem>, InventoryError> {
    let node = read_output(shell, "hostname").unwrap_or_else(|| "localhost".to_string());

    let listing = shell.exec(&kind.list_command())?;
    if !listing.success() && listing.stdout.trim().is_empty() {
        return Err(InventoryError::Remote(listing.stderr.trim().to_string()));
    }

    let rows = parse_listing(&listing.stdout, kind);
    let mut items = Vec::with_capacity(rows.len());
    for mut item in rows {
        if is_vmid(&item.vmid) {
            enrich_from_config(shell, kind, &mut item);
            item.uptime = query_uptime(shell, &node, kind, &item.vmid);
        }
        items.push(item);
    }
    debug!(kind = kind.label(), count = items.len(), "инвентарь собран");
    Ok(items)
}

fn is_vmid(vmid: &str) -> bool {
    !vmid.is_empty() && vmid.bytes().all(|b| b.is_ascii_digit())
}

fn paren_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\)").expect("valid regex"))
}

// Headings such as `MEM(MB)` are also reachable by the stem in front of the unit.
fn header_keys(header: &str) -> Vec<String> {
    header
        .split_whitespace()
        .map(|h| h.to_ascii_lowercase())
        .collect()
}

fn row_fields(keys: &[String], line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for (key, value) in keys.iter().zip(line.split_whitespace()) {
        if let Some((stem, _)) = key.split_once('(') {
            fields
                .entry(stem.to_string())
                .or_insert_with(|| value.to_string());
        }
        fields.insert(key.clone(), value.to_string());
    }
    fields
}

fn present(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "-")
        .map(str::to_string)
}

pub fn parse_listing(text: &str, kind: GuestKind) -> Vec<InventoryItem> {
    let mut lines = text.lines();
    let keys = match lines.next() {
        Some(header) if !header.trim().is_empty() => header_keys(header),
        _ => return Vec::new(),
    };

    let mut items = Vec::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let fields = row_fields(&keys, line);
        let field = |key: &str| fields.get(key).cloned().unwrap_or_default();
        let vmid = field("vmid");

        let name = paren_name_re()
            .captures(line)
            .map(|caps| caps[1].to_string())
            .or_else(|| present(fields.get("name")))
            .unwrap_or_else(|| format!("{}-{vmid}", kind.label()));

        let (swap, maxswap) = match kind {
            GuestKind::Container => (Some(field("swap")), Some(field("maxswap"))),
            GuestKind::Vm => (None, None),
        };
        let (netin, netout) = match kind {
            GuestKind::Container => (field("netin"), field("netout")),
            GuestKind::Vm => (String::new(), String::new()),
        };

        items.push(InventoryItem {
            display_name: name.clone(),
            name,
            status: field("status"),
            lock: field("lock"),
            uptime: 0,
            cpu: field("cpu"),
            mem: field("mem"),
            maxmem: field("maxmem"),
            disk: field("disk"),
            maxdisk: field("maxdisk"),
            pid: field("pid"),
            netin,
            netout,
            swap,
            maxswap,
            kind,
            tags: String::new(),
            vmid,
        });
    }
    items
}

fn config_value<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    config
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn enrich_from_config(shell: &mut dyn RemoteShell, kind: GuestKind, item: &mut InventoryItem) {
    let Some(config) = read_output(shell, &kind.config_command(&item.vmid)) else {
        return;
    };
    if let Some(name) = config_value(&config, kind.name_key()) {
        item.display_name = name.to_string();
    }
    if let Some(tags) = config_value(&config, "tags:") {
        item.tags = tags.to_string();
    }
}

#[derive(Debug, Deserialize)]
struct CurrentStatus {
    #[serde(default)]
    uptime: Option<serde_json::Value>,
}

pub fn parse_uptime(json: &str) -> u64 {
    let Ok(status) = serde_json::from_str::<CurrentStatus>(json) else {
        return 0;
    };
    match status.uptime {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
            .unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn query_uptime(shell: &mut dyn RemoteShell, node: &str, kind: GuestKind, vmid: &str) -> u64 {
    let command = format!(
        "/usr/bin/pvesh get /nodes/{node}/{}/{vmid}/status/current --output-format json",
        kind.api_segment()
    );
    read_output(shell, &command)
        .map(|out| parse_uptime(&out))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{credential, FakeConnector, FakeShell};
    use crate::session::CommandOutput;

    const QM_LIST: &str = "      VMID NAME                 STATUS     MEM(MB)    BOOTDISK(GB) PID
       100 web                  running    2048              32.00 1234
       101 db                   stopped    4096              64.00 0";

    #[test]
    fn dash_name_falls_back_to_synthesized_label() {
        let items = parse_listing("VMID NAME STATUS\n101 - running", GuestKind::Vm);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].vmid, "101");
        assert_eq!(items[0].display_name, "VM-101");
        assert_eq!(items[0].status, "running");
    }

    #[test]
    fn parenthesized_name_wins_over_name_column() {
        let items = parse_listing(
            "VMID STATUS NAME\n200 running (frontend) ignored",
            GuestKind::Container,
        );
        assert_eq!(items[0].name, "frontend");
        assert_eq!(items[0].display_name, "frontend");
    }

    #[test]
    fn unit_headings_resolve_by_stem() {
        let items = parse_listing(QM_LIST, GuestKind::Vm);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "web");
        assert_eq!(items[0].mem, "2048");
        assert_eq!(items[0].pid, "1234");
        assert_eq!(items[1].status, "stopped");
        assert!(items[0].netin.is_empty());
        assert_eq!(items[0].swap, None);
    }

    #[test]
    fn header_only_listing_is_empty() {
        assert!(parse_listing("VMID NAME STATUS", GuestKind::Vm).is_empty());
        assert!(parse_listing("", GuestKind::Vm).is_empty());
    }

    #[test]
    fn uptime_accepts_numbers_and_strings() {
        assert_eq!(parse_uptime(r#"{"uptime": 3600, "status": "running"}"#), 3600);
        assert_eq!(parse_uptime(r#"{"uptime": "120"}"#), 120);
        assert_eq!(parse_uptime(r#"{"status": "stopped"}"#), 0);
        assert_eq!(parse_uptime("not json"), 0);
    }

    #[test]
    fn enrichment_and_uptime_failures_keep_items() {
        let shell = FakeShell::new()
            .on("hostname", "pve1")
            .on("qm list", QM_LIST)
            .on("qm config 100", "boot: order=scsi0\nname: web-prod\ntags: prod;web")
            .on_fail("qm config 101", "channel closed")
            .on("/nodes/pve1/qemu/100/", r#"{"uptime": 86400}"#)
            .on("/nodes/pve1/qemu/101/", "Configuration file does not exist");
        let connector = FakeConnector::new(shell);

        let items = list(&connector, &credential(), Duration::from_secs(5), GuestKind::Vm).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].display_name, "web-prod");
        assert_eq!(items[0].tags, "prod;web");
        assert_eq!(items[0].uptime, 86400);
        assert_eq!(items[1].display_name, "db");
        assert_eq!(items[1].tags, "");
        assert_eq!(items[1].uptime, 0);
        assert_eq!(connector.closed(), 1);
    }

    #[test]
    fn container_hostname_overrides_display_name() {
        let shell = FakeShell::new()
            .on("hostname", "pve1")
            .on(
                "pct list",
                "VMID       Status     Lock         Name\n300        running    backup       ct300",
            )
            .on("pct config 300", "arch: amd64\nhostname: mail\nswap: 512")
            .on("/nodes/pve1/lxc/300/", r#"{"uptime": 42}"#);
        let connector = FakeConnector::new(shell);

        let items = list(
            &connector,
            &credential(),
            Duration::from_secs(5),
            GuestKind::Container,
        )
        .unwrap();

        assert_eq!(items[0].name, "ct300");
        assert_eq!(items[0].lock, "backup");
        assert_eq!(items[0].display_name, "mail");
        assert_eq!(items[0].uptime, 42);
        assert_eq!(items[0].kind, GuestKind::Container);
        assert_eq!(items[0].swap.as_deref(), Some(""));
    }

    #[test]
    fn failing_listing_is_an_error() {
        let shell = FakeShell::new().reply(
            "qm list",
            CommandOutput {
                stdout: String::new(),
                stderr: "qm: command not found".to_string(),
                exit_code: 127,
            },
        );
        let connector = FakeConnector::new(shell);
        let err = list(&connector, &credential(), Duration::from_secs(5), GuestKind::Vm)
            .unwrap_err();
        assert!(matches!(err, InventoryError::Remote(msg) if msg.contains("not found")));
    }

    #[test]
    fn unreachable_host_is_a_session_error() {
        let connector = FakeConnector::unreachable("timed out");
        let err = list(&connector, &credential(), Duration::from_secs(5), GuestKind::Vm)
            .unwrap_err();
        assert!(matches!(err, InventoryError::Session(SessionError::Connect { .. })));
    }
}
