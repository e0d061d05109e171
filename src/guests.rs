use crate::collectors::inventory::GuestKind;
use crate::session::{Connector, HostCredential, SessionError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

const MAX_VMID_DIGITS: usize = 9;

#[derive(Debug, Error)]
pub enum GuestError {
    #[error("некорректный vmid: {0:?}")]
    InvalidVmid(String),
    #[error("некорректное имя снимка: {0:?}")]
    InvalidSnapshotName(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("операция не выполнена: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestAction {
    Start,
    Stop,
    Reboot,
}

impl GuestAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
        }
    }
}

// Proxmox snapshot ids: a letter first, at most 40 characters.
fn snapshot_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,39}$").expect("valid regex"))
}

pub fn check_vmid(vmid: &str) -> Result<&str, GuestError> {
    let trimmed = vmid.trim();
    if trimmed.is_empty()
        || trimmed.len() > MAX_VMID_DIGITS
        || !trimmed.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(GuestError::InvalidVmid(vmid.to_string()));
    }
    Ok(trimmed)
}

pub fn snapshot_name(requested: Option<&str>) -> Result<String, GuestError> {
    match requested.map(str::trim).filter(|name| !name.is_empty()) {
        None => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Ok(format!("auto-{now}"))
        }
        Some(name) if snapshot_name_re().is_match(name) => Ok(name.to_string()),
        Some(name) => Err(GuestError::InvalidSnapshotName(name.to_string())),
    }
}

fn run(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    command: &str,
) -> Result<(), GuestError> {
    let mut session = connector.open(credential, timeout)?;
    let out = session.exec(command)?;
    if out.success() {
        return Ok(());
    }
    warn!(host = %credential.host, command, stderr = %out.stderr.trim(), "команда гостя завершилась с ошибкой");
    Err(GuestError::Remote(out.failure()))
}

pub fn guest_action(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    kind: GuestKind,
    vmid: &str,
    action: GuestAction,
) -> Result<(), GuestError> {
    let vmid = check_vmid(vmid)?;
    run(
        connector,
        credential,
        timeout,
        &format!("{} {} {vmid}", kind.tool(), action.as_str()),
    )?;
    info!(host = %credential.host, kind = kind.label(), vmid, action = action.as_str(), "команда гостю выполнена");
    Ok(())
}

pub fn snapshot(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    kind: GuestKind,
    vmid: &str,
    name: Option<&str>,
) -> Result<String, GuestError> {
    let vmid = check_vmid(vmid)?;
    let name = snapshot_name(name)?;
    run(
        connector,
        credential,
        timeout,
        &format!("{} snapshot {vmid} {name}", kind.tool()),
    )?;
    info!(host = %credential.host, kind = kind.label(), vmid, snapshot = %name, "снимок создан");
    Ok(name)
}
