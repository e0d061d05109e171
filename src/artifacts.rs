use crate::collectors::round_to;
use crate::session::{shell_quote, Connector, HostCredential, RemoteShell, SessionError};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const ISO_DIR: &str = "/var/lib/vz/template/iso";
pub const CT_DIR: &str = "/var/lib/vz/template/cache";

const ISO_EXTENSIONS: &[&str] = &[
    ".iso", ".img", ".raw", ".qcow2", ".vmdk", ".vdi", ".vhd", ".vhdx",
];
const CT_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.xz", ".tar.lzo", ".tar.zst", ".tgz", ".txz", ".tlz", ".tbz", ".tar.bz2",
];

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("недопустимое имя файла: {0:?}")]
    IllegalFilename(String),
    #[error("недопустимый URL: {0:?}")]
    IllegalUrl(String),
    #[error(transparent)]
    Session(SessionError),
    #[error("ошибка передачи: {0}")]
    Transfer(String),
    #[error("{0}")]
    Remote(String),
}

impl From<SessionError> for ArtifactError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transfer(msg) => Self::Transfer(msg),
            SessionError::Io(io) => Self::Transfer(io.to_string()),
            other => Self::Session(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArtifactKind {
    #[serde(rename = "iso")]
    DiskImage,
    #[serde(rename = "ct")]
    ContainerTemplate,
}

impl ArtifactKind {
    pub fn directory(self) -> &'static str {
        match self {
            Self::DiskImage => ISO_DIR,
            Self::ContainerTemplate => CT_DIR,
        }
    }

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::DiskImage => ISO_EXTENSIONS,
            Self::ContainerTemplate => CT_EXTENSIONS,
        }
    }

    pub fn matches(self, filename: &str) -> bool {
        let lower = filename.to_ascii_lowercase();
        self.extensions().iter().any(|ext| lower.ends_with(ext))
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DiskImage => "iso",
            Self::ContainerTemplate => "ct",
        })
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iso" | "disk-image" => Ok(Self::DiskImage),
            "ct" | "container-template" | "vztmpl" => Ok(Self::ContainerTemplate),
            other => Err(format!("неизвестный тип артефакта: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateArtifact {
    pub filename: String,
    pub kind: ArtifactKind,
    pub size_mb: f64,
    pub date: String,
}

// The name must survive as the path's final component unchanged.
pub fn remote_path(kind: ArtifactKind, filename: &str) -> Result<String, ArtifactError> {
    let illegal = || ArtifactError::IllegalFilename(filename.to_string());
    if filename.is_empty()
        || filename == "."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
        || filename.chars().any(char::is_control)
    {
        return Err(illegal());
    }
    let path = format!("{}/{filename}", kind.directory());
    match Path::new(&path).file_name().and_then(|n| n.to_str()) {
        Some(base) if base == filename => Ok(path),
        _ => Err(illegal()),
    }
}

fn validate_url(url: &str) -> Result<(), ArtifactError> {
    let scheme_ok = ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.to_ascii_lowercase().starts_with(scheme));
    if !scheme_ok || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ArtifactError::IllegalUrl(url.to_string()));
    }
    Ok(())
}

pub fn listing_command(kind: ArtifactKind) -> String {
    format!("ls -l --time-style='+%Y-%m-%d %H:%M:%S' {}", kind.directory())
}

fn listing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(-\S*)\s+\S+\s+\S+\s+\S+\s+(\d+)\s+(\S+)\s+(\S+)\s(.+)$")
            .expect("valid regex")
    })
}

pub fn parse_listing(text: &str, kind: ArtifactKind) -> Vec<TemplateArtifact> {
    let mut artifacts = Vec::new();
    for line in text.lines() {
        let Some(caps) = listing_re().captures(line.trim_end()) else {
            continue;
        };
        let filename = caps[5].to_string();
        if !kind.matches(&filename) {
            continue;
        }
        let Ok(bytes) = caps[2].parse::<u64>() else {
            continue;
        };
        artifacts.push(TemplateArtifact {
            filename,
            kind,
            size_mb: round_to(bytes as f64 / (1024.0 * 1024.0), 2),
            date: format!("{} {}", &caps[3], &caps[4]),
        });
    }
    artifacts
}

pub fn list(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
) -> Vec<TemplateArtifact> {
    let mut session = match connector.open(credential, timeout) {
        Ok(session) => session,
        Err(err) => {
            warn!(host = %credential.host, error = %err, "список шаблонов недоступен");
            return Vec::new();
        }
    };
    list_from(&mut *session)
}

pub fn list_from(shell: &mut dyn RemoteShell) -> Vec<TemplateArtifact> {
    let mut artifacts = Vec::new();
    for kind in [ArtifactKind::DiskImage, ArtifactKind::ContainerTemplate] {
        match shell.exec(&listing_command(kind)) {
            Ok(out) => artifacts.extend(parse_listing(&out.stdout, kind)),
            Err(err) => {
                warn!(dir = kind.directory(), error = %err, "не удалось прочитать каталог");
                return Vec::new();
            }
        }
    }
    artifacts
}

pub fn upload(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    local: &Path,
    filename: &str,
    kind: ArtifactKind,
) -> Result<(), ArtifactError> {
    let remote = remote_path(kind, filename)?;
    let mut session = connector.open(credential, timeout)?;
    session.set_command_timeout(None);
    session.file_channel()?.put(local, &remote)?;
    info!(host = %credential.host, remote = %remote, "файл загружен");
    Ok(())
}

pub fn download(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    filename: &str,
    kind: ArtifactKind,
    local: &Path,
) -> Result<(), ArtifactError> {
    let remote = remote_path(kind, filename)?;
    let mut session = connector.open(credential, timeout)?;
    session.set_command_timeout(None);
    session.file_channel()?.get(&remote, local)?;
    info!(host = %credential.host, remote = %remote, local = %local.display(), "файл скачан");
    Ok(())
}

pub fn delete(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    filename: &str,
    kind: ArtifactKind,
) -> Result<(), ArtifactError> {
    let remote = remote_path(kind, filename)?;
    let mut session = connector.open(credential, timeout)?;
    session.file_channel()?.remove(&remote)?;
    info!(host = %credential.host, remote = %remote, "файл удалён");
    Ok(())
}

pub fn fetch_command(remote: &str, url: &str) -> String {
    let (remote, url) = (shell_quote(remote), shell_quote(url));
    format!("wget -O {remote} {url} || curl -L -o {remote} {url}")
}

pub fn fetch_from_url(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    url: &str,
    filename: &str,
    kind: ArtifactKind,
) -> Result<(), ArtifactError> {
    let remote = remote_path(kind, filename)?;
    validate_url(url)?;
    let mut session = connector.open(credential, timeout)?;
    session.set_command_timeout(None);
    let out = session.exec(&fetch_command(&remote, url))?;
    if out.success() {
        info!(host = %credential.host, remote = %remote, "файл получен по URL");
        return Ok(());
    }
    let stderr = out.stderr.trim();
    Err(ArtifactError::Remote(if stderr.is_empty() {
        format!("загрузка не удалась, код выхода {}", out.exit_code)
    } else {
        stderr.to_string()
    }))
}
