use crate::session::{HostCredential, HostKeyPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    #[serde(default = "default_status_timeout")]
    pub status_timeout: String,
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub host_key: HostKeyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyMode {
    #[default]
    Accept,
    KnownHosts,
    Pin,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostKeyConfig {
    #[serde(default)]
    pub policy: HostKeyMode,
    #[serde(default)]
    pub known_hosts_path: Option<String>,
    #[serde(default)]
    pub fingerprint_sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HousekeepingConfig {
    #[serde(default = "default_journal_days")]
    pub journal_days: Option<u32>,
    #[serde(default = "default_log_dirs")]
    pub log_dirs: BTreeMap<String, usize>,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            journal_days: default_journal_days(),
            log_dirs: default_log_dirs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        parse_timeout("connect_timeout", &self.connect_timeout)?;
        parse_timeout("status_timeout", &self.status_timeout)?;

        if self.hosts.is_empty() {
            return Err(ConfigError::Validation(
                "нужно описать хотя бы один хост в hosts".to_string(),
            ));
        }
        validate_hosts(&self.hosts)?;
        validate_housekeeping(&self.housekeeping)?;

        Ok(())
    }

    pub fn connect_timeout(&self) -> Result<Duration, ConfigError> {
        parse_timeout("connect_timeout", &self.connect_timeout)
    }

    pub fn status_timeout(&self) -> Result<Duration, ConfigError> {
        parse_timeout("status_timeout", &self.status_timeout)
    }

    pub fn find_host(&self, name: Option<&str>) -> Option<&HostConfig> {
        match name {
            Some(name) => self.hosts.iter().find(|h| h.name == name),
            None => self.hosts.first(),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl HostConfig {
    pub fn credential(&self) -> Result<HostCredential, ConfigError> {
        let private_key = match &self.private_key_path {
            Some(path) => Some(fs::read_to_string(expand_home(path)).map_err(|source| {
                ConfigError::Read {
                    path: path.clone(),
                    source,
                }
            })?),
            None => None,
        };

        let password = match (&self.password, &self.password_env) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(env)) => match std::env::var(env) {
                Ok(value) if !value.is_empty() => Some(value),
                _ if private_key.is_some() => None,
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "hosts '{}': переменная окружения {env} не задана",
                        self.name
                    )))
                }
            },
            (None, None) => None,
        };

        Ok(HostCredential {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password,
            private_key,
            passphrase: self.private_key_passphrase.clone(),
            host_key: self.host_key_policy(),
        })
    }

    fn host_key_policy(&self) -> HostKeyPolicy {
        match self.host_key.policy {
            HostKeyMode::Accept => HostKeyPolicy::Accept,
            HostKeyMode::KnownHosts => HostKeyPolicy::KnownHosts(
                self.host_key
                    .known_hosts_path
                    .as_deref()
                    .map(expand_home)
                    .unwrap_or_else(default_known_hosts),
            ),
            HostKeyMode::Pin => HostKeyPolicy::Pin(
                self.host_key
                    .fingerprint_sha256
                    .clone()
                    .unwrap_or_default(),
            ),
        }
    }
}

fn parse_timeout(field: &str, value: &str) -> Result<Duration, ConfigError> {
    let duration = humantime::parse_duration(value.trim()).map_err(|err| {
        ConfigError::Validation(format!("{field}: некорректная длительность '{value}': {err}"))
    })?;
    if duration.is_zero() {
        return Err(ConfigError::Validation(format!("{field} должен быть > 0")));
    }
    Ok(duration)
}

fn validate_hosts(hosts: &[HostConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for host in hosts {
        if host.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*].name не должен быть пустым".to_string(),
            ));
        }
        if !names.insert(host.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "имя хоста '{}' должно быть уникальным",
                host.name
            )));
        }
        if host.host.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "hosts '{}' host не должен быть пустым",
                host.name
            )));
        }
        if host.port == 0 {
            return Err(ConfigError::Validation(format!(
                "hosts '{}' port должен быть в диапазоне 1..65535",
                host.name
            )));
        }
        if host.username.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "hosts '{}' username не должен быть пустым",
                host.name
            )));
        }
        if host.password.is_none() && host.password_env.is_none() && host.private_key_path.is_none()
        {
            return Err(ConfigError::Validation(format!(
                "hosts '{}': нужен password, password_env или private_key_path",
                host.name
            )));
        }
        if host.host_key.policy == HostKeyMode::Pin {
            let pinned = host.host_key.fingerprint_sha256.as_deref().unwrap_or("");
            if !pinned.starts_with("SHA256:") {
                return Err(ConfigError::Validation(format!(
                    "hosts '{}': для policy pin нужен fingerprint_sha256 вида SHA256:...",
                    host.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_housekeeping(cfg: &HousekeepingConfig) -> Result<(), ConfigError> {
    for dir in cfg.log_dirs.keys() {
        if !dir.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "housekeeping.log_dirs: путь '{dir}' должен быть абсолютным"
            )));
        }
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn default_known_hosts() -> PathBuf {
    expand_home("~/.ssh/known_hosts")
}

fn default_listen() -> String {
    "127.0.0.1:9120".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_status_timeout() -> String {
    "5s".to_string()
}

const fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

const fn default_journal_days() -> Option<u32> {
    Some(7)
}

fn default_log_dirs() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("/var/log/vzdump".to_string(), 0),
        ("/var/log/pve".to_string(), 0),
    ])
}
