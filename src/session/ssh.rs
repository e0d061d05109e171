use crate::session::{
    command_timeout, AuthMethod, CommandOutput, Connector, FileChannel, HostCredential,
    HostKeyPolicy, RemoteShell, Session, SessionError,
};
use base64::Engine;
use ssh2::{CheckResult, HashType, KnownHostFileKind};
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn open(
        &self,
        credential: &HostCredential,
        timeout: Duration,
    ) -> Result<Session, SessionError> {
        let addr = credential.address();
        let tcp = connect_tcp(credential, timeout)?;

        let mut session = ssh2::Session::new().map_err(|err| SessionError::Handshake {
            addr: addr.clone(),
            reason: err.to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(timeout));
        session
            .handshake()
            .map_err(|err| SessionError::Handshake {
                addr: addr.clone(),
                reason: err.to_string(),
            })?;

        verify_host_key(&session, credential)?;
        authenticate(&session, credential)?;

        session.set_timeout(millis(command_timeout(timeout)));
        debug!(host = %addr, user = %credential.username, "ssh session opened");
        Ok(Session::new(Box::new(SshShell {
            session,
            closed: false,
        })))
    }
}

fn millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

fn connect_tcp(credential: &HostCredential, timeout: Duration) -> Result<TcpStream, SessionError> {
    let addr = credential.address();
    let candidates = (credential.host.as_str(), credential.port)
        .to_socket_addrs()
        .map_err(|err| SessionError::Connect {
            addr: addr.clone(),
            reason: err.to_string(),
        })?;

    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout)).ok();
                tcp.set_write_timeout(Some(timeout)).ok();
                return Ok(tcp);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(SessionError::Connect {
        addr,
        reason: last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "адрес не разрешён".to_string()),
    })
}

fn fingerprint_sha256(session: &ssh2::Session) -> Option<String> {
    let hash = session.host_key_hash(HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{encoded}"))
}

// Pins may be written with base64 padding; libssh2 hashes are rendered without it.
fn fingerprint_matches(expected: &str, observed: &str) -> bool {
    let normalize = |value: &str| value.trim().trim_end_matches('=').to_string();
    let expected = normalize(expected);
    !expected.is_empty() && expected == normalize(observed)
}

fn verify_host_key(session: &ssh2::Session, credential: &HostCredential) -> Result<(), SessionError> {
    let observed = fingerprint_sha256(session);
    match &credential.host_key {
        HostKeyPolicy::Accept => {
            warn!(
                host = %credential.host,
                fingerprint = observed.as_deref().unwrap_or("unknown"),
                "ключ хоста принят без проверки"
            );
            Ok(())
        }
        HostKeyPolicy::Pin(expected) => match observed.as_deref() {
            Some(observed) if fingerprint_matches(expected, observed) => Ok(()),
            observed => Err(SessionError::HostKey(format!(
                "ожидался {}, получен {}",
                expected.trim(),
                observed.unwrap_or("unknown")
            ))),
        },
        HostKeyPolicy::KnownHosts(path) => {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| SessionError::HostKey("сервер не предъявил ключ".to_string()))?;
            let mut known = session
                .known_hosts()
                .map_err(|err| SessionError::HostKey(err.to_string()))?;
            known
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|err| {
                    SessionError::HostKey(format!("не удалось прочитать {}: {err}", path.display()))
                })?;
            match known.check_port(&credential.host, credential.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::Mismatch => Err(SessionError::HostKey(format!(
                    "ключ {} не совпадает с {}",
                    credential.host,
                    path.display()
                ))),
                CheckResult::NotFound => Err(SessionError::HostKey(format!(
                    "{} отсутствует в {}",
                    credential.host,
                    path.display()
                ))),
                CheckResult::Failure => Err(SessionError::HostKey(
                    "ошибка проверки known_hosts".to_string(),
                )),
            }
        }
    }
}

fn authenticate(session: &ssh2::Session, credential: &HostCredential) -> Result<(), SessionError> {
    let user = credential.username.as_str();
    let auth_err = |reason: String| SessionError::Auth {
        user: user.to_string(),
        reason,
    };

    match credential.auth_method() {
        AuthMethod::Key {
            material,
            passphrase,
        } => session
            .userauth_pubkey_memory(user, None, material, passphrase)
            .map_err(|err| auth_err(err.to_string()))?,
        AuthMethod::Password(password) => session
            .userauth_password(user, password)
            .map_err(|err| auth_err(err.to_string()))?,
        AuthMethod::None => return Err(auth_err("не задан ни пароль, ни ключ".to_string())),
    }

    if !session.authenticated() {
        return Err(auth_err("сервер отклонил учётные данные".to_string()));
    }
    Ok(())
}

struct SshShell {
    session: ssh2::Session,
    closed: bool,
}

impl RemoteShell for SshShell {
    fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        let channel_err = |err: ssh2::Error| SessionError::Channel(err.to_string());

        let mut channel = self.session.channel_session().map_err(channel_err)?;
        channel.exec(command).map_err(channel_err)?;

        let interrupted = |err: &dyn std::fmt::Display| SessionError::Interrupted(err.to_string());
        let mut stdout = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|err| interrupted(&err))?;
        let mut stderr = Vec::new();
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|err| interrupted(&err))?;
        channel.wait_close().map_err(|err| interrupted(&err))?;
        let exit_code = channel.exit_status().map_err(|err| interrupted(&err))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn file_channel(&mut self) -> Result<Box<dyn FileChannel + '_>, SessionError> {
        let sftp = self
            .session
            .sftp()
            .map_err(|err| SessionError::Transfer(err.to_string()))?;
        Ok(Box::new(SftpChannel { sftp }))
    }

    fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.session.set_timeout(timeout.map_or(0, millis));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.session.disconnect(None, "pvewatch: session done", None) {
            debug!(error = %err, "ssh disconnect failed");
        }
    }
}

struct SftpChannel {
    sftp: ssh2::Sftp,
}

impl FileChannel for SftpChannel {
    fn put(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let mut source = File::open(local)?;
        let mut target = self
            .sftp
            .create(Path::new(remote))
            .map_err(|err| SessionError::Transfer(format!("{remote}: {err}")))?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path) -> Result<(), SessionError> {
        let mut source = self
            .sftp
            .open(Path::new(remote))
            .map_err(|err| SessionError::Transfer(format!("{remote}: {err}")))?;
        let mut target = File::create(local)?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    fn remove(&mut self, remote: &str) -> Result<(), SessionError> {
        self.sftp
            .unlink(Path::new(remote))
            .map_err(|err| SessionError::Transfer(format!("{remote}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_fingerprint_ignores_base64_padding() {
        let observed = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert!(fingerprint_matches(
            "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8=",
            observed
        ));
        assert!(fingerprint_matches(
            "  SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8\n",
            observed
        ));
    }

    #[test]
    fn different_or_empty_pin_is_rejected() {
        let observed = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert!(!fingerprint_matches(
            "SHA256:AAAAg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8",
            observed
        ));
        assert!(!fingerprint_matches("sha256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8", observed));
        assert!(!fingerprint_matches("", ""));
        assert!(!fingerprint_matches("=", "="));
    }

    #[test]
    fn command_budget_is_passed_to_libssh2_in_millis() {
        assert_eq!(millis(Duration::from_secs(60)), 60_000);
        assert_eq!(millis(Duration::MAX), u32::MAX);
    }
}
