use crate::session::{shell_quote, Connector, HostCredential, RemoteShell, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DUMP_DIR: &str = "/var/lib/vz/dump";
pub const JOURNAL_KEY: &str = "journal";

const COUNT_TMP_CMD: &str = "ls -1d /var/lib/vz/dump/*.tmp 2>/dev/null | wc -l";
const REMOVE_TMP_CMD: &str = "rm -rf /var/lib/vz/dump/*.tmp";
const VACUUM_DONE_MARKER: &str = "Vacuuming done";
const IS_DIRECTORY: &str = "Is a directory";

#[derive(Debug, Error)]
pub enum HousekeepingError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("команда завершилась с ошибкой: {0}")]
    Remote(String),
}

// `removed` is `None` for targets that cannot report a count (journal vacuum).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub removed: Option<u64>,
    pub error: Option<String>,
}

pub type CleanupReport = BTreeMap<String, CleanupOutcome>;

pub fn clean_temp(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
) -> CleanupOutcome {
    match connector.open(credential, timeout) {
        Ok(mut session) => clean_temp_on(&mut *session),
        Err(err) => {
            warn!(host = %credential.host, error = %err, "хост недоступен");
            CleanupOutcome {
                removed: Some(0),
                error: Some(err.to_string()),
            }
        }
    }
}

pub fn clean_temp_on(shell: &mut dyn RemoteShell) -> CleanupOutcome {
    let removed = shell
        .exec(COUNT_TMP_CMD)
        .ok()
        .and_then(|out| out.stdout.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let error = match shell.exec(REMOVE_TMP_CMD) {
        Ok(out) => Some(out.stderr.trim().to_string()).filter(|e| !e.is_empty()),
        Err(err) => Some(err.to_string()),
    };
    info!(removed, dir = DUMP_DIR, "временные файлы удалены");
    CleanupOutcome {
        removed: Some(removed),
        error,
    }
}

pub fn journal_command(days: Option<u32>) -> String {
    match days {
        Some(days) => format!("journalctl --vacuum-time={days}d"),
        None => "journalctl --rotate && journalctl --vacuum-time=1s".to_string(),
    }
}

pub fn clean_logs(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    journal_days: Option<u32>,
    log_dirs: &BTreeMap<String, usize>,
) -> Result<CleanupReport, HousekeepingError> {
    let mut session = connector.open(credential, timeout).map_err(|err| {
        warn!(host = %credential.host, error = %err, "хост недоступен");
        err
    })?;
    Ok(clean_logs_on(&mut *session, journal_days, log_dirs))
}

pub fn clean_logs_on(
    shell: &mut dyn RemoteShell,
    journal_days: Option<u32>,
    log_dirs: &BTreeMap<String, usize>,
) -> CleanupReport {
    let mut report = CleanupReport::new();
    report.insert(JOURNAL_KEY.to_string(), vacuum_journal(shell, journal_days));
    for (dir, keep) in log_dirs {
        let outcome = prune_dir(shell, dir, *keep);
        debug!(dir = %dir, removed = ?outcome.removed, error = ?outcome.error, "каталог журналов обработан");
        report.insert(dir.clone(), outcome);
    }
    report
}

fn vacuum_journal(shell: &mut dyn RemoteShell, days: Option<u32>) -> CleanupOutcome {
    let error = match shell.exec(&journal_command(days)) {
        Ok(out) => {
            let stderr = out.stderr.trim();
            if stderr.is_empty() || stderr.contains(VACUUM_DONE_MARKER) {
                None
            } else {
                Some(stderr.to_string())
            }
        }
        Err(err) => Some(err.to_string()),
    };
    CleanupOutcome {
        removed: None,
        error,
    }
}

// `entries` is newest first; a `keep` of zero selects everything.
pub fn entries_to_delete(entries: &[String], keep: usize) -> &[String] {
    if keep == 0 {
        entries
    } else {
        entries.get(keep..).unwrap_or_default()
    }
}

fn entry_path(dir: &str, entry: &str) -> String {
    if entry.starts_with('/') {
        entry.to_string()
    } else {
        format!("{}/{entry}", dir.trim_end_matches('/'))
    }
}

fn prune_dir(shell: &mut dyn RemoteShell, dir: &str, keep: usize) -> CleanupOutcome {
    let listing = match shell.exec(&format!("ls -1t {} 2>/dev/null", shell_quote(dir))) {
        Ok(out) => out.stdout,
        Err(err) => {
            return CleanupOutcome {
                removed: Some(0),
                error: Some(err.to_string()),
            }
        }
    };
    let entries: Vec<String> = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    let mut removed = 0;
    let mut error = None;
    for entry in entries_to_delete(&entries, keep) {
        let command = format!("rm -f {}", shell_quote(&entry_path(dir, entry)));
        match shell.exec(&command) {
            Ok(out) => {
                let stderr = out.stderr.trim();
                if stderr.is_empty() {
                    removed += 1;
                } else if !stderr.contains(IS_DIRECTORY) {
                    error = Some(stderr.to_string());
                }
            }
            Err(err) => error = Some(err.to_string()),
        }
    }
    CleanupOutcome {
        removed: Some(removed),
        error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Reboot,
    Shutdown,
}

impl PowerAction {
    pub fn command(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::Shutdown => "poweroff",
        }
    }
}

pub fn power(
    connector: &dyn Connector,
    credential: &HostCredential,
    timeout: Duration,
    action: PowerAction,
) -> Result<(), HousekeepingError> {
    let mut session = connector.open(credential, timeout)?;
    match session.exec(action.command()) {
        Ok(out) if !out.success() => return Err(HousekeepingError::Remote(out.failure())),
        Ok(_) => {}
        Err(SessionError::Interrupted(reason)) => {
            debug!(host = %credential.host, reason = %reason, "узел закрыл соединение после команды питания");
        }
        Err(err) => return Err(err.into()),
    }
    info!(host = %credential.host, action = action.command(), "команда питания отправлена");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{credential, FakeConnector, FakeShell};
    use crate::session::CommandOutput;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn dirs(entries: &[(&str, usize)]) -> BTreeMap<String, usize> {
        entries
            .iter()
            .map(|(dir, keep)| (dir.to_string(), *keep))
            .collect()
    }

    #[test]
    fn retention_window_selects_older_entries() {
        let entries: Vec<String> = ["c", "b", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(entries_to_delete(&entries, 0), &entries[..]);
        assert_eq!(entries_to_delete(&entries, 1), &entries[1..]);
        assert!(entries_to_delete(&entries, 5).is_empty());
    }

    #[test]
    fn second_temp_cleanup_finds_nothing() {
        let present = Arc::new(AtomicBool::new(true));
        let state = present.clone();
        let shell = FakeShell::new().with_handler(move |command| {
            if command.contains("wc -l") {
                let count = if state.load(Ordering::SeqCst) { "3" } else { "0" };
                return Some(Ok(CommandOutput {
                    stdout: format!("{count}\n"),
                    ..CommandOutput::default()
                }));
            }
            if command.starts_with("rm -rf") {
                state.store(false, Ordering::SeqCst);
            }
            None
        });
        let connector = FakeConnector::new(shell);

        let first = clean_temp(&connector, &credential(), TIMEOUT);
        let second = clean_temp(&connector, &credential(), TIMEOUT);

        assert_eq!(first, CleanupOutcome { removed: Some(3), error: None });
        assert_eq!(second, CleanupOutcome { removed: Some(0), error: None });
        assert!(!present.load(Ordering::SeqCst));
    }

    #[test]
    fn temp_cleanup_on_unreachable_host_reports_error() {
        let outcome = clean_temp(&FakeConnector::unreachable("refused"), &credential(), TIMEOUT);
        assert_eq!(outcome.removed, Some(0));
        assert!(outcome.error.unwrap().contains("refused"));
    }

    #[test]
    fn journal_vacuum_treats_done_marker_as_success() {
        let shell = FakeShell::new().on_stderr(
            "journalctl --vacuum-time=7d",
            "Vacuuming done, freed 0B of archived journals from /var/log/journal.",
            0,
        );
        let connector = FakeConnector::new(shell);
        let report = clean_logs(&connector, &credential(), TIMEOUT, Some(7), &BTreeMap::new()).unwrap();
        assert_eq!(report[JOURNAL_KEY], CleanupOutcome::default());
    }

    #[test]
    fn full_journal_vacuum_reports_unexpected_output() {
        let shell = FakeShell::new().on_stderr("journalctl --rotate", "Failed to rotate", 1);
        let connector = FakeConnector::new(shell);
        let report = clean_logs(&connector, &credential(), TIMEOUT, None, &BTreeMap::new()).unwrap();
        assert_eq!(report[JOURNAL_KEY].error.as_deref(), Some("Failed to rotate"));
        assert_eq!(report[JOURNAL_KEY].removed, None);
    }

    #[test]
    fn directories_are_pruned_independently() {
        let shell = FakeShell::new()
            .on("ls -1t '/var/log/a'", "a3.log\na2.log\na1.log")
            .on("ls -1t '/var/log/b'", "b2.log\nb1.log\nold")
            .on_stderr("rm -f '/var/log/a/", "rm: cannot remove: Permission denied", 1)
            .on_stderr("rm -f '/var/log/b/old'", "rm: cannot remove 'old': Is a directory", 1);
        let connector = FakeConnector::new(shell);

        let report = clean_logs(
            &connector,
            &credential(),
            TIMEOUT,
            Some(7),
            &dirs(&[("/var/log/a", 1), ("/var/log/b", 0)]),
        )
        .unwrap();

        let a = &report["/var/log/a"];
        assert_eq!(a.removed, Some(0));
        assert!(a.error.as_deref().unwrap().contains("Permission denied"));

        let b = &report["/var/log/b"];
        assert_eq!(b.removed, Some(2));
        assert_eq!(b.error, None);

        let commands = connector.commands();
        assert!(commands.contains(&"rm -f '/var/log/a/a2.log'".to_string()));
        assert!(!commands.contains(&"rm -f '/var/log/a/a3.log'".to_string()));
    }

    #[test]
    fn absolute_entries_are_removed_as_listed() {
        let shell = FakeShell::new().on("ls -1t '/var/log/dpkg.log'", "/var/log/dpkg.log");
        let connector = FakeConnector::new(shell);
        let report = clean_logs(
            &connector,
            &credential(),
            TIMEOUT,
            Some(7),
            &dirs(&[("/var/log/dpkg.log", 0)]),
        )
        .unwrap();
        assert_eq!(report["/var/log/dpkg.log"].removed, Some(1));
        assert!(connector
            .commands()
            .contains(&"rm -f '/var/log/dpkg.log'".to_string()));
    }

    #[test]
    fn clean_logs_on_unreachable_host_is_an_error() {
        let result = clean_logs(
            &FakeConnector::unreachable("timed out"),
            &credential(),
            TIMEOUT,
            Some(7),
            &BTreeMap::new(),
        );
        assert!(matches!(result, Err(HousekeepingError::Session(_))));
    }

    #[test]
    fn power_actions_map_to_commands() {
        let connector = FakeConnector::new(FakeShell::new());
        power(&connector, &credential(), TIMEOUT, PowerAction::Shutdown).unwrap();
        assert_eq!(connector.commands(), vec!["poweroff".to_string()]);

        let denied = FakeConnector::new(FakeShell::new().on_stderr("reboot", "permission denied", 1));
        let err = power(&denied, &credential(), TIMEOUT, PowerAction::Reboot).unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn reboot_that_drops_the_connection_counts_as_sent() {
        let connector = FakeConnector::new(FakeShell::new().on_hangup("reboot"));
        power(&connector, &credential(), TIMEOUT, PowerAction::Reboot).unwrap();
        assert_eq!(connector.commands(), vec!["reboot".to_string()]);

        let broken = FakeConnector::new(FakeShell::new().on_fail("poweroff", "channel open failed"));
        let err = power(&broken, &credential(), TIMEOUT, PowerAction::Shutdown).unwrap_err();
        assert!(matches!(err, HousekeepingError::Session(SessionError::Channel(_))));
    }
}
