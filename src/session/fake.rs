// The handler runs first, then the first rule whose pattern is a substring of
// the command. Unmatched commands succeed with empty output.

use crate::session::{
    CommandOutput, Connector, FileChannel, HostCredential, RemoteShell, Session, SessionError,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = Arc<dyn Fn(&str) -> Option<Result<CommandOutput, String>> + Send + Sync>;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    Fail(String),
    Hangup,
}

#[derive(Clone, Default)]
pub struct FakeShell {
    rules: Arc<Vec<(String, Reply)>>,
    handler: Option<Handler>,
    transfer_error: Option<String>,
    log: Arc<Mutex<Vec<String>>>,
    timeouts: Arc<Mutex<Vec<Option<Duration>>>>,
    closed: Arc<AtomicUsize>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, pattern: &str, stdout: &str) -> Self {
        self.reply(
            pattern,
            CommandOutput {
                stdout: stdout.to_string(),
                ..CommandOutput::default()
            },
        )
    }

    pub fn on_stderr(self, pattern: &str, stderr: &str, exit_code: i32) -> Self {
        self.reply(
            pattern,
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        )
    }

    pub fn on_fail(self, pattern: &str, message: &str) -> Self {
        self.push(pattern, Reply::Fail(message.to_string()))
    }

    // The command is dispatched, then the connection drops before it reports back.
    pub fn on_hangup(self, pattern: &str) -> Self {
        self.push(pattern, Reply::Hangup)
    }

    pub fn reply(self, pattern: &str, output: CommandOutput) -> Self {
        self.push(pattern, Reply::Output(output))
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&str) -> Option<Result<CommandOutput, String>> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn failing_transfers(mut self, message: &str) -> Self {
        self.transfer_error = Some(message.to_string());
        self
    }

    fn push(mut self, pattern: &str, reply: Reply) -> Self {
        let mut rules = (*self.rules).clone();
        rules.push((pattern.to_string(), reply));
        self.rules = Arc::new(rules);
        self
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    pub fn close_count(&self) -> Arc<AtomicUsize> {
        self.closed.clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl RemoteShell for FakeShell {
    fn exec(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        self.record(command.to_string());

        if let Some(handler) = &self.handler {
            if let Some(result) = handler(command) {
                return result.map_err(SessionError::Channel);
            }
        }

        for (pattern, reply) in self.rules.iter() {
            if command.contains(pattern.as_str()) {
                return match reply {
                    Reply::Output(out) => Ok(out.clone()),
                    Reply::Fail(msg) => Err(SessionError::Channel(msg.clone())),
                    Reply::Hangup => Err(SessionError::Interrupted(
                        "connection reset by peer".to_string(),
                    )),
                };
            }
        }
        Ok(CommandOutput::default())
    }

    fn file_channel(&mut self) -> Result<Box<dyn FileChannel + '_>, SessionError> {
        Ok(Box::new(FakeFiles { shell: self }))
    }

    fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.timeouts.lock().unwrap().push(timeout);
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeFiles<'a> {
    shell: &'a FakeShell,
}

impl FakeFiles<'_> {
    fn finish(&self, entry: String) -> Result<(), SessionError> {
        self.shell.record(entry);
        match &self.shell.transfer_error {
            Some(msg) => Err(SessionError::Transfer(msg.clone())),
            None => Ok(()),
        }
    }
}

impl FileChannel for FakeFiles<'_> {
    fn put(&mut self, local: &Path, remote: &str) -> Result<(), SessionError> {
        self.finish(format!("sftp put {} {remote}", local.display()))
    }

    fn get(&mut self, remote: &str, local: &Path) -> Result<(), SessionError> {
        self.finish(format!("sftp get {remote} {}", local.display()))
    }

    fn remove(&mut self, remote: &str) -> Result<(), SessionError> {
        self.finish(format!("sftp rm {remote}"))
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    shell: FakeShell,
    refuse: Option<String>,
    opened: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            refuse: None,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::new(FakeShell::new())
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.shell.log.lock().unwrap().clone()
    }

    pub fn timeout_changes(&self) -> Vec<Option<Duration>> {
        self.shell.timeouts.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.shell.closed.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(
        &self,
        credential: &HostCredential,
        _timeout: Duration,
    ) -> Result<Session, SessionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.refuse {
            return Err(SessionError::Connect {
                addr: credential.address(),
                reason: reason.clone(),
            });
        }
        Ok(Session::new(Box::new(self.shell.clone())))
    }
}

pub fn credential() -> HostCredential {
    HostCredential::with_password("pve.local", 22, "root", "secret")
}
