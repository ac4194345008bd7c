// appinapp-core/src/command.rs
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, warn};

use crate::module::RunHandle;

/// Commands starting with this run relative to the widget's own bundle folder.
pub const BUNDLE_RELATIVE_PREFIX: &str = "./";

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to run '{command}': {message}")]
    Spawn { command: String, message: String },
    #[error("'{command}' exited with {}: {}", exit_status(.code), .stderr.trim_end())]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Host command-execution service.
pub trait CommandExecutor: Send + Sync {
    /// Run `command`, returning stdout on success.
    fn run(&self, command: &str, work_dir: Option<&Path>) -> Result<String, CommandError>;
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl CommandExecutor for ShellExecutor {
    fn run(&self, command: &str, work_dir: Option<&Path>) -> Result<String, CommandError> {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = std::process::Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = std::process::Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = work_dir.filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        let output = cmd.output().map_err(|e| CommandError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(CommandError::Exit {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

/// Rewrite a `./script` command to an absolute path inside the bundle.
pub fn resolve_command(command: &str, bundle_dir: &Path) -> String {
    match command.strip_prefix(BUNDLE_RELATIVE_PREFIX) {
        Some(rest) => format!("{}/{}", bundle_dir.display(), rest),
        None => command.to_string(),
    }
}

/// What the widget sees of its command: last good output and last error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandState {
    pub output: String,
    pub error: Option<CommandError>,
}

impl CommandState {
    fn apply(&mut self, result: Result<String, CommandError>) {
        match result {
            Ok(output) => {
                self.output = output;
                self.error = None;
            }
            // keep the last good output on failure
            Err(error) => self.error = Some(error),
        }
    }
}

type Completion = Result<String, CommandError>;

/// Polling bridge between one mounted widget and the command executor.
///
/// The declared command runs once on mount and then once per elapsed
/// `refresh` interval, driven by `update(delta)`. Each invocation runs on its
/// own worker thread; results are applied on the next `update` in the order
/// they settle, so a slow invocation can land after a faster, later one.
pub struct CommandBridge {
    executor: Arc<dyn CommandExecutor>,
    bundle_dir: PathBuf,
    command: Option<String>,
    refresh: Option<Duration>,
    elapsed: Duration,
    mounted: bool,
    state: CommandState,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    pending: usize,
    invocations: u64,
}

impl CommandBridge {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        bundle_dir: impl Into<PathBuf>,
        command: Option<&str>,
        refresh: Option<Duration>,
    ) -> Self {
        let (tx, rx) = unbounded();
        Self {
            executor,
            bundle_dir: bundle_dir.into(),
            command: command.map(str::to_string),
            refresh: refresh.filter(|r| !r.is_zero()),
            elapsed: Duration::ZERO,
            mounted: false,
            state: CommandState::default(),
            tx,
            rx,
            pending: 0,
            invocations: 0,
        }
    }

    pub fn mount(&mut self) {
        if self.mounted {
            return;
        }
        self.mounted = true;
        self.elapsed = Duration::ZERO;
        if self.command.is_some() {
            self.dispatch();
        }
    }

    /// Apply settled results, then fire one invocation per elapsed interval.
    pub fn update(&mut self, delta: Duration) {
        self.drain();
        if !self.mounted || self.command.is_none() {
            return;
        }
        let Some(refresh) = self.refresh else {
            return;
        };

        self.elapsed += delta;
        while self.elapsed >= refresh {
            self.elapsed -= refresh;
            self.dispatch();
        }
    }

    /// Stop polling and forget state. Results still in flight are dropped.
    pub fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        let (tx, rx) = unbounded();
        self.tx = tx;
        self.rx = rx;
        self.pending = 0;
        self.state = CommandState::default();
        debug!(bundle = %self.bundle_dir.display(), "command polling stopped");
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn state(&self) -> &CommandState {
        &self.state
    }

    /// Invocations dispatched since construction.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }

    /// Block until every dispatched invocation has reported back.
    pub fn settle(&mut self) {
        while self.pending > 0 {
            match self.rx.recv_timeout(SETTLE_TIMEOUT) {
                Ok(result) => self.apply(result),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pending = self.pending, "command results did not settle");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// On-demand `run(cmd)` for widget code. Same `./` rule, runs inline.
    pub fn run_handle(&self) -> RunHandle {
        let executor = self.executor.clone();
        let bundle_dir = self.bundle_dir.clone();
        Arc::new(move |command: &str| {
            let resolved = resolve_command(command, &bundle_dir);
            debug!(command = %resolved, "manual widget command");
            executor.run(&resolved, Some(&bundle_dir))
        })
    }

    fn drain(&mut self) {
        while let Ok(result) = self.rx.try_recv() {
            self.apply(result);
        }
    }

    fn apply(&mut self, result: Completion) {
        self.pending = self.pending.saturating_sub(1);
        if let Err(e) = &result {
            warn!(error = %e, "widget command failed");
        }
        self.state.apply(result);
    }

    fn dispatch(&mut self) {
        let Some(command) = &self.command else {
            return;
        };
        let resolved = resolve_command(command, &self.bundle_dir);
        let executor = self.executor.clone();
        let bundle_dir = self.bundle_dir.clone();
        let tx = self.tx.clone();

        self.pending += 1;
        self.invocations += 1;
        debug!(command = %resolved, invocation = self.invocations, "dispatching widget command");

        thread::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| executor.run(&resolved, Some(&bundle_dir))))
                .unwrap_or_else(|_| {
                    Err(CommandError::Spawn {
                        command: resolved.clone(),
                        message: "executor panicked".to_string(),
                    })
                });
            // receiver is gone after unmount
            let _ = tx.send(result);
        });
    }
}

impl Drop for CommandBridge {
    fn drop(&mut self) {
        self.unmount();
    }
}
