use crate::item::Item;
use crate::value::FieldPath;
use log::{debug, warn};
use std::ffi::OsString;
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The target accepted the item (exit code 0, harness returned `Ok`).
    Success,
    /// The target rejected the item or crashed; carries a short description.
    Failure(String),
    Timeout,
    /// The target could not be run at all.
    Other(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: ExecutionStatus,
    pub output: ProcessOutput,
    pub elapsed: Duration,
}

impl RunResult {
    fn other(message: String, started: Instant) -> Self {
        warn!("{message}");
        Self {
            status: ExecutionStatus::Other(message),
            output: ProcessOutput::default(),
            elapsed: started.elapsed(),
        }
    }
}

/// Runs the target once for a constrained item.
pub trait Executor<I: Item> {
    fn execute_sync(&mut self, item: &I) -> RunResult;
}

/// Calls a Rust harness directly. `Err` is a rejection whose message becomes
/// stderr; a panic is a failure too.
pub struct InProcessExecutor<F> {
    harness_fn: F,
}

impl<F> InProcessExecutor<F> {
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<I, F> Executor<I> for InProcessExecutor<F>
where
    I: Item,
    F: Fn(&I) -> Result<(), String>,
{
    fn execute_sync(&mut self, item: &I) -> RunResult {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(item)));

        let (status, stderr) = match result {
            Ok(Ok(())) => (ExecutionStatus::Success, String::new()),
            Ok(Err(message)) => (ExecutionStatus::Failure("Harness rejected item".to_string()), message),
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                (ExecutionStatus::Failure(format!("Harness panicked: {msg}")), msg)
            }
        };
        RunResult {
            status,
            output: ProcessOutput {
                stderr: stderr.into_bytes(),
                ..ProcessOutput::default()
            },
            elapsed: started.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// argv template; `{field}` placeholders are filled from the item.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

/// Expands `{field}` placeholders in one argv element.
///
/// An element that is exactly one placeholder for an unset field is dropped.
/// Braces that do not enclose a valid field path are kept verbatim. Byte
/// string fields are passed through unchanged on unix.
pub fn fill_template(arg: &str, item: &dyn Item) -> Option<OsString> {
    let mut out = OsString::new();
    let mut rest = arg;
    let mut missing_alone = false;
    while let Some(open) = rest.find('{') {
        out.push(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push(&rest[open..]);
            rest = "";
            break;
        };
        let raw = &after[..close];
        match raw.parse::<FieldPath>() {
            Ok(path) => match item.get(&path) {
                Some(value) => out.push(value.to_os_string()),
                None => missing_alone = arg.len() == raw.len() + 2,
            },
            Err(_) => {
                out.push("{");
                out.push(raw);
                out.push("}");
            }
        }
        rest = &after[close + 1..];
    }
    out.push(rest);
    (!missing_alone).then_some(out)
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("Stopped reading target output: {e}");
        }
        buf
    })
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    /// The argv this executor would run for `item`.
    pub fn command_line(&self, item: &dyn Item) -> Vec<OsString> {
        self.config
            .command
            .iter()
            .filter_map(|arg| fill_template(arg, item))
            .collect()
    }

    fn run_and_wait_with_timeout(
        &self,
        mut child: Child,
        timeout: Duration,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("Target timed out, killing...");
                        if let Err(e) = child.kill() {
                            return Err(ExecutionStatus::Other(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}",
                    )));
                }
            }
        }
    }
}

impl<I: Item> Executor<I> for CommandExecutor {
    fn execute_sync(&mut self, item: &I) -> RunResult {
        let started = Instant::now();
        let argv = self.command_line(item);
        let Some((program, args)) = argv.split_first() else {
            return RunResult::other("Target command is empty".to_string(), started);
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunResult::other(format!("Failed to spawn command {argv:?}: {e}"), started);
            }
        };
        debug!("Running {argv:?}");
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let exit_status_result = self.run_and_wait_with_timeout(child, self.config.timeout);

        // Orphaned grandchildren of a killed target may keep the pipes open.
        let timed_out = matches!(exit_status_result, Err(ExecutionStatus::Timeout));
        let collect = |reader: Option<JoinHandle<Vec<u8>>>| {
            reader
                .filter(|_| !timed_out)
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };
        let mut output = ProcessOutput {
            stdout: collect(stdout_reader),
            stderr: collect(stderr_reader),
            ..ProcessOutput::default()
        };

        let status = match exit_status_result {
            Ok(status) => {
                output.exit_code = status.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    output.signal = status.signal();
                }

                if status.success() {
                    ExecutionStatus::Success
                } else if let Some(code) = status.code() {
                    ExecutionStatus::Failure(format!("Exited with code {code}"))
                } else if let Some(signal) = output.signal {
                    ExecutionStatus::Failure(format!("Terminated by signal {signal}"))
                } else {
                    ExecutionStatus::Failure("Exited abnormally".to_string())
                }
            }
            Err(exec_status_from_wait) => exec_status_from_wait,
        };

        RunResult {
            status,
            output,
            elapsed: started.elapsed(),
        }
    }
}
