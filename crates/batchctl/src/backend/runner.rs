use std::process::Stdio;
use std::time::Duration;

use bstr::ByteSlice;
use futures::FutureExt;
use futures::future::BoxFuture;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::common::error::{BatchError, BatchResult};

/// A single external command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            args: vec![program.into()],
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    pub fn with_stdin(mut self, stdin: String) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        self.args.first().map(|s| s.as_str()).unwrap_or_default()
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` if the process was terminated by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined together, Slurm tools are not consistent about
    /// which stream carries which message.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        text
    }
}

/// Executes external commands.
///
/// A non-zero exit code is not an error, it is returned to the caller for interpretation.
/// Errors are reserved for commands that could not be started ([`BatchError::Spawn`]) or
/// that had to be terminated ([`BatchError::Timeout`]).
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: Invocation) -> BoxFuture<'static, BatchResult<CommandOutput>>;
}

/// Runs commands as local child processes.
///
/// Each child is placed into its own process group, so that on timeout (or when the
/// returned future is dropped) the whole group can be terminated, including processes
/// that the command has spawned itself.
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: Invocation) -> BoxFuture<'static, BatchResult<CommandOutput>> {
        run_process(invocation, self.kill_grace).boxed()
    }
}

/// Kills the process group with SIGKILL when dropped, unless it was disarmed.
struct ProcessGroupGuard {
    pgid: Option<Pid>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            log::debug!("Killing process group {pgid} of an abandoned command");
            send_group_signal(pgid, Signal::SIGKILL);
        }
    }
}

fn send_group_signal(pgid: Pid, signal: Signal) {
    if let Err(error) = killpg(pgid, signal) {
        if error != nix::errno::Errno::ESRCH {
            log::warn!("Cannot send signal {signal} to process group {pgid}: {error:?}");
        }
    }
}

fn spawn_error(program: &str, message: impl ToString) -> BatchError {
    BatchError::Spawn {
        program: program.to_string(),
        message: message.to_string(),
    }
}

async fn run_process(invocation: Invocation, kill_grace: Duration) -> BatchResult<CommandOutput> {
    let program = invocation.program();
    if program.is_empty() {
        return Err(spawn_error("<empty>", "No command arguments"));
    }
    let path = which::which(program).map_err(|error| spawn_error(program, error))?;

    log::debug!("Running command `{}`", invocation.command_line());

    let mut command = Command::new(path);
    command.args(&invocation.args[1..]);
    command.stdin(if invocation.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    unsafe {
        command.pre_exec(|| {
            // New session, so that the command and its children can be signalled as a group
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|error| spawn_error(program, error))?;
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
    let mut guard = ProcessGroupGuard { pgid };

    let collect = collect_output(&mut child, invocation.stdin.as_deref());
    futures::pin_mut!(collect);

    let result = match invocation.timeout {
        None => collect.await,
        Some(timeout) => {
            tokio::select! {
                result = &mut collect => result,
                _ = tokio::time::sleep(timeout) => {
                    log::debug!(
                        "Command `{}` did not finish within {}, terminating it",
                        invocation.command_line(),
                        humantime::format_duration(timeout)
                    );
                    if let Some(pgid) = pgid {
                        send_group_signal(pgid, Signal::SIGTERM);
                        if tokio::time::timeout(kill_grace, &mut collect).await.is_err() {
                            send_group_signal(pgid, Signal::SIGKILL);
                            let _ = tokio::time::timeout(kill_grace, &mut collect).await;
                        }
                    }
                    Err(BatchError::Timeout {
                        command: program.to_string(),
                        timeout,
                    })
                }
            }
        }
    };
    guard.disarm();
    result
}

async fn collect_output(child: &mut Child, input: Option<&str>) -> BatchResult<CommandOutput> {
    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let write_stdin = async move {
        if let (Some(mut pipe), Some(input)) = (stdin, input) {
            // The command may exit without reading its input
            if let Err(error) = pipe.write_all(input.as_bytes()).await {
                log::debug!("Cannot write command input: {error}");
            }
        }
    };
    let read_stdout = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stdout.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
        }
        Ok::<_, std::io::Error>(buffer)
    };
    let read_stderr = async {
        let mut buffer = Vec::new();
        if let Some(pipe) = stderr.as_mut() {
            pipe.read_to_end(&mut buffer).await?;
        }
        Ok::<_, std::io::Error>(buffer)
    };

    let (_, stdout, stderr, status) =
        tokio::join!(write_stdin, read_stdout, read_stderr, child.wait());
    let status = status?;
    Ok(CommandOutput {
        stdout: stdout?.to_str_lossy().into_owned(),
        stderr: stderr?.to_str_lossy().into_owned(),
        exit_code: status.code().unwrap_or(-1),
    })
}
