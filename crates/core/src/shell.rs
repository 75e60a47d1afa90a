//! Blocking shell command executor.
//!
//! Every interaction with `git` and `hg` goes through [`ShellCommand`]: a
//! builder for a single synchronous subprocess invocation with optional
//! stdin, optional echo of child output to the parent's terminal, and a
//! fixed-count retry policy.
//!
//! Stdin is written from a dedicated thread and stdout/stderr are drained
//! from dedicated reader threads, so a child that fills one pipe while the
//! parent is busy with the other can never deadlock the process.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use crate::errors::ShellError;

/// Which parent stream a child's output chunk is echoed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoStream {
    Stdout,
    Stderr,
}

/// Outcome of one subprocess run: exit code plus both captured streams.
///
/// Streams are captured as raw bytes; `git archive` output is a tarball,
/// not text. The string accessors are lossy conversions for callers that
/// know their command produces text.
#[derive(Debug, Clone)]
pub struct ShellCommandResult {
    exit_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ShellCommandResult {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Builder for one blocking subprocess invocation.
#[derive(Debug)]
pub struct ShellCommand {
    working_dir: PathBuf,
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin: Option<Vec<u8>>,
    output_to_screen: bool,
    retries: u32,
    throw_for_non_zero_exit: bool,
}

impl ShellCommand {
    /// Create a command that will run `program` with `args` in `working_dir`.
    pub fn new<P, S, I>(working_dir: P, program: S, args: I) -> Self
    where
        P: AsRef<Path>,
        S: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            stdin: None,
            output_to_screen: false,
            retries: 0,
            throw_for_non_zero_exit: true,
        }
    }

    /// Feed the given bytes to the child's stdin.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Overlay environment variables on top of the parent environment.
    pub fn env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Echo the child's stdout/stderr to the parent's terminal while
    /// still capturing them.
    pub fn output_to_screen(mut self) -> Self {
        self.output_to_screen = true;
        self
    }

    /// Retry this many times on non-zero exit. No backoff; a retried run
    /// reruns the entire command.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Return the result instead of erroring on a non-zero exit.
    pub fn no_exceptions(mut self) -> Self {
        self.throw_for_non_zero_exit = false;
        self
    }

    /// The command as a single loggable string.
    pub fn command_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Run the command synchronously, applying the retry policy.
    pub fn run(&self) -> Result<ShellCommandResult, ShellError> {
        let max_tries = self.retries + 1;
        let mut tries_remaining = max_tries;

        while tries_remaining > 1 {
            let result = self.run_once()?;
            if result.exit_code == 0 {
                return Ok(result);
            }
            tries_remaining -= 1;
            warn!(
                command = %self.command_string(),
                exit_code = result.exit_code,
                tries_remaining,
                "command failed, retrying"
            );
        }

        let result = self.run_once()?;
        if result.exit_code != 0 && self.throw_for_non_zero_exit {
            return Err(ShellError::CommandFailed {
                command: self.command_string(),
                exit_code: result.exit_code,
                stdout: result.stdout(),
                stderr: result.stderr(),
            });
        }
        Ok(result)
    }

    fn run_once(&self) -> Result<ShellCommandResult, ShellError> {
        debug!(
            cwd = %self.working_dir.display(),
            command = %self.command_string(),
            "running command"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShellError::BinaryNotFound(self.program.clone())
            } else {
                ShellError::IoError(e)
            }
        })?;

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let echo = self.output_to_screen;

        let (status, stdout, stderr) = thread::scope(|s| {
            if let (Some(mut pipe), Some(bytes)) = (stdin_pipe, self.stdin.as_deref()) {
                s.spawn(move || {
                    // A broken pipe here means the child exited early; its
                    // exit code is the interesting part, not the write error.
                    let _ = pipe.write_all(bytes);
                });
            }
            let stdout_thread =
                stdout_pipe.map(|pipe| s.spawn(move || drain(pipe, echo, EchoStream::Stdout)));
            let stderr_thread =
                stderr_pipe.map(|pipe| s.spawn(move || drain(pipe, echo, EchoStream::Stderr)));

            let status = child.wait();
            let stdout = stdout_thread
                .and_then(|t| t.join().ok())
                .unwrap_or_default();
            let stderr = stderr_thread
                .and_then(|t| t.join().ok())
                .unwrap_or_default();
            (status, stdout, stderr)
        });

        let status = status?;
        Ok(ShellCommandResult {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Read a child pipe to EOF, optionally echoing each chunk to the parent's
/// matching stream.
fn drain(mut pipe: impl Read, echo: bool, stream: EchoStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if echo {
                    match stream {
                        EchoStream::Stdout => {
                            let mut out = std::io::stdout();
                            let _ = out.write_all(&buf[..n]);
                            let _ = out.flush();
                        }
                        EchoStream::Stderr => {
                            let mut err = std::io::stderr();
                            let _ = err.write_all(&buf[..n]);
                            let _ = err.flush();
                        }
                    }
                }
                collected.extend_from_slice(&buf[..n]);
            }
        }
    }
    collected
}
