//! git::exec
//!
//! The process runner: the only way the pool launches external git.
//!
//! # Architecture
//!
//! Every child process is driven through [`GitCommand::run`], which
//! enforces two timeouts:
//!
//! - **idle timeout**: kill the child when neither stdout nor stderr has
//!   produced a byte for the configured interval
//! - **total timeout**: kill the child when its overall runtime exceeds
//!   the configured interval
//!
//! Output is captured by reader threads; the supervising loop polls
//! `try_wait` and checks the operation context so a set interruption
//! reason aborts the child promptly. Compaction-grade commands set
//! `kill_process_tree`, which places the child in its own process group
//! and signals the whole group on kill (gc spawns helpers that would
//! otherwise survive).
//!
//! # Errors
//!
//! [`GitCommand::run`] reports spawn failures, timeouts and cancellation;
//! a non-zero exit is data. [`GitCommand::run_checked`] additionally
//! turns a non-zero exit into a structured error carrying the command
//! line and the last lines of stderr.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::context::OpContext;

/// How often the supervising loop samples the child.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How many stderr lines a non-zero-exit error carries.
const STDERR_TAIL_LINES: usize = 10;

/// Errors from running a child process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The child could not be started.
    #[error("failed to start '{command_line}': {source}")]
    Spawn {
        command_line: String,
        source: std::io::Error,
    },

    /// The child was killed after a timeout.
    #[error("'{command_line}' timed out after {waited:?} (idle={idle})")]
    Timeout {
        command_line: String,
        idle: bool,
        waited: Duration,
    },

    /// The child exited with a non-zero code.
    #[error("'{command_line}' failed with exit code {code}: {stderr_tail}")]
    NonZeroExit {
        command_line: String,
        code: i32,
        stderr_tail: String,
    },

    /// The operation context was interrupted while the child ran.
    #[error("process cancelled: {reason}")]
    Cancelled { reason: String },
}

/// Captured outcome of a finished child process.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code; -1 when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    /// Whether the child exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A fully-specified child process invocation.
///
/// Built by the native-git facade; no ambient parameters. All setters
/// are explicit and chainable.
#[derive(Debug, Clone)]
pub struct GitCommand {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin_data: Option<String>,
    idle_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
    kill_process_tree: bool,
}

impl GitCommand {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin_data: None,
            idle_timeout: None,
            total_timeout: None,
            kill_process_tree: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `data` to the child's stdin and close it.
    pub fn stdin_data(mut self, data: impl Into<String>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Kill the child when output is silent for `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Kill the child when its total runtime exceeds `timeout`.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Kill the entire process tree on timeout or cancellation.
    pub fn kill_process_tree(mut self, enabled: bool) -> Self {
        self.kill_process_tree = enabled;
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Run to completion, enforcing timeouts and cancellation.
    ///
    /// A non-zero exit is returned as data; see [`run_checked`] for the
    /// error-converting variant.
    ///
    /// [`run_checked`]: GitCommand::run_checked
    pub fn run(&self, ctx: &OpContext) -> Result<ExecResult, ExecError> {
        if let Some(reason) = ctx.interruption_reason() {
            return Err(ExecError::Cancelled { reason });
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        if self.kill_process_tree {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            command_line: self.command_line(),
            source,
        })?;

        if let Some(data) = &self.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                // The child may exit without draining stdin; that is its
                // business, not a runner failure.
                let _ = stdin.write_all(data.as_bytes());
            }
        }

        let last_activity = Arc::new(AtomicU64::new(0));
        let stdout_buf = spawn_reader(child.stdout.take(), start, Arc::clone(&last_activity));
        let stderr_buf = spawn_reader(child.stderr.take(), start, Arc::clone(&last_activity));

        let status = loop {
            if let Some(status) = child.try_wait().map_err(|source| ExecError::Spawn {
                command_line: self.command_line(),
                source,
            })? {
                break status;
            }

            if let Some(reason) = ctx.interruption_reason() {
                self.kill(&mut child);
                return Err(ExecError::Cancelled { reason });
            }

            let elapsed = start.elapsed();
            if let Some(total) = self.total_timeout {
                if elapsed >= total {
                    self.kill(&mut child);
                    return Err(ExecError::Timeout {
                        command_line: self.command_line(),
                        idle: false,
                        waited: elapsed,
                    });
                }
            }
            if let Some(idle) = self.idle_timeout {
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                if elapsed.saturating_sub(last) >= idle {
                    self.kill(&mut child);
                    return Err(ExecError::Timeout {
                        command_line: self.command_line(),
                        idle: true,
                        waited: elapsed,
                    });
                }
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        let duration = start.elapsed();
        let stdout = drain(stdout_buf);
        let stderr = drain(stderr_buf);
        let exit_code = status.code().unwrap_or(-1);

        tracing::debug!(
            command = %self.command_line(),
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "process finished"
        );

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            duration,
        })
    }

    /// Run and fail when the child exits non-zero.
    pub fn run_checked(&self, ctx: &OpContext) -> Result<ExecResult, ExecError> {
        let result = self.run(ctx)?;
        if result.success() {
            Ok(result)
        } else {
            Err(ExecError::NonZeroExit {
                command_line: self.command_line(),
                code: result.exit_code,
                stderr_tail: last_lines(&result.stderr, STDERR_TAIL_LINES),
            })
        }
    }

    fn kill(&self, child: &mut Child) {
        #[cfg(unix)]
        if self.kill_process_tree {
            // The child is its own process group leader; signal the group.
            let pgid = child.id() as i32;
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

type OutputBuf = Option<std::thread::JoinHandle<Vec<u8>>>;

fn spawn_reader<R: Read + Send + 'static>(
    stream: Option<R>,
    start: Instant,
    last_activity: Arc<AtomicU64>,
) -> OutputBuf {
    let mut stream = stream?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    last_activity
                        .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                }
            }
        }
        buf
    }))
}

fn drain(handle: OutputBuf) -> String {
    match handle {
        Some(handle) => match handle.join() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}

/// The last `n` non-empty lines of `text`, joined with newlines.
pub fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Escape an argument for a Windows `echo`-style helper script.
///
/// `cmd.exe` metacharacters (`& ^ < > | "`) are quoted by prefixing `^`;
/// `%` is doubled so variable expansion cannot fire.
pub fn escape_echo_argument_windows(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' | '^' | '<' | '>' | '|' | '"' => {
                out.push('^');
                out.push(c);
            }
            '%' => {
                out.push('%');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> OpContext {
        OpContext::new("test")
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let result = GitCommand::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .run(&ctx())
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[test]
    fn nonzero_exit_is_data_for_run() {
        let result = GitCommand::new("sh").args(["-c", "exit 3"]).run(&ctx()).unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn run_checked_converts_nonzero_exit() {
        let err = GitCommand::new("sh")
            .args(["-c", "echo broken >&2; exit 2"])
            .run_checked(&ctx())
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr_tail, command_line } => {
                assert_eq!(code, 2);
                assert!(stderr_tail.contains("broken"));
                assert!(command_line.starts_with("sh"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn total_timeout_kills_child() {
        let start = Instant::now();
        let err = GitCommand::new("sleep")
            .arg("10")
            .total_timeout(Duration::from_millis(200))
            .run(&ctx())
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { idle: false, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn idle_timeout_kills_silent_child() {
        let err = GitCommand::new("sleep")
            .arg("10")
            .idle_timeout(Duration::from_millis(200))
            .run(&ctx())
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { idle: true, .. }));
    }

    #[test]
    fn active_child_survives_idle_timeout() {
        // Prints every 100ms for ~0.5s; idle threshold is 300ms.
        let result = GitCommand::new("sh")
            .args(["-c", "for i in 1 2 3 4 5; do echo tick; sleep 0.1; done"])
            .idle_timeout(Duration::from_millis(300))
            .run(&ctx())
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.lines().count(), 5);
    }

    #[test]
    fn interruption_aborts_child() {
        let ctx = ctx();
        let child_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            GitCommand::new("sleep").arg("10").run(&child_ctx)
        });
        std::thread::sleep(Duration::from_millis(200));
        ctx.interrupt("shutdown");
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[test]
    fn stdin_data_reaches_child() {
        let result = GitCommand::new("cat")
            .stdin_data("line-1\nline-2\n")
            .run(&ctx())
            .unwrap();
        assert_eq!(result.stdout, "line-1\nline-2\n");
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = GitCommand::new("/no/such/binary-xyz").run(&ctx()).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn command_line_includes_args() {
        let cmd = GitCommand::new("git").args(["--git-dir=/m/a.git", "gc", "--auto"]);
        assert_eq!(cmd.command_line(), "git --git-dir=/m/a.git gc --auto");
    }

    mod last_lines {
        use super::*;

        #[test]
        fn keeps_tail_only() {
            let text = "a\nb\nc\nd";
            assert_eq!(last_lines(text, 2), "c\nd");
        }

        #[test]
        fn skips_blank_lines() {
            let text = "a\n\n\nb\n";
            assert_eq!(last_lines(text, 5), "a\nb");
        }
    }

    mod escaping {
        use super::*;

        #[test]
        fn cmd_metacharacters_are_caret_quoted() {
            assert_eq!(escape_echo_argument_windows("a&b"), "a^&b");
            assert_eq!(escape_echo_argument_windows("<out>"), "^<out^>");
            assert_eq!(escape_echo_argument_windows("p|q"), "p^|q");
            assert_eq!(escape_echo_argument_windows("say \"hi\""), "say ^\"hi^\"");
            assert_eq!(escape_echo_argument_windows("x^y"), "x^^y");
        }

        #[test]
        fn percent_is_doubled() {
            assert_eq!(escape_echo_argument_windows("100%"), "100%%");
        }

        #[test]
        fn plain_text_untouched() {
            assert_eq!(escape_echo_argument_windows("plain-text_123"), "plain-text_123");
        }
    }
}
