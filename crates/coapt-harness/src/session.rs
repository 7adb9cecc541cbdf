//! Interactive process sessions.
//!
//! A [`Session`] owns at most one live process, spawned in its own process
//! group and attached to a pseudo-terminal (or plain pipes). Output is
//! drained by a background reader into an [`ExpectBuffer`], so expectations
//! see everything the process printed, in order, even while the caller was
//! busy with another session.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use coapt_pilot::{kill_group, resolve_command, GroupKillConfig, KillOutcome, OutputPump};
use coapt_pilot::{PtyOptions, PtySession};
use tracing::{debug, info, warn};

use crate::error::HarnessError;
use crate::expect::{ExpectBuffer, Expectation, Match, Outcome};
use crate::pattern::Pattern;

/// Default expectation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How much trailing output to carry in timeout errors.
const DIAGNOSTIC_TAIL: usize = 2048;

/// After a one-shot process exits, how long to wait for its last output
/// when a leftover group member still holds the output stream open.
const RUN_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How the process is attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoMode {
    /// A pseudo-terminal: the process sees a tty, as when run from a shell.
    #[default]
    Pty,
    /// Separate pipes for stdin, stdout and stderr (stdout and stderr are
    /// merged into one buffer).
    Pipe,
}

/// Options for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Name used in logs and errors.
    pub name: String,
    /// The command to run.
    pub command: String,
    /// Arguments to pass to the command.
    pub args: Vec<String>,
    /// Working directory for the process (`None` means the current directory).
    pub working_dir: Option<PathBuf>,
    /// Environment overrides, applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Default timeout for expectations (default: 10 s).
    pub timeout: Duration,
    /// Terminal rows (default: 24).
    pub rows: u16,
    /// Terminal columns (default: 80).
    pub cols: u16,
    /// Remove ANSI escape sequences before matching (default: true).
    pub strip_ansi: bool,
    /// Echo input back through the terminal (default: false).
    pub echo: bool,
    pub io_mode: IoMode,
    /// Teardown timing.
    pub kill: GroupKillConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            rows: 24,
            cols: 80,
            strip_ansi: true,
            echo: false,
            io_mode: IoMode::Pty,
            kill: GroupKillConfig::default(),
        }
    }
}

impl SessionOptions {
    /// Options for a shell-style command line such as `make term`.
    ///
    /// The line is split with POSIX shell quoting rules but not otherwise
    /// interpreted (no globbing, no variable expansion).
    pub fn new(command_line: &str) -> Result<Self, HarnessError> {
        let words = shlex::split(command_line).ok_or_else(|| {
            HarnessError::Config(format!("unbalanced quoting in command: {command_line}"))
        })?;
        let mut words = words.into_iter();
        let command = words
            .next()
            .ok_or_else(|| HarnessError::Config("empty command line".into()))?;
        Ok(Self::from_argv(command, words))
    }

    /// Options for an already-split argument vector.
    pub fn from_argv<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn strip_ansi(mut self, strip: bool) -> Self {
        self.strip_ansi = strip;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn io_mode(mut self, mode: IoMode) -> Self {
        self.io_mode = mode;
        self
    }

    pub fn kill_config(mut self, kill: GroupKillConfig) -> Self {
        self.kill = kill;
        self
    }

    /// The full command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|w| shlex::try_quote(w).map_or_else(|_| w.to_string(), |q| q.into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

enum ChildHandle {
    Pty(PtySession),
    Pipe { child: Child, stdin: Option<ChildStdin> },
}

impl ChildHandle {
    fn try_wait(&mut self) -> Result<Option<i32>, HarnessError> {
        match self {
            ChildHandle::Pty(pty) => Ok(pty.try_wait()?),
            ChildHandle::Pipe { child, .. } => Ok(child.try_wait()?.map(|status| {
                status
                    .code()
                    .or_else(|| status.signal().map(|sig| -sig))
                    .unwrap_or(0)
            })),
        }
    }

    /// Block until the (already signalled) child has exited.
    fn reap(&mut self) {
        match self {
            ChildHandle::Pty(pty) => {
                let _ = pty.wait();
            }
            ChildHandle::Pipe { child, stdin } => {
                stdin.take();
                let _ = child.wait();
            }
        }
    }
}

struct LiveProcess {
    child: ChildHandle,
    pump: OutputPump,
    output: Receiver<Vec<u8>>,
    output_closed: bool,
    pid: u32,
    pgid: i32,
}

/// One spawned process plus its interactive I/O state.
pub struct Session {
    options: SessionOptions,
    process: Option<LiveProcess>,
    buffer: ExpectBuffer,
    exit_code: Option<i32>,
}

impl Session {
    /// Create a session from options. No process is started until
    /// [`connect`](Self::connect).
    pub fn new(options: SessionOptions) -> Self {
        let buffer = ExpectBuffer::new(options.strip_ansi);
        Self {
            options,
            process: None,
            buffer,
            exit_code: None,
        }
    }

    /// Spawn the configured command.
    ///
    /// Returns once the process has been exec'd and output collection has
    /// started. Fails with [`HarnessError::Spawn`] for a missing command or
    /// working directory, and with [`HarnessError::AlreadyConnected`] if a
    /// previous process was not disconnected.
    pub fn connect(&mut self) -> Result<&mut Self, HarnessError> {
        if self.process.is_some() {
            return Err(HarnessError::AlreadyConnected(self.options.name.clone()));
        }

        self.buffer = ExpectBuffer::new(self.options.strip_ansi);
        self.exit_code = None;

        let process = match self.options.io_mode {
            IoMode::Pty => self.spawn_pty()?,
            IoMode::Pipe => self.spawn_pipe()?,
        };
        info!(
            session = %self.options.name,
            pid = process.pid,
            pgid = process.pgid,
            command = %self.options.command_line(),
            "session connected"
        );
        self.process = Some(process);
        Ok(self)
    }

    fn spawn_pty(&self) -> Result<LiveProcess, HarnessError> {
        let opts = &self.options;
        let pty = PtySession::spawn(
            &opts.command,
            &opts.args,
            opts.working_dir.as_deref(),
            &opts.env,
            &PtyOptions {
                rows: opts.rows,
                cols: opts.cols,
                echo: opts.echo,
            },
        )?;
        let (pump, output) = OutputPump::from_pty(&pty)?;
        Ok(LiveProcess {
            pid: pty.pid(),
            pgid: pty.pgid(),
            child: ChildHandle::Pty(pty),
            pump,
            output,
            output_closed: false,
        })
    }

    fn spawn_pipe(&self) -> Result<LiveProcess, HarnessError> {
        let opts = &self.options;
        if let Some(dir) = &opts.working_dir {
            if !dir.is_dir() {
                return Err(HarnessError::Spawn(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        let program = resolve_command(&opts.command, opts.working_dir.as_deref(), &opts.env)
            .ok_or_else(|| HarnessError::Spawn(format!("command not found: {}", opts.command)))?;

        let mut command = Command::new(program);
        command
            .args(&opts.args)
            .envs(opts.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &opts.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| HarnessError::Spawn(format!("{}: {e}", opts.command)))?;

        let mut readers: Vec<Box<dyn Read + Send>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(Box::new(out));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(Box::new(err));
        }
        let (pump, output) = OutputPump::from_readers(readers)?;
        let stdin = child.stdin.take();
        let pid = child.id();
        Ok(LiveProcess {
            pid,
            pgid: i32::try_from(pid).unwrap_or(0),
            child: ChildHandle::Pipe { child, stdin },
            pump,
            output,
            output_closed: false,
        })
    }

    fn live(&mut self) -> Result<&mut LiveProcess, HarnessError> {
        let name = &self.options.name;
        self.process
            .as_mut()
            .ok_or_else(|| HarnessError::NotConnected(name.clone()))
    }

    /// Write `text` and a line terminator to the process input.
    ///
    /// Whether the process echoes the line back is up to the terminal
    /// settings and the process itself. Fails with
    /// [`HarnessError::ProcessExited`] once the process has exited.
    pub fn send(&mut self, text: &str) -> Result<(), HarnessError> {
        let session = self.options.name.clone();
        if let Some(code) = self.live()?.child.try_wait()? {
            self.exit_code = Some(code);
            warn!(session = %session, code, text, "send after process exit");
            return Err(HarnessError::ProcessExited { code });
        }
        let process = self.live()?;
        match &mut process.child {
            ChildHandle::Pty(pty) => pty.send_line(text)?,
            ChildHandle::Pipe { stdin, .. } => {
                let stdin = stdin
                    .as_mut()
                    .ok_or_else(|| HarnessError::NotConnected(session.clone()))?;
                stdin.write_all(text.as_bytes())?;
                stdin.write_all(b"\n")?;
                stdin.flush()?;
            }
        }
        debug!(session = %session, text, "sent line");
        Ok(())
    }

    /// Move whatever the reader has delivered into the buffer, without
    /// blocking.
    fn drain_ready(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        while !process.output_closed {
            match process.output.try_recv() {
                Ok(chunk) => self.buffer.feed(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    process.output_closed = true;
                    self.buffer.finish();
                }
            }
        }
    }

    /// Wait up to `limit` for one more chunk of output.
    ///
    /// Once the stream has closed nothing else can arrive, so this just
    /// sleeps out the remaining time; a pending expectation still runs to
    /// its full deadline after the process has exited.
    fn wait_for_output(&mut self, limit: Duration) {
        let Some(process) = self.process.as_mut() else {
            std::thread::sleep(limit);
            return;
        };
        if process.output_closed {
            std::thread::sleep(limit);
            return;
        }
        match process.output.recv_timeout(limit) {
            Ok(chunk) => self.buffer.feed(&chunk),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                process.output_closed = true;
                self.buffer.finish();
            }
        }
    }

    /// Wait for the earliest of `patterns` in unconsumed output.
    ///
    /// Returns the index of the pattern that matched and the match.
    pub fn expect_any(
        &mut self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<(usize, Match), HarnessError> {
        // Checked up front so an unconnected session fails immediately
        // instead of timing out
        if self.process.is_none() && self.buffer.unconsumed().is_empty() {
            return Err(HarnessError::NotConnected(self.options.name.clone()));
        }

        let mut expectation = Expectation::new(patterns, timeout);
        loop {
            self.drain_ready();
            let now = Instant::now();
            if !matches!(expectation.poll(&mut self.buffer, now), Outcome::Pending) {
                break;
            }
            self.wait_for_output(expectation.remaining(now));
        }

        let description = expectation.describe();
        let waited = expectation.elapsed(Instant::now());
        match expectation.into_outcome() {
            Outcome::Matched { index, found } => {
                debug!(
                    session = %self.options.name,
                    pattern = %description,
                    elapsed_ms = waited.as_millis() as u64,
                    "pattern matched"
                );
                Ok((index, found))
            }
            other => {
                let elapsed = match other {
                    Outcome::TimedOut { elapsed } => elapsed,
                    _ => waited,
                };
                debug!(
                    session = %self.options.name,
                    pattern = %description,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "expectation timed out"
                );
                Err(HarnessError::Timeout {
                    pattern: description,
                    elapsed,
                    buffered: tail(self.buffer.unconsumed(), DIAGNOSTIC_TAIL),
                })
            }
        }
    }

    /// Wait for `pattern` with an explicit timeout.
    pub fn expect_pattern(
        &mut self,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<Match, HarnessError> {
        self.expect_any(std::slice::from_ref(pattern), timeout)
            .map(|(_, m)| m)
    }

    /// Wait for a regular expression using the session's default timeout.
    pub fn expect(&mut self, regex: &str) -> Result<Match, HarnessError> {
        let timeout = self.options.timeout;
        self.expect_timeout(regex, timeout)
    }

    /// Wait for a regular expression with an explicit timeout.
    pub fn expect_timeout(&mut self, regex: &str, timeout: Duration) -> Result<Match, HarnessError> {
        let pattern = Pattern::regex(regex)?;
        self.expect_pattern(&pattern, timeout)
    }

    /// Wait for a literal substring using the session's default timeout.
    pub fn expect_literal(&mut self, text: &str) -> Result<Match, HarnessError> {
        let timeout = self.options.timeout;
        self.expect_pattern(&Pattern::literal(text), timeout)
    }

    /// Assert that `regex` does not appear within `window`.
    ///
    /// Succeeds only when the wait times out. Any appearance of the pattern
    /// fails with [`HarnessError::AssertionFailed`].
    pub fn expect_absent(&mut self, regex: &str, window: Duration) -> Result<(), HarnessError> {
        match self.expect_timeout(regex, window) {
            Ok(found) => Err(HarnessError::assertion(
                format!("{regex:?} appeared within {window:?}: {:?}", found.text),
                format!("{}{}", found.before, found.text),
            )),
            Err(e) if e.is_timeout() => {
                debug!(session = %self.options.name, pattern = regex, "absent as expected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `send(text)` followed immediately by `expect(regex)`.
    pub fn send_recv(&mut self, text: &str, regex: &str) -> Result<Match, HarnessError> {
        self.send(text)?;
        self.expect(regex)
    }

    pub fn send_recv_timeout(
        &mut self,
        text: &str,
        regex: &str,
        timeout: Duration,
    ) -> Result<Match, HarnessError> {
        self.send(text)?;
        self.expect_timeout(regex, timeout)
    }

    /// Run the command to completion and return everything it printed.
    ///
    /// Fails with [`HarnessError::Timeout`] if the process has not exited
    /// after `timeout`; the process group is torn down either way. The exit
    /// code is available from [`exit_status`](Self::exit_status) afterwards.
    pub fn run(&mut self, timeout: Duration) -> Result<String, HarnessError> {
        self.connect()?;
        let started = Instant::now();
        let deadline = started + timeout;

        let result = loop {
            self.drain_ready();
            let status = match self.live() {
                Ok(process) => process.child.try_wait(),
                Err(e) => Err(e),
            };
            match status {
                Ok(Some(code)) => {
                    self.exit_code = Some(code);
                    self.drain_after_exit(deadline);
                    break Ok(code);
                }
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(HarnessError::Timeout {
                    pattern: "process exit".into(),
                    elapsed: now.saturating_duration_since(started),
                    buffered: tail(self.buffer.transcript(), DIAGNOSTIC_TAIL),
                });
            }
            let step = deadline
                .saturating_duration_since(now)
                .min(Duration::from_millis(50));
            self.wait_for_output(step);
        };

        self.disconnect();
        let code = result?;
        info!(
            session = %self.options.name,
            code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "one-shot process finished"
        );
        self.buffer.consume_all();
        Ok(self.buffer.transcript().to_string())
    }

    fn drain_after_exit(&mut self, deadline: Instant) {
        let mut quiet_since = Instant::now();
        loop {
            let closed = self.process.as_ref().map_or(true, |p| p.output_closed);
            let now = Instant::now();
            if closed || now >= deadline || now.duration_since(quiet_since) >= RUN_DRAIN_GRACE {
                return;
            }
            let before = self.buffer.received();
            self.wait_for_output(Duration::from_millis(20));
            if self.buffer.received() != before {
                quiet_since = Instant::now();
            }
        }
    }

    /// Terminate the whole process group and release the session.
    ///
    /// Idempotent: safe on a session that never connected, that failed to
    /// connect, or whose process already exited. Teardown problems are
    /// logged, never returned.
    pub fn disconnect(&mut self) {
        let Some(mut process) = self.process.take() else {
            debug!(session = %self.options.name, "disconnect: not connected");
            return;
        };

        let signalled = match kill_group(process.pgid, &self.options.kill) {
            Ok(KillOutcome::AlreadyGone) => {
                info!(session = %self.options.name, pid = process.pid, "process already stopped");
                true
            }
            Ok(outcome) => {
                info!(session = %self.options.name, pgid = process.pgid, ?outcome, "session disconnected");
                true
            }
            Err(e) => {
                warn!(session = %self.options.name, pgid = process.pgid, error = %e, "process group teardown failed");
                false
            }
        };

        process.pump.stop();
        while let Ok(chunk) = process.output.try_recv() {
            self.buffer.feed(&chunk);
        }
        self.buffer.finish();

        if let Ok(Some(code)) = process.child.try_wait() {
            self.exit_code = Some(code);
        } else if signalled {
            process.child.reap();
            if let Ok(Some(code)) = process.child.try_wait() {
                self.exit_code = Some(code);
            }
        }
    }

    /// Whether the process is running.
    pub fn is_alive(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        match process.child.try_wait() {
            Ok(None) => true,
            Ok(Some(code)) => {
                self.exit_code = Some(code);
                false
            }
            Err(_) => false,
        }
    }

    /// Whether a process is attached (running or not yet disconnected).
    pub fn is_connected(&self) -> bool {
        self.process.is_some()
    }

    /// Process id of the attached process.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// Exit code of the last process, once it has exited.
    pub fn exit_status(&mut self) -> Option<i32> {
        self.is_alive();
        self.exit_code
    }

    /// What the process printed so far; see [`ExpectBuffer::transcript`].
    pub fn transcript(&mut self) -> &str {
        self.drain_ready();
        self.buffer.transcript()
    }

    /// Output not yet consumed by an expectation.
    pub fn unconsumed(&mut self) -> &str {
        self.drain_ready();
        self.buffer.unconsumed()
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.options.name)
            .field("pid", &self.pid())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

/// The last `max` bytes of `text`, cut at a character boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
