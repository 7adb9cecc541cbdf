//! Pseudo-terminal process management.
//!
//! Spawns a child process in a PTY, in its own session and therefore its own
//! process group, so an entire shell-wrapped tree (`make term` and whatever
//! it launches) can be torn down with one group signal. The master end of
//! the PTY is used for reading output and injecting input lines.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, info, warn};

use coapt_types::CoaptError;

/// Terminal settings applied before the child starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyOptions {
    pub rows: u16,
    pub cols: u16,
    /// Whether the terminal echoes input back to the master.
    pub echo: bool,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            echo: false,
        }
    }
}

/// A child process running in a pseudo-terminal.
pub struct PtySession {
    master: OwnedFd,
    child_pid: Pid,
    exit_code: Cell<Option<i32>>,
}

/// Find the executable the child would run.
///
/// Commands containing a slash are resolved against the working directory;
/// bare names are searched on `PATH` (the override value when one is given).
pub fn resolve_command(
    command: &str,
    working_dir: Option<&Path>,
    env: &[(String, String)],
) -> Option<PathBuf> {
    if command.contains('/') {
        let path = Path::new(command);
        let full = match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        return full.is_file().then_some(full);
    }

    let path_var = env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .or_else(|| std::env::var("PATH").ok())?;

    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

/// How long the parent waits for the child to reach `exec`.
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

fn cstring(bytes: impl Into<Vec<u8>>, what: &str) -> Result<CString, CoaptError> {
    CString::new(bytes).map_err(|e| CoaptError::SpawnError(format!("invalid {what}: {e}")))
}

/// `KEY=VALUE` entries for the child: the inherited environment with
/// `overrides` applied on top, later overrides winning.
fn merged_env(overrides: &[(String, String)]) -> Result<Vec<CString>, CoaptError> {
    let mut vars: BTreeMap<Vec<u8>, Vec<u8>> = std::env::vars_os()
        .map(|(k, v)| (k.into_vec(), v.into_vec()))
        .collect();
    for (key, value) in overrides {
        vars.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }
    vars.into_iter()
        .map(|(mut entry, value)| {
            entry.push(b'=');
            entry.extend_from_slice(&value);
            cstring(entry, "environment entry")
        })
        .collect()
}

/// Pointer array for `execve`, terminated by a null pointer.
fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Everything the forked child does before `exec`.
///
/// Runs between `fork` and `exec` in a possibly multi-threaded process, so
/// it only makes async-signal-safe calls: no allocation, no locks, no
/// environment access. Returns only on failure, naming the failed step.
fn exec_child(
    slave: OwnedFd,
    dir: Option<&CStr>,
    program: &CStr,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> (&'static str, Errno) {
    if let Err(e) = unistd::setsid() {
        return ("setsid", e);
    }
    if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) } < 0 {
        return ("TIOCSCTTY", Errno::last());
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if let Err(e) = unistd::dup2(slave.as_raw_fd(), target) {
            return ("dup2", e);
        }
    }
    drop(slave);

    if let Some(dir) = dir {
        if unsafe { libc::chdir(dir.as_ptr()) } < 0 {
            return ("chdir", Errno::last());
        }
    }
    unsafe { libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    ("exec", Errno::last())
}

impl PtySession {
    /// Spawn a command in a new PTY.
    ///
    /// The child inherits the parent environment with `env` applied on top,
    /// runs in `working_dir` (or the current directory), and leads a new
    /// session so its process group id equals its pid. Returns only after
    /// the exec has succeeded; a missing binary or directory is reported as
    /// `SpawnError`. The master fd is set non-blocking.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &[(String, String)],
        options: &PtyOptions,
    ) -> Result<Self, CoaptError> {
        if let Some(dir) = working_dir {
            if !dir.is_dir() {
                return Err(CoaptError::SpawnError(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        let program = resolve_command(command, working_dir, env)
            .ok_or_else(|| CoaptError::SpawnError(format!("command not found: {command}")))?;
        // Absolute, so the child's chdir cannot change what it executes
        let program = program.canonicalize().map_err(|e| {
            CoaptError::SpawnError(format!("{}: {e}", program.display()))
        })?;

        // Everything the child needs is allocated before fork.
        let c_program = cstring(program.as_os_str().as_bytes(), "command path")?;
        let mut c_args = vec![cstring(command, "command")?];
        for arg in args {
            c_args.push(cstring(arg.as_str(), "argument")?);
        }
        let c_env = merged_env(env)?;
        let c_dir = working_dir
            .map(|dir| cstring(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;
        let argv = null_terminated(&c_args);
        let envp = null_terminated(&c_env);

        let winsize = Winsize {
            ws_row: options.rows,
            ws_col: options.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| CoaptError::PtyError(format!("openpty failed: {e}")))?;

        if !options.echo {
            let mut attrs = termios::tcgetattr(&pty.slave)
                .map_err(|e| CoaptError::PtyError(format!("tcgetattr: {e}")))?;
            attrs.local_flags.remove(LocalFlags::ECHO);
            termios::tcsetattr(&pty.slave, SetArg::TCSANOW, &attrs)
                .map_err(|e| CoaptError::PtyError(format!("tcsetattr: {e}")))?;
        }

        // Closed on exec; the child writes its setup error here otherwise.
        let (status_read, status_write) = unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| CoaptError::SpawnError(format!("pipe2: {e}")))?;

        // Safety: the child only runs `exec_child`, which sticks to
        // async-signal-safe calls, and then exits.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(status_read);
                drop(pty.master);
                let (step, errno) =
                    exec_child(pty.slave, c_dir.as_deref(), &c_program, &argv, &envp);
                let _ = unistd::write(&status_write, &(errno as i32).to_ne_bytes());
                let _ = unistd::write(&status_write, step.as_bytes());
                unsafe { libc::_exit(127) };
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                drop(status_write);

                let status = match read_exec_status(&status_read, EXEC_TIMEOUT) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(pid = child.as_raw(), command, "child did not reach exec");
                        let _ = signal::kill(child, Signal::SIGKILL);
                        let _ = waitpid(child, None);
                        return Err(e);
                    }
                };
                if !status.is_empty() {
                    let _ = waitpid(child, None);
                    return Err(CoaptError::SpawnError(format!(
                        "{command}: {}",
                        describe_exec_failure(&status)
                    )));
                }

                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| CoaptError::PtyError(format!("fcntl F_GETFL: {e}")))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| CoaptError::PtyError(format!("fcntl F_SETFL: {e}")))?;

                info!(pid = child.as_raw(), command, "spawned pty process");
                Ok(Self {
                    master: pty.master,
                    child_pid: child,
                    exit_code: Cell::new(None),
                })
            }
            Err(e) => Err(CoaptError::SpawnError(format!("fork failed: {e}"))),
        }
    }

    /// Non-blocking read from the master PTY.
    ///
    /// Returns `Ok(0)` if no data is available or the child side is closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, CoaptError> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            // EIO on the master means every slave fd was closed
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(CoaptError::PtyError(format!("pty read: {e}"))),
        }
    }

    /// Write all bytes to the master PTY (the child's stdin).
    ///
    /// Retries on EAGAIN for up to ~5 seconds so a child that stops reading
    /// cannot block the caller forever.
    pub fn write_all(&self, data: &[u8]) -> Result<(), CoaptError> {
        let mut written = 0;
        let mut retries = 0u32;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    retries += 1;
                    if retries > 5000 {
                        return Err(CoaptError::PtyError(
                            "pty write: buffer full after 5s of retries".into(),
                        ));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(CoaptError::PtyError(format!("pty write: {e}"))),
            }
        }
        Ok(())
    }

    /// Send a line of text followed by a newline.
    pub fn send_line(&self, text: &str) -> Result<(), CoaptError> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        self.write_all(&data)
    }

    /// Reap the child if it has exited, without blocking.
    ///
    /// The exit code is cached, so later calls (and [`wait`](Self::wait))
    /// keep reporting it. Signal termination is reported as `-signum`.
    pub fn try_wait(&self) -> Result<Option<i32>, CoaptError> {
        if let Some(code) = self.exit_code.get() {
            return Ok(Some(code));
        }
        let code = match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, sig, _)) => -(sig as i32),
            Ok(_) => return Ok(None),
            // Reaped elsewhere; the status is gone
            Err(nix::errno::Errno::ECHILD) => 0,
            Err(e) => return Err(CoaptError::PtyError(format!("waitpid: {e}"))),
        };
        debug!(pid = self.child_pid.as_raw(), code, "child exited");
        self.exit_code.set(Some(code));
        Ok(Some(code))
    }

    /// Block until the child exits and return its exit code.
    pub fn wait(&self) -> Result<i32, CoaptError> {
        if let Some(code) = self.exit_code.get() {
            return Ok(code);
        }
        loop {
            let code = match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, sig, _)) => -(sig as i32),
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => 0,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(CoaptError::PtyError(format!("waitpid: {e}"))),
            };
            self.exit_code.set(Some(code));
            return Ok(code);
        }
    }

    /// Whether the child is still running (a zombie counts as exited).
    pub fn is_alive(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Duplicate the master fd for a reader running on another thread.
    pub fn clone_master(&self) -> Result<OwnedFd, CoaptError> {
        self.master
            .try_clone()
            .map_err(|e| CoaptError::PtyError(format!("dup master: {e}")))
    }

    /// The child's process ID.
    pub fn pid(&self) -> u32 {
        u32::try_from(self.child_pid.as_raw()).unwrap_or(0)
    }

    /// The child's process group. The child leads its own session, so this
    /// equals its pid.
    pub fn pgid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Poll the master fd for readability with a timeout.
    pub fn poll_readable(&self, timeout_ms: u32) -> Result<bool, CoaptError> {
        let mut poll_fd = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);

        match nix::poll::poll(&mut poll_fd, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = poll_fd[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(CoaptError::PtyError(format!("poll: {e}"))),
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        // Best effort: a session dropped without an orderly teardown still
        // must not leave its process group running.
        if matches!(self.try_wait(), Ok(None)) {
            let _ = signal::killpg(self.child_pid, Signal::SIGKILL);
            let _ = waitpid(self.child_pid, None);
        }
    }
}

/// Read the exec-status pipe until the child closes it.
///
/// An empty result means `exec` succeeded (the write end is close-on-exec).
/// Gives up with a `SpawnError` once `timeout` has passed.
fn read_exec_status(fd: &OwnedFd, timeout: Duration) -> Result<Vec<u8>, CoaptError> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoaptError::SpawnError(format!(
                "child did not exec within {timeout:?}"
            )));
        }
        let ms = u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX);
        let mut poll_fd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        match nix::poll::poll(&mut poll_fd, PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(CoaptError::SpawnError(format!("poll exec status: {e}"))),
        }
        match unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => return Ok(out),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(_) => return Ok(out),
        }
    }
}

/// Decode what `exec_child` wrote: a native-endian errno, then the step.
fn describe_exec_failure(status: &[u8]) -> String {
    let Some(errno) = status.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) else {
        return "setup failed".into();
    };
    format!(
        "{} failed: {}",
        String::from_utf8_lossy(&status[4..]),
        Errno::from_raw(i32::from_ne_bytes(errno))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(session: &PtySession, until: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut buf = [0u8; 1024];
        let mut output = Vec::new();
        while Instant::now() < deadline {
            if session.poll_readable(50).unwrap_or(false) {
                match session.read(&mut buf) {
                    Ok(n) => output.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
            if String::from_utf8_lossy(&output).contains(until) {
                break;
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn spawn_echo_and_read_output() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["hello device".to_string()],
            None,
            &[],
            &PtyOptions::default(),
        )
        .expect("spawn failed");

        let text = drain(&session, "hello device");
        assert!(text.contains("hello device"), "unexpected output: {text:?}");
        assert_eq!(session.wait().expect("wait failed"), 0);
    }

    #[test]
    fn spawn_cat_and_send_line() {
        let session = PtySession::spawn("cat", &[], None, &[], &PtyOptions::default())
            .expect("spawn failed");

        session.send_line("ifconfig 6 add").expect("write failed");
        let text = drain(&session, "ifconfig 6 add");
        assert!(text.contains("ifconfig 6 add"), "unexpected output: {text:?}");

        // Ctrl-D ends cat
        session.write_all(&[0x04]).expect("EOF failed");
        assert_eq!(session.wait().expect("wait failed"), 0);
    }

    #[test]
    fn echo_disabled_by_default() {
        let session = PtySession::spawn(
            "/bin/sh",
            &["-c".into(), "read line; echo got-$line".into()],
            None,
            &[],
            &PtyOptions::default(),
        )
        .expect("spawn failed");

        session.send_line("ping").expect("write failed");
        let text = drain(&session, "got-ping");
        assert!(text.contains("got-ping"));
        assert!(!text.starts_with("ping"), "input was echoed: {text:?}");
        session.wait().ok();
    }

    #[test]
    fn env_overrides_merge_with_inherited() {
        let session = PtySession::spawn(
            "/bin/sh",
            &["-c".into(), "echo port=$PORT path=${PATH:+set}".into()],
            None,
            &[("PORT".into(), "tap1".into())],
            &PtyOptions::default(),
        )
        .expect("spawn failed");

        let text = drain(&session, "path=");
        assert!(text.contains("port=tap1"), "override missing: {text:?}");
        assert!(text.contains("path=set"), "inherited PATH missing: {text:?}");
        session.wait().ok();
    }

    #[test]
    fn runs_in_working_directory() {
        let dir = std::env::temp_dir();
        let session = PtySession::spawn("pwd", &[], Some(&dir), &[], &PtyOptions::default())
            .expect("spawn failed");
        let canonical = dir.canonicalize().unwrap();
        let text = drain(&session, &canonical.display().to_string());
        assert!(
            text.contains(&canonical.display().to_string()),
            "unexpected cwd: {text:?}"
        );
        session.wait().ok();
    }

    #[test]
    fn missing_command_is_spawn_error() {
        let err = PtySession::spawn(
            "definitely-not-a-command-xyz",
            &[],
            None,
            &[],
            &PtyOptions::default(),
        )
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, CoaptError::SpawnError(_)), "got {err:?}");
    }

    #[test]
    fn missing_directory_is_spawn_error() {
        let err = PtySession::spawn(
            "/bin/echo",
            &[],
            Some(Path::new("/nonexistent/coapt/dir")),
            &[],
            &PtyOptions::default(),
        )
        .err()
        .expect("spawn should fail");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn exit_code_is_cached() {
        let session = PtySession::spawn(
            "/bin/sh",
            &["-c".into(), "exit 3".into()],
            None,
            &[],
            &PtyOptions::default(),
        )
        .expect("spawn failed");

        assert_eq!(session.wait().unwrap(), 3);
        assert_eq!(session.try_wait().unwrap(), Some(3));
        assert!(!session.is_alive());
    }

    #[test]
    fn child_leads_its_own_process_group() {
        let session = PtySession::spawn("sleep", &["5".into()], None, &[], &PtyOptions::default())
            .expect("spawn failed");
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(session.pgid()))).unwrap();
        assert_eq!(pgid.as_raw(), session.pgid());
        assert_ne!(pgid, nix::unistd::getpgrp());
        assert!(session.is_alive());
    }

    #[test]
    fn resolve_relative_command_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.sh"), "#!/bin/sh\n").unwrap();
        assert_eq!(
            resolve_command("./server.sh", Some(dir.path()), &[]),
            Some(dir.path().join("./server.sh"))
        );
        assert!(resolve_command("./server.sh", None, &[]).is_none());
    }

    #[test]
    fn exec_failure_is_reported_with_errno() {
        let dir = tempfile::tempdir().unwrap();
        // Present but not executable: resolution succeeds, exec does not
        std::fs::write(dir.path().join("node.sh"), "#!/bin/sh\n").unwrap();
        let err = PtySession::spawn(
            "./node.sh",
            &[],
            Some(dir.path()),
            &[],
            &PtyOptions::default(),
        )
        .err()
        .expect("spawn should fail");
        let text = err.to_string();
        assert!(matches!(err, CoaptError::SpawnError(_)), "got {err:?}");
        assert!(text.contains("exec failed"), "{text}");
    }

    #[test]
    fn overrides_replace_inherited_variables() {
        let env = merged_env(&[
            ("PATH".into(), "/opt/riot/bin".into()),
            ("BOARD".into(), "native".into()),
            ("BOARD".into(), "nrf52dk".into()),
        ])
        .unwrap();
        let entries: Vec<&str> = env.iter().filter_map(|e| e.to_str().ok()).collect();
        assert_eq!(entries.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
        assert!(entries.contains(&"PATH=/opt/riot/bin"));
        assert!(entries.contains(&"BOARD=nrf52dk"));
        assert!(!entries.contains(&"BOARD=native"));
    }

    #[test]
    fn spawn_with_overrides_while_other_threads_read_env() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{mpsc, Arc};

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let _ = std::env::var("PATH");
                    }
                })
            })
            .collect();

        const SPAWNS: usize = 100;
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            for _ in 0..SPAWNS {
                let exited = PtySession::spawn(
                    "true",
                    &[],
                    None,
                    &[("PORT".into(), "tap1".into())],
                    &PtyOptions::default(),
                )
                .and_then(|session| session.wait());
                if done_tx.send(exited.is_ok()).is_err() {
                    return;
                }
            }
        });

        let mut outcome = Ok(());
        for i in 0..SPAWNS {
            match done_rx.recv_timeout(Duration::from_secs(15)) {
                Ok(true) => {}
                Ok(false) => {
                    outcome = Err(format!("spawn #{i} failed"));
                    break;
                }
                Err(_) => {
                    outcome = Err(format!("spawn #{i} did not return"));
                    break;
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        outcome.unwrap();
    }
}
