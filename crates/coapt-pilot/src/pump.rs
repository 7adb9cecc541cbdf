//! Background output collection.
//!
//! A host keeps writing whether or not anybody is waiting on it. The pump
//! drains the process output on its own thread and forwards raw chunks over
//! a channel, so the kernel buffer never fills up between expectations and
//! nothing is lost while the harness is busy elsewhere.

use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use coapt_types::CoaptError;

use crate::pty::PtySession;

/// Poll tick; bounds how long [`OutputPump::stop`] waits for the thread.
const POLL_TICK_MS: u16 = 50;

const CHUNK_SIZE: usize = 4096;

/// Reader threads feeding a single output channel.
pub struct OutputPump {
    stop: Arc<AtomicBool>,
    /// Threads that observe the stop flag and can be joined.
    joinable: Vec<JoinHandle<()>>,
    /// Blocking readers; they finish on EOF and are never joined.
    detached: Vec<JoinHandle<()>>,
}

impl OutputPump {
    /// Pump the master side of a PTY session.
    pub fn from_pty(session: &PtySession) -> Result<(Self, Receiver<Vec<u8>>), CoaptError> {
        let fd = session.clone_master()?;
        Self::from_fd(fd)
    }

    /// Pump a non-blocking file descriptor until EOF, EIO or [`stop`](Self::stop).
    pub fn from_fd(fd: OwnedFd) -> Result<(Self, Receiver<Vec<u8>>), CoaptError> {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("coapt-pty-reader".into())
            .spawn(move || pump_fd(fd, tx, flag))
            .map_err(|e| CoaptError::PtyError(format!("spawn reader thread: {e}")))?;

        Ok((
            Self {
                stop,
                joinable: vec![handle],
                detached: Vec::new(),
            },
            rx,
        ))
    }

    /// Pump any number of blocking readers (e.g. a child's stdout and
    /// stderr) into one channel. Chunks from different readers interleave
    /// in arrival order.
    pub fn from_readers<R>(readers: Vec<R>) -> Result<(Self, Receiver<Vec<u8>>), CoaptError>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let mut detached = Vec::with_capacity(readers.len());
        for (index, reader) in readers.into_iter().enumerate() {
            let tx = tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("coapt-pipe-reader-{index}"))
                .spawn(move || pump_reader(reader, tx))
                .map_err(|e| CoaptError::PtyError(format!("spawn reader thread: {e}")))?;
            detached.push(handle);
        }
        Ok((
            Self {
                stop: Arc::new(AtomicBool::new(false)),
                joinable: Vec::new(),
                detached,
            },
            rx,
        ))
    }

    /// Whether every reader has finished.
    pub fn is_finished(&self) -> bool {
        self.joinable
            .iter()
            .chain(self.detached.iter())
            .all(|h| h.is_finished())
    }

    /// Stop the pump and join the threads that can be joined.
    ///
    /// Blocking pipe readers are left to finish on EOF, which happens once
    /// the process group is gone.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.joinable.drain(..) {
            let _ = handle.join();
        }
        self.detached.retain(|h| !h.is_finished());
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_fd(fd: OwnedFd, tx: Sender<Vec<u8>>, stop: Arc<AtomicBool>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    while !stop.load(Ordering::SeqCst) {
        let mut poll_fd = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        match nix::poll::poll(&mut poll_fd, PollTimeout::from(POLL_TICK_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                debug!(error = %e, "reader poll failed");
                break;
            }
        }

        match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "output chunk");
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => continue,
            // EIO: the slave side closed, the process is gone
            Err(nix::errno::Errno::EIO) => break,
            Err(e) => {
                debug!(error = %e, "reader read failed");
                break;
            }
        }
    }
    debug!("pty reader finished");
}

fn pump_reader<R: Read>(mut reader: R, tx: Sender<Vec<u8>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyOptions;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    fn collect(rx: &Receiver<Vec<u8>>, until: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut out = Vec::new();
        while Instant::now() < deadline {
            if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(50)) {
                out.extend_from_slice(&chunk);
            }
            if String::from_utf8_lossy(&out).contains(until) {
                break;
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn pumps_pty_output_without_a_reader_waiting() {
        let session = PtySession::spawn(
            "/bin/sh",
            &["-c".into(), "echo first; sleep 0.2; echo second".into()],
            None,
            &[],
            &PtyOptions::default(),
        )
        .unwrap();
        let (mut pump, rx) = OutputPump::from_pty(&session).unwrap();

        std::thread::sleep(Duration::from_millis(500));
        let text = collect(&rx, "second");
        assert!(text.contains("first") && text.contains("second"), "{text:?}");

        session.wait().unwrap();
        pump.stop();
        assert!(pump.is_finished());
    }

    #[test]
    fn stop_ends_reader_on_live_process() {
        let session =
            PtySession::spawn("sleep", &["5".into()], None, &[], &PtyOptions::default()).unwrap();
        let (mut pump, _rx) = OutputPump::from_pty(&session).unwrap();

        let started = Instant::now();
        pump.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn merges_pipe_readers() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("echo out-line; echo err-line 1>&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout: Box<dyn Read + Send> = Box::new(child.stdout.take().unwrap());
        let stderr: Box<dyn Read + Send> = Box::new(child.stderr.take().unwrap());
        let (pump, rx) = OutputPump::from_readers(vec![stdout, stderr]).unwrap();

        let mut text = collect(&rx, "out-line");
        if !text.contains("err-line") {
            text.push_str(&collect(&rx, "err-line"));
        }
        assert!(text.contains("out-line"), "{text:?}");
        assert!(text.contains("err-line"), "{text:?}");

        child.wait().unwrap();
        drop(pump);
    }
}
