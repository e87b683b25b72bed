//! Worker Process Handle
//!
//! Creates the single worker process of a run and carries its request/response
//! traffic. Two creation strategies exist:
//!
//! - [`SpawnStrategy::CleanImage`] re-executes the current binary with the hidden
//!   worker flag, so the worker starts from a fresh image and inherits no native
//!   or accelerator state from the parent. The binary's `main` must dispatch
//!   worker mode (see [`crate::run`] and [`crate::serve_worker_if_requested`]).
//! - [`SpawnStrategy::CopyOnWrite`] forks the parent. Cheaper and works from any
//!   binary, including test harnesses, but the child shares the parent's state as
//!   of the fork.
//!
//! Both give the worker a command pipe and a message pipe.

use loadbench_core::{WorkerMain, worker_requested};
use loadbench_ipc::{
    FrameError, FrameReader, FrameWriter, IPC_FD_ENV, OrchestratorCommand, PROTOCOL_VERSION,
    WORKER_FLAG, WorkerCapabilities, WorkerMessage,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a new worker may take to send `Hello`
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the worker process is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnStrategy {
    /// Re-execute the current binary in worker mode
    #[default]
    CleanImage,
    /// Fork the current process
    CopyOnWrite,
}

impl std::fmt::Display for SpawnStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnStrategy::CleanImage => f.write_str("clean-image"),
            SpawnStrategy::CopyOnWrite => f.write_str("copy-on-write"),
        }
    }
}

impl std::str::FromStr for SpawnStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean-image" | "clean" | "spawn" => Ok(SpawnStrategy::CleanImage),
            "copy-on-write" | "cow" | "fork" => Ok(SpawnStrategy::CopyOnWrite),
            other => Err(format!("Unknown spawn strategy: {}", other)),
        }
    }
}

/// Errors talking to a worker process
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Process or pipe creation failed
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// Frame encoding, decoding or pipe I/O failed
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker exited or closed its pipe while a reply was due
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// The worker did not send `Hello` in time
    #[error("Worker sent no handshake within {0:?}; does its main dispatch worker mode?")]
    HandshakeTimeout(Duration),

    /// Spawning was attempted from a process that was itself started as a worker
    #[error("Refusing to spawn a worker from inside a worker process")]
    NestedWorker,

    /// The worker answered with an unexpected message
    #[error("Worker protocol error: expected {expected}, got {got}")]
    ProtocolError {
        /// What the orchestrator waited for
        expected: String,
        /// What arrived
        got: String,
    },
}

impl From<FrameError> for WorkerError {
    fn from(e: FrameError) -> Self {
        WorkerError::Ipc(e.to_string())
    }
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data to be available on a file descriptor with timeout
fn wait_for_data(fd: RawFd, timeout_ms: i32) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return PollResult::Timeout;
        }
        PollResult::Error(err)
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Even if the pipe is closing there might be data
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a pipe pair, returning (read_fd, write_fd).
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Close-on-exec on both ends by default; the clean-image child clears it for its own ends.
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Close a raw file descriptor.
fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Send a signal to a process. Returns `Err` if it could not be delivered.
fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), std::io::Error> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The OS process behind a [`WorkerHandle`]
enum WorkerProcess {
    /// Started through `std::process::Command`
    Spawned(Child),
    /// Started through `fork`; reaped with `waitpid`
    Forked { pid: libc::pid_t, reaped: bool },
}

impl WorkerProcess {
    fn id(&self) -> u32 {
        match self {
            WorkerProcess::Spawned(child) => child.id(),
            WorkerProcess::Forked { pid, .. } => u32::try_from(*pid).unwrap_or(0),
        }
    }

    /// Non-blocking exit check; reaps the process if it has exited
    fn has_exited(&mut self) -> bool {
        match self {
            WorkerProcess::Spawned(child) => !matches!(child.try_wait(), Ok(None)),
            WorkerProcess::Forked { pid, reaped } => {
                if *reaped {
                    return true;
                }
                let mut status: libc::c_int = 0;
                let ret = unsafe { libc::waitpid(*pid, &mut status, libc::WNOHANG) };
                if ret == 0 {
                    false
                } else {
                    // Exited (ret == pid) or no longer our child (ret == -1)
                    *reaped = true;
                    true
                }
            }
        }
    }

    /// Blocking reap
    fn wait(&mut self) {
        match self {
            WorkerProcess::Spawned(child) => {
                let _ = child.wait();
            }
            WorkerProcess::Forked { pid, reaped } => {
                if !*reaped {
                    let mut status: libc::c_int = 0;
                    unsafe {
                        libc::waitpid(*pid, &mut status, 0);
                    }
                    *reaped = true;
                }
            }
        }
    }

    fn kill(&mut self) {
        match self {
            WorkerProcess::Spawned(child) => {
                let _ = child.kill();
            }
            WorkerProcess::Forked { pid, reaped } => {
                if !*reaped {
                    unsafe {
                        libc::kill(*pid, libc::SIGKILL);
                    }
                }
            }
        }
    }
}

/// Worker process handle
pub struct WorkerHandle {
    process: WorkerProcess,
    strategy: SpawnStrategy,
    reader: FrameReader<std::fs::File>,
    writer: FrameWriter<std::fs::File>,
    capabilities: Option<WorkerCapabilities>,
    msg_read_fd: RawFd,
}

impl WorkerHandle {
    /// Start a worker with the given strategy and complete the handshake
    pub fn spawn(strategy: SpawnStrategy) -> Result<Self, WorkerError> {
        Self::spawn_with_timeout(strategy, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Start a worker, giving it `handshake_timeout` to send `Hello`
    ///
    /// Only the handshake is bounded; later replies are awaited for as long as
    /// the worker lives.
    pub fn spawn_with_timeout(
        strategy: SpawnStrategy,
        handshake_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        // A clean-image worker whose main skipped dispatch would otherwise
        // start workers of its own, one level deeper each time.
        if worker_requested() || env::var_os(IPC_FD_ENV).is_some() {
            return Err(WorkerError::NestedWorker);
        }

        // cmd_pipe: orchestrator writes commands, worker reads
        let (cmd_read, cmd_write) = create_pipe()?;
        // msg_pipe: worker writes messages, orchestrator reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(WorkerError::SpawnFailed(e));
            }
        };

        let started = match strategy {
            SpawnStrategy::CleanImage => {
                spawn_clean_image(cmd_read, cmd_write, msg_read, msg_write)
            }
            SpawnStrategy::CopyOnWrite => fork_worker(cmd_read, cmd_write, msg_read, msg_write),
        };
        let process = match started {
            Ok(process) => process,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(WorkerError::SpawnFailed(e));
            }
        };

        // Close the child-side ends in the parent
        close_fd(cmd_read);
        close_fd(msg_write);

        // Wrap parent-side ends in Files
        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };

        let mut handle = Self {
            process,
            strategy,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
            capabilities: None,
            msg_read_fd: msg_read,
        };

        handle.wait_for_hello(handshake_timeout)?;
        Ok(handle)
    }

    /// Wait for Hello message from worker and validate protocol version
    fn wait_for_hello(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        match self.recv_until(Some(Instant::now() + timeout)) {
            Err(WorkerError::HandshakeTimeout(_)) => {
                self.kill();
                Err(WorkerError::HandshakeTimeout(timeout))
            }
            reply => self.accept_hello(reply?),
        }
    }

    fn accept_hello(&mut self, reply: WorkerMessage) -> Result<(), WorkerError> {
        match reply {
            WorkerMessage::Hello(caps) => {
                if caps.protocol_version != PROTOCOL_VERSION {
                    return Err(WorkerError::ProtocolError {
                        expected: format!("protocol version {}", PROTOCOL_VERSION),
                        got: format!("protocol version {}", caps.protocol_version),
                    });
                }
                self.capabilities = Some(caps);
                Ok(())
            }
            other => Err(WorkerError::ProtocolError {
                expected: "Hello".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }

    /// Process id of the worker
    pub fn id(&self) -> u32 {
        self.process.id()
    }

    /// Strategy the worker was created with
    pub fn strategy(&self) -> SpawnStrategy {
        self.strategy
    }

    /// Get worker capabilities
    pub fn capabilities(&self) -> Option<&WorkerCapabilities> {
        self.capabilities.as_ref()
    }

    /// Send one command without waiting for its reply
    pub fn send(&mut self, command: &OrchestratorCommand) -> Result<(), WorkerError> {
        self.writer.write(command)?;
        Ok(())
    }

    /// Send one command and wait for its reply
    pub fn request(&mut self, command: &OrchestratorCommand) -> Result<WorkerMessage, WorkerError> {
        self.send(command)?;
        self.recv()
    }

    /// Wait for the next message
    ///
    /// Blocks for as long as the worker is alive: a hung workload hangs the call.
    pub fn recv(&mut self) -> Result<WorkerMessage, WorkerError> {
        self.recv_until(None)
    }

    /// Wait for the next message, giving up at `deadline` if one is set
    fn recv_until(&mut self, deadline: Option<Instant>) -> Result<WorkerMessage, WorkerError> {
        let started = Instant::now();
        loop {
            // Even with buffered data verify the worker is alive: the buffer
            // might hold an incomplete frame that will never be completed.
            if self.reader.has_buffered_data() {
                if !self.is_alive() {
                    return Err(WorkerError::WorkerCrashed(
                        "Worker process crashed with partial data buffered".to_string(),
                    ));
                }
            } else {
                let mut poll_ms: i32 = 100;
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(WorkerError::HandshakeTimeout(started.elapsed()));
                    }
                    let remaining_ms = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
                    poll_ms = poll_ms.min(remaining_ms.max(1));
                }
                match wait_for_data(self.msg_read_fd, poll_ms) {
                    PollResult::DataAvailable => {}
                    PollResult::Timeout => {
                        if !self.is_alive() {
                            return Err(WorkerError::WorkerCrashed(
                                "Worker process exited unexpectedly".to_string(),
                            ));
                        }
                        continue;
                    }
                    PollResult::PipeClosed => {
                        return Err(WorkerError::WorkerCrashed(
                            "Worker pipe closed unexpectedly".to_string(),
                        ));
                    }
                    PollResult::Error(e) => {
                        return Err(WorkerError::WorkerCrashed(format!("Pipe error: {}", e)));
                    }
                }
            }

            return match self.reader.read::<WorkerMessage>() {
                Ok(msg) => Ok(msg),
                Err(FrameError::EndOfStream) => Err(WorkerError::WorkerCrashed(
                    "Worker closed connection unexpectedly".to_string(),
                )),
                Err(e) => {
                    if !self.is_alive() {
                        return Err(WorkerError::WorkerCrashed(
                            "Worker crashed during read".to_string(),
                        ));
                    }
                    Err(WorkerError::Ipc(e.to_string()))
                }
            };
        }
    }

    /// Shutdown the worker gracefully, killing it if it does not exit promptly
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        self.send(&OrchestratorCommand::Shutdown)?;

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.process.has_exited() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.kill();
        Ok(())
    }

    /// Check if worker process is still running
    pub fn is_alive(&mut self) -> bool {
        !self.process.has_exited()
    }

    /// Kill the worker process forcefully and reap it
    pub fn kill(&mut self) {
        if self.is_alive() {
            self.process.kill();
        }
        self.process.wait();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            // Graceful: SIGTERM first, brief wait, then SIGKILL
            let _ = send_signal(self.process.id(), libc::SIGTERM);
            std::thread::sleep(Duration::from_millis(50));
            if self.is_alive() {
                self.process.kill();
            }
        }
        self.process.wait();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.process.id())
            .field("strategy", &self.strategy)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Re-execute the current binary with fd 3/4 wired to the pipes
fn spawn_clean_image(
    cmd_read: RawFd,
    cmd_write: RawFd,
    msg_read: RawFd,
    msg_write: RawFd,
) -> Result<WorkerProcess, std::io::Error> {
    let binary = env::current_exe()?;

    let mut command = Command::new(binary);
    command
        .arg(WORKER_FLAG)
        .env(IPC_FD_ENV, "3,4")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    // In the child: dup cmd_read→3, msg_write→4, close originals.
    unsafe {
        command.pre_exec(move || {
            // Move cmd_read to fd 3
            if cmd_read != 3 {
                libc::dup2(cmd_read, 3);
                libc::close(cmd_read);
            }
            // Clear close-on-exec for fd 3
            let flags = libc::fcntl(3, libc::F_GETFD);
            libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

            // Move msg_write to fd 4
            if msg_write != 4 {
                libc::dup2(msg_write, 4);
                libc::close(msg_write);
            }
            // Clear close-on-exec for fd 4
            let flags = libc::fcntl(4, libc::F_GETFD);
            libc::fcntl(4, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

            // Close the parent-side ends that leaked into the child
            libc::close(cmd_write);
            libc::close(msg_read);

            Ok(())
        });
    }

    command.spawn().map(WorkerProcess::Spawned)
}

/// Fork a worker that serves the pipes and exits without returning
fn fork_worker(
    cmd_read: RawFd,
    cmd_write: RawFd,
    msg_read: RawFd,
    msg_write: RawFd,
) -> Result<WorkerProcess, std::io::Error> {
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(std::io::Error::last_os_error()),
        0 => {
            unsafe {
                libc::close(cmd_write);
                libc::close(msg_read);
            }
            // Threads holding the stderr lock at fork time no longer exist here.
            // Panics are reported through IPC instead.
            std::panic::set_hook(Box::new(|_| {}));

            // SAFETY: the child owns these two ends exclusively after the fork.
            let mut worker = unsafe { WorkerMain::from_fds(cmd_read, msg_write) };
            let code = if worker.run().is_ok() { 0 } else { 1 };
            drop(worker);
            // Skip atexit handlers and destructors inherited from the parent
            unsafe { libc::_exit(code) }
        }
        pid => Ok(WorkerProcess::Forked { pid, reaped: false }),
    }
}
