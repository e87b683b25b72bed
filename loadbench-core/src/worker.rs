//! Worker Process Entry Point
//!
//! Handles the worker side of the orchestrator-worker architecture. The worker
//! answers every [`OrchestratorCommand`] with exactly one [`WorkerMessage`] and
//! keeps the bound workload alive between commands, so setup state carries over
//! into every round.
//!
//! On Unix, uses fd 3/4 for IPC (set via `LOADBENCH_IPC_FD`) when the worker was
//! started from a fresh executable image, or the pipe ends inherited through
//! `fork`. On non-Unix, falls back to stdin/stdout.
//!
//! The worker never logs: a forked worker may have inherited a subscriber whose
//! locks were held by another parent thread at fork time.

use crate::measure::{Timer, reset_affinity};
use crate::reclaim::{self, SuspendGuard};
use crate::workload::{BoundWorkload, HookResult, find_workload};
use loadbench_ipc::{
    FrameError, FrameReader, FrameWriter, IPC_FD_ENV, OrchestratorCommand, Phase, WORKER_FLAG,
    WorkerCapabilities, WorkerMessage,
};
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};

#[cfg(unix)]
use std::os::unix::io::{FromRawFd, RawFd};

/// Whether the current process was launched as a worker
pub fn worker_requested() -> bool {
    std::env::args().any(|arg| arg == WORKER_FLAG)
}

/// IPC transport: either inherited fd pair or stdin/stdout fallback.
enum IpcTransport {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> IpcTransport {
    #[cfg(unix)]
    if let Ok(val) = std::env::var(IPC_FD_ENV) {
        if let Some((r, w)) = val.split_once(',') {
            if let (Ok(read_fd), Ok(write_fd)) = (r.parse::<i32>(), w.parse::<i32>()) {
                return IpcTransport::Fds { read_fd, write_fd };
            }
        }
        eprintln!(
            "loadbench: warning: invalid {IPC_FD_ENV}={val:?} (expected format: <read_fd>,<write_fd>), falling back to stdio"
        );
    }
    IpcTransport::Stdio
}

/// Worker main loop
pub struct WorkerMain<R: Read = Box<dyn Read>, W: Write = Box<dyn Write>> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    context: Vec<u8>,
    bound: Option<Box<dyn BoundWorkload>>,
}

impl WorkerMain {
    /// Create a worker, using fd 3/4 if `LOADBENCH_IPC_FD` is set, otherwise stdin/stdout.
    pub fn new() -> Self {
        match detect_transport() {
            #[cfg(unix)]
            // SAFETY: the orchestrator placed these fds before exec and nothing else owns them.
            IpcTransport::Fds { read_fd, write_fd } => unsafe { Self::from_fds(read_fd, write_fd) },
            IpcTransport::Stdio => WorkerMain::with_streams(
                Box::new(std::io::stdin()) as Box<dyn Read>,
                Box::new(std::io::stdout()) as Box<dyn Write>,
            ),
        }
    }

    /// Create a worker on an inherited pipe pair
    ///
    /// # Safety
    ///
    /// Both fds must be open, and the worker takes ownership of them.
    #[cfg(unix)]
    pub unsafe fn from_fds(read_fd: RawFd, write_fd: RawFd) -> Self {
        // SAFETY: upheld by the caller.
        let (read_file, write_file) = unsafe {
            (
                std::fs::File::from_raw_fd(read_fd),
                std::fs::File::from_raw_fd(write_fd),
            )
        };
        WorkerMain::with_streams(
            Box::new(read_file) as Box<dyn Read>,
            Box::new(write_file) as Box<dyn Write>,
        )
    }
}

impl Default for WorkerMain {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read, W: Write> WorkerMain<R, W> {
    /// Create a worker on arbitrary streams
    pub fn with_streams(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            context: Vec::new(),
            bound: None,
        }
    }

    /// Run the worker main loop until `Shutdown` or the orchestrator hangs up
    pub fn run(&mut self) -> Result<(), FrameError> {
        self.writer
            .write(&WorkerMessage::Hello(WorkerCapabilities::current()))?;

        loop {
            let command: OrchestratorCommand = match self.reader.read() {
                Ok(command) => command,
                Err(FrameError::EndOfStream) => break,
                Err(e) => return Err(e),
            };

            let reply = match command {
                OrchestratorCommand::Context { chunk } => {
                    self.context.extend_from_slice(&chunk);
                    WorkerMessage::ContextReceived {
                        total_bytes: self.context.len() as u64,
                    }
                }
                OrchestratorCommand::Startup {
                    workload,
                    warmup_rounds,
                } => self.startup(&workload, warmup_rounds),
                OrchestratorCommand::Prerun { round } => self.prerun(round),
                OrchestratorCommand::Round {
                    round,
                    reclamation_active,
                } => self.round(round, reclamation_active),
                OrchestratorCommand::Shutdown => break,
            };
            self.writer.write(&reply)?;
        }

        Ok(())
    }

    fn startup(&mut self, workload: &str, warmup_rounds: u32) -> WorkerMessage {
        if self.bound.is_some() {
            return failure(Phase::Setup, "workload already started".to_string());
        }
        let Some(def) = find_workload(workload) else {
            return failure(Phase::Setup, format!("workload not found: {workload}"));
        };
        let context = std::mem::take(&mut self.context);
        let context_json = match String::from_utf8(context) {
            Ok(json) => json,
            Err(e) => {
                return failure(Phase::Setup, format!("context is not UTF-8: {e}"));
            }
        };
        let mut bound = match def.bind(&context_json) {
            Ok(bound) => bound,
            Err(e) => {
                return failure(Phase::Setup, format!("invalid context for {workload}: {e}"));
            }
        };

        let affinity_reset = reset_affinity().is_ok();
        reclaim::resume();

        if let Err(message) = guarded(|| bound.setup()) {
            return failure(Phase::Setup, message);
        }
        for _ in 0..warmup_rounds {
            if let Err(message) = guarded(|| {
                bound.prerun()?;
                bound.run()
            }) {
                return failure(Phase::Warmup, message);
            }
        }
        reclaim::collect();

        self.bound = Some(bound);
        WorkerMessage::Ready {
            pid: std::process::id(),
            affinity_reset,
        }
    }

    fn prerun(&mut self, round: u32) -> WorkerMessage {
        let Some(bound) = self.bound.as_mut() else {
            return not_started(round);
        };
        match guarded(|| bound.prerun()) {
            Ok(()) => {
                reclaim::collect();
                WorkerMessage::PrerunDone
            }
            Err(message) => failure(Phase::Round(round), message),
        }
    }

    fn round(&mut self, round: u32, reclamation_active: bool) -> WorkerMessage {
        let Some(bound) = self.bound.as_mut() else {
            return not_started(round);
        };

        let guard = SuspendGuard::new(reclamation_active);
        let timer = Timer::start();
        let outcome = guarded(|| bound.run());
        let timing = timer.stop();
        drop(guard);

        match outcome {
            Ok(()) => WorkerMessage::RoundComplete(timing),
            Err(message) => failure(Phase::Round(round), message),
        }
    }
}

fn failure(phase: Phase, message: String) -> WorkerMessage {
    WorkerMessage::Failure { phase, message }
}

fn not_started(round: u32) -> WorkerMessage {
    failure(Phase::Round(round), "workload not started".to_string())
}

/// Run a hook, turning both error returns and panics into a message
fn guarded(hook: impl FnOnce() -> HookResult) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error.to_string()),
        Err(panic) => Err(if let Some(s) = panic.downcast_ref::<&str>() {
            format!("panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("panicked: {s}")
        } else {
            "panicked".to_string()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::Workload;
    use std::io::Cursor;

    #[derive(Default)]
    struct Scripted {
        ready: bool,
    }

    #[derive(serde::Deserialize)]
    struct Script {
        fail_setup: bool,
        panic_on_run: bool,
    }

    impl Workload for Scripted {
        type Context = Script;

        fn setup(&mut self, script: &Script) -> HookResult {
            if script.fail_setup {
                return Err("setup refused".into());
            }
            self.ready = true;
            Ok(())
        }

        fn run(&mut self, script: &Script) -> HookResult {
            if script.panic_on_run {
                panic!("workload exploded");
            }
            if !self.ready {
                return Err("setup state lost".into());
            }
            Ok(())
        }
    }

    crate::workload!("core-test-scripted", Scripted);

    fn session(commands: &[OrchestratorCommand]) -> Vec<WorkerMessage> {
        let mut input = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut input);
            for command in commands {
                writer.write(command).unwrap();
            }
        }

        let mut output = Vec::new();
        WorkerMain::with_streams(Cursor::new(input), &mut output)
            .run()
            .unwrap();

        let mut reader = FrameReader::new(Cursor::new(output));
        let mut replies = Vec::new();
        loop {
            match reader.read::<WorkerMessage>() {
                Ok(message) => replies.push(message),
                Err(FrameError::EndOfStream) => break,
                Err(e) => panic!("bad reply stream: {e}"),
            }
        }
        replies
    }

    fn context(json: &str) -> OrchestratorCommand {
        OrchestratorCommand::Context {
            chunk: json.as_bytes().to_vec(),
        }
    }

    fn scripted() -> OrchestratorCommand {
        OrchestratorCommand::Startup {
            workload: "core-test-scripted".to_string(),
            warmup_rounds: 0,
        }
    }

    fn script(fail_setup: bool, panic_on_run: bool) -> OrchestratorCommand {
        context(&format!(
            r#"{{"fail_setup": {fail_setup}, "panic_on_run": {panic_on_run}}}"#
        ))
    }

    #[test]
    fn test_full_session() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let replies = session(&[
            script(false, false),
            scripted(),
            OrchestratorCommand::Prerun { round: 0 },
            OrchestratorCommand::Round {
                round: 0,
                reclamation_active: false,
            },
            OrchestratorCommand::Shutdown,
        ]);

        let kinds: Vec<&str> = replies.iter().map(WorkerMessage::kind).collect();
        assert_eq!(
            kinds,
            ["Hello", "ContextReceived", "Ready", "PrerunDone", "RoundComplete"]
        );
        assert!(
            matches!(replies[2], WorkerMessage::Ready { pid, .. } if pid == std::process::id())
        );
        assert!(reclaim::is_enabled());
    }

    #[test]
    fn test_setup_failure_is_reported() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let replies = session(&[
            script(true, false),
            scripted(),
            OrchestratorCommand::Prerun { round: 0 },
        ]);

        match &replies[2] {
            WorkerMessage::Failure { phase, message } => {
                assert_eq!(*phase, Phase::Setup);
                assert_eq!(message, "setup refused");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        // Nothing was bound, so later commands fail too
        assert!(matches!(
            replies[3],
            WorkerMessage::Failure {
                phase: Phase::Round(0),
                ..
            }
        ));
    }

    #[test]
    fn test_panic_in_round_is_reported_and_reclamation_restored() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let replies = session(&[
            script(false, true),
            scripted(),
            OrchestratorCommand::Prerun { round: 2 },
            OrchestratorCommand::Round {
                round: 2,
                reclamation_active: false,
            },
        ]);

        match &replies[4] {
            WorkerMessage::Failure { phase, message } => {
                assert_eq!(*phase, Phase::Round(2));
                assert!(message.contains("workload exploded"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(reclaim::is_enabled());
    }

    #[test]
    fn test_unknown_workload() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let replies = session(&[
            context("null"),
            OrchestratorCommand::Startup {
                workload: "missing".to_string(),
                warmup_rounds: 3,
            },
        ]);
        assert!(matches!(
            &replies[2],
            WorkerMessage::Failure { phase: Phase::Setup, message } if message.contains("missing")
        ));
    }

    #[test]
    fn test_context_pieces_are_joined_before_binding() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let json = r#"{"fail_setup": false, "panic_on_run": false}"#;
        // Split inside a key so neither piece is valid JSON on its own
        let (head, tail) = json.split_at(7);
        let replies = session(&[
            context(head),
            context(tail),
            scripted(),
            OrchestratorCommand::Prerun { round: 0 },
            OrchestratorCommand::Round {
                round: 0,
                reclamation_active: true,
            },
        ]);

        assert!(matches!(
            replies[1],
            WorkerMessage::ContextReceived { total_bytes: 7 }
        ));
        assert!(matches!(
            replies[2],
            WorkerMessage::ContextReceived { total_bytes } if total_bytes == json.len() as u64
        ));
        assert_eq!(replies[3].kind(), "Ready");
        assert_eq!(replies[5].kind(), "RoundComplete");
    }

    #[test]
    fn test_split_utf8_context_is_rejoined() {
        let _lock = reclaim::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // A string context is invalid for this workload; the error must come
        // from JSON decoding, not from a character split across two pieces
        let bytes = "\"grüße\"".as_bytes();
        let split = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let replies = session(&[
            OrchestratorCommand::Context {
                chunk: bytes[..split].to_vec(),
            },
            OrchestratorCommand::Context {
                chunk: bytes[split..].to_vec(),
            },
            scripted(),
        ]);
        match &replies[3] {
            WorkerMessage::Failure { phase, message } => {
                assert_eq!(*phase, Phase::Setup);
                assert!(message.starts_with("invalid context"), "{message}");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
