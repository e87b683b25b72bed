#![warn(missing_docs)]
//! LoadBench IPC Protocol
//!
//! Message protocol between the orchestrator and its worker process.
//! Uses rkyv for binary serialization with validation on the receiving side.
//! Every command is answered by exactly one worker message, so the protocol is
//! strictly request/response after the initial `Hello`.

mod framing;
mod messages;

pub use framing::{FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_frame, write_frame};
pub use messages::{OrchestratorCommand, Phase, RoundTiming, WorkerCapabilities, WorkerMessage};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest context piece carried by one `Context` command
pub const CONTEXT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Environment variable carrying the inherited `<read_fd>,<write_fd>` pair
pub const IPC_FD_ENV: &str = "LOADBENCH_IPC_FD";

/// Hidden command-line flag that switches a binary into worker mode
pub const WORKER_FLAG: &str = "--loadbench-worker";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_flag_is_long_option() {
        assert!(WORKER_FLAG.starts_with("--"));
        assert_eq!(PROTOCOL_VERSION, 1);
        assert!(CONTEXT_CHUNK_SIZE < MAX_FRAME_SIZE);
    }
}
