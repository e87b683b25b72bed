//! IPC Message Types
//!
//! All messages are serialized with rkyv. The orchestrator sends one
//! [`OrchestratorCommand`] at a time and waits for exactly one [`WorkerMessage`].

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use std::fmt;

/// Phase of a run in which a workload hook failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum Phase {
    /// The one-off setup hook
    Setup,
    /// Untimed warmup rounds
    Warmup,
    /// Measured round `i` (including its prerun hook)
    Round(u32),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => f.write_str("setup"),
            Phase::Warmup => f.write_str("warmup"),
            Phase::Round(i) => write!(f, "round {i}"),
        }
    }
}

/// Elapsed time of one measured workload invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RoundTiming {
    /// Wall-clock nanoseconds
    pub wall_nanos: u64,
    /// CPU time consumed by the worker process, in nanoseconds
    pub cpu_nanos: u64,
}

/// Worker capabilities advertised during handshake
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerCapabilities {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// Process id of the worker
    pub pid: u32,
    /// Whether the allocator supports explicit reclamation control
    pub has_reclamation_control: bool,
    /// Number of logical CPUs configured on the host
    pub cpu_count: u32,
}

impl WorkerCapabilities {
    /// Capabilities of the calling process
    pub fn current() -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id(),
            has_reclamation_control: cfg!(all(target_os = "linux", target_env = "gnu")),
            cpu_count: std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1),
        }
    }
}

/// Commands sent from the orchestrator to the worker
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum OrchestratorCommand {
    /// Append a piece of the JSON-encoded user context. Answered by `ContextReceived`.
    ///
    /// The context may be larger than one frame, so it travels in pieces of at
    /// most [`crate::CONTEXT_CHUNK_SIZE`] bytes before `Startup`.
    Context {
        /// Next bytes of the encoded context
        chunk: Vec<u8>,
    },

    /// Bind the workload to the collected context, run setup and warmup.
    /// Answered by `Ready` or `Failure`.
    Startup {
        /// Registered workload identifier
        workload: String,
        /// Number of untimed warmup rounds
        warmup_rounds: u32,
    },

    /// Run the prerun hook and a reclamation pass. Answered by `PrerunDone` or `Failure`.
    Prerun {
        /// Round index
        round: u32,
    },

    /// Time one workload invocation. Answered by `RoundComplete` or `Failure`.
    Round {
        /// Round index
        round: u32,
        /// Keep automatic memory reclamation enabled during the timed call
        reclamation_active: bool,
    },

    /// Leave the worker loop and exit
    Shutdown,
}

/// Messages sent from the worker to the orchestrator
#[derive(Debug, Clone, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Initial handshake
    Hello(WorkerCapabilities),

    /// A context piece was appended
    ContextReceived {
        /// Context bytes collected so far
        total_bytes: u64,
    },

    /// Startup finished; measured rounds may begin
    Ready {
        /// Pid to attach the sampler to
        pid: u32,
        /// Whether the CPU affinity mask was widened to all cores
        affinity_reset: bool,
    },

    /// Prerun hook and reclamation pass finished
    PrerunDone,

    /// One measured round finished
    RoundComplete(RoundTiming),

    /// A hook returned an error or panicked
    Failure {
        /// Where it happened
        phase: Phase,
        /// Human-readable error message
        message: String,
    },
}

impl WorkerMessage {
    /// Short variant name for protocol error reports
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Hello(_) => "Hello",
            WorkerMessage::ContextReceived { .. } => "ContextReceived",
            WorkerMessage::Ready { .. } => "Ready",
            WorkerMessage::PrerunDone => "PrerunDone",
            WorkerMessage::RoundComplete(_) => "RoundComplete",
            WorkerMessage::Failure { .. } => "Failure",
        }
    }
}
