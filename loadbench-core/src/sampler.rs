//! Process-Tree Resource Sampler
//!
//! A [`Sampler`] is attached to one process and measures it in scopes. Each
//! scope starts one polling thread that sums CPU usage and virtual memory over
//! the target and all of its live descendants every interval, and pushes the
//! sums into a channel owned by the scope. Closing the scope flips the scope's
//! run flag, wakes and joins the thread and seals what was collected into a
//! [`ScopeRun`].

use fxhash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::debug;

/// Default polling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised by the sampler
#[derive(Debug, Error)]
pub enum SamplerError {
    /// No live process with this pid
    #[error("no live process with pid {0}")]
    TargetNotFound(u32),

    /// `scope_enter` while a scope is open
    #[error("a sampling scope is already open")]
    ScopeAlreadyOpen,

    /// `scope_exit` without an open scope
    #[error("no sampling scope is open")]
    NoOpenScope,

    /// The polling thread could not be started
    #[error("failed to start polling thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The polling thread panicked
    #[error("polling thread panicked")]
    PollerPanicked,
}

/// Resource usage of the whole process tree at one instant
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    /// Offset from the start of the scope
    pub at: Duration,
    /// Summed CPU usage in percent of one core (may exceed 100)
    pub cpu_percent: f64,
    /// Summed virtual memory in bytes
    pub memory_bytes: u64,
}

/// Samples of one closed scope
///
/// Never empty: a scope that collected nothing holds one zero-valued sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeRun {
    samples: Vec<Sample>,
    synthetic: bool,
    target_lost: bool,
    elapsed: Duration,
}

impl ScopeRun {
    fn seal(samples: Vec<Sample>, target_lost: bool, elapsed: Duration) -> Self {
        if samples.is_empty() {
            Self {
                samples: vec![Sample::default()],
                synthetic: true,
                target_lost,
                elapsed,
            }
        } else {
            Self {
                samples,
                synthetic: false,
                target_lost,
                elapsed,
            }
        }
    }

    /// Samples in collection order
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples (at least 1)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always false for a sealed scope
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the scope collected nothing and holds the zero placeholder
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Whether the target vanished while the scope was open
    pub fn target_lost(&self) -> bool {
        self.target_lost
    }

    /// Time between enter and exit
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// CPU percentages in collection order
    pub fn cpu_series(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.cpu_percent).collect()
    }

    /// Memory sizes in bytes, in collection order
    pub fn memory_series(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.memory_bytes as f64).collect()
    }
}

struct OpenScope {
    running: Arc<AtomicBool>,
    handle: JoinHandle<bool>,
    receiver: Receiver<Sample>,
    started: Instant,
}

impl OpenScope {
    /// Clear the run flag and cut the poller's current wait short
    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.handle.thread().unpark();
    }
}

/// Samples the resource usage of one process tree
pub struct Sampler {
    target: Pid,
    interval: Duration,
    scope: Option<OpenScope>,
}

impl Sampler {
    /// Bind to a live process. Does not start sampling.
    pub fn attach(pid: u32, interval: Duration) -> Result<Self, SamplerError> {
        let target = Pid::from_u32(pid);
        if !is_alive(target) {
            return Err(SamplerError::TargetNotFound(pid));
        }
        Ok(Self {
            target,
            interval,
            scope: None,
        })
    }

    /// Pid of the sampled process
    pub fn target(&self) -> u32 {
        self.target.as_u32()
    }

    /// Polling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a scope is open
    pub fn is_active(&self) -> bool {
        self.scope.is_some()
    }

    /// Open a scope and start polling
    pub fn scope_enter(&mut self) -> Result<(), SamplerError> {
        if self.scope.is_some() {
            return Err(SamplerError::ScopeAlreadyOpen);
        }
        if !is_alive(self.target) {
            return Err(SamplerError::TargetNotFound(self.target.as_u32()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = mpsc::channel();
        let started = Instant::now();

        let poller = Poller {
            target: self.target,
            interval: self.interval,
            running: Arc::clone(&running),
            sender,
            started,
        };
        let handle = thread::Builder::new()
            .name(format!("loadbench-sampler-{}", self.target))
            .spawn(move || poller.run())
            .map_err(SamplerError::Spawn)?;

        self.scope = Some(OpenScope {
            running,
            handle,
            receiver,
            started,
        });
        Ok(())
    }

    /// Close the open scope, wait for the polling thread and seal its samples
    pub fn scope_exit(&mut self) -> Result<ScopeRun, SamplerError> {
        let scope = self.scope.take().ok_or(SamplerError::NoOpenScope)?;
        scope.stop();
        let target_lost = scope
            .handle
            .join()
            .map_err(|_| SamplerError::PollerPanicked)?;
        let elapsed = scope.started.elapsed();

        let samples: Vec<Sample> = scope.receiver.try_iter().collect();
        Ok(ScopeRun::seal(samples, target_lost, elapsed))
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.stop();
            let _ = scope.handle.join();
        }
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("target", &self.target)
            .field("interval", &self.interval)
            .field("active", &self.is_active())
            .finish()
    }
}

/// State moved into the polling thread
struct Poller {
    target: Pid,
    interval: Duration,
    running: Arc<AtomicBool>,
    sender: Sender<Sample>,
    started: Instant,
}

impl Poller {
    /// Poll until stopped. Returns whether the target vanished.
    fn run(self) -> bool {
        let mut system = System::new();

        // CPU usage is a delta between two refreshes; the first one only primes it.
        system.refresh_processes(ProcessesToUpdate::All, true);
        if tree_usage(&system, self.target).is_none() {
            return self.lose_target();
        }

        while self.pause() {
            system.refresh_processes(ProcessesToUpdate::All, true);

            let Some((cpu_percent, memory_bytes)) = tree_usage(&system, self.target) else {
                return self.lose_target();
            };

            let sample = Sample {
                at: self.started.elapsed(),
                cpu_percent,
                memory_bytes,
            };
            if self.sender.send(sample).is_err() {
                break;
            }
        }
        false
    }

    /// Wait one interval. Returns false as soon as the scope is closed.
    fn pause(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            if !self.running.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            // Unparked by `OpenScope::stop`; spurious wakeups loop around
            thread::park_timeout(deadline - now);
        }
    }

    fn lose_target(&self) -> bool {
        debug!(
            pid = self.target.as_u32(),
            after = ?self.started.elapsed(),
            "sampled process tree vanished"
        );
        self.running.store(false, Ordering::Release);
        true
    }
}

fn is_terminal(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn is_alive(pid: Pid) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| !is_terminal(process.status()))
}

/// Summed CPU percent and virtual memory over `root` and its live descendants.
/// `None` when the root itself is gone.
fn tree_usage(system: &System, root: Pid) -> Option<(f64, u64)> {
    let root_process = system.process(root)?;
    if is_terminal(root_process.status()) {
        return None;
    }

    let mut children: FxHashMap<Pid, Vec<Pid>> = FxHashMap::default();
    for (pid, process) in system.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut cpu = 0.0f64;
    let mut memory = 0u64;
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        let Some(process) = system.process(pid) else {
            continue;
        };
        if is_terminal(process.status()) {
            continue;
        }

        let usage = f64::from(process.cpu_usage());
        if usage.is_finite() {
            cpu += usage;
        }
        memory = memory.saturating_add(process.virtual_memory());

        if let Some(kids) = children.get(&pid) {
            pending.extend(kids.iter().copied());
        }
    }

    Some((cpu, memory))
}
