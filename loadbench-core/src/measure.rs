//! Round Timing and CPU Affinity
//!
//! A measured round records both wall-clock time and the CPU time consumed by the
//! whole worker process. Process CPU time comes from `CLOCK_PROCESS_CPUTIME_ID`,
//! so helper threads spawned by the workload are included.

use loadbench_ipc::RoundTiming;
use std::time::{Duration, Instant};

/// CPU time consumed by the calling process so far
#[cfg(unix)]
pub fn process_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and the clock id is a constant.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(
        u64::try_from(ts.tv_sec).unwrap_or(0),
        u32::try_from(ts.tv_nsec).unwrap_or(0),
    )
}

/// CPU time consumed by the calling process so far
#[cfg(not(unix))]
pub fn process_cpu_time() -> Duration {
    Duration::ZERO
}

/// Timer for one measured workload invocation
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    wall: Instant,
    cpu: Duration,
}

impl Timer {
    /// Start a new timer
    #[inline(always)]
    pub fn start() -> Self {
        let cpu = process_cpu_time();
        Self {
            wall: Instant::now(),
            cpu,
        }
    }

    /// Stop the timer
    #[inline(always)]
    pub fn stop(&self) -> RoundTiming {
        let wall = self.wall.elapsed();
        let cpu = process_cpu_time().saturating_sub(self.cpu);
        RoundTiming {
            wall_nanos: u64::try_from(wall.as_nanos()).unwrap_or(u64::MAX),
            cpu_nanos: u64::try_from(cpu.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

/// Widen the calling thread's CPU affinity to every configured core
///
/// A parent that was pinned to one core would otherwise hand the restriction down
/// to its worker. Returns the number of cores in the new mask.
#[cfg(target_os = "linux")]
pub fn reset_affinity() -> Result<usize, std::io::Error> {
    use std::mem::MaybeUninit;

    // SAFETY: sysconf has no preconditions.
    let configured = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    let configured = usize::try_from(configured).unwrap_or(1).max(1);
    let cores = configured.min(libc::CPU_SETSIZE as usize);

    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
        let set_ref = set.assume_init_mut();

        libc::CPU_ZERO(set_ref);
        for cpu in 0..cores {
            libc::CPU_SET(cpu, set_ref);
        }

        let result = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set_ref);

        if result == 0 {
            Ok(cores)
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Affinity control is Linux-only; reports the available parallelism
#[cfg(not(target_os = "linux"))]
pub fn reset_affinity() -> Result<usize, std::io::Error> {
    Ok(std::thread::available_parallelism().map_or(1, |n| n.get()))
}

/// Cores the calling thread may currently run on
#[cfg(target_os = "linux")]
pub fn current_affinity() -> Result<Vec<usize>, std::io::Error> {
    use std::mem::MaybeUninit;

    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();

        let result =
            libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set.as_mut_ptr());
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let set = set.assume_init();
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

/// Cores the calling thread may currently run on
#[cfg(not(target_os = "linux"))]
pub fn current_affinity() -> Result<Vec<usize>, std::io::Error> {
    Ok((0..std::thread::available_parallelism().map_or(1, |n| n.get())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_wall_time() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(10));
        let timing = timer.stop();

        assert!(timing.wall_nanos >= 5_000_000);
        // Sleeping burns almost no CPU
        assert!(timing.cpu_nanos < timing.wall_nanos);
    }

    #[test]
    #[cfg(unix)]
    fn test_timer_counts_busy_cpu() {
        let timer = Timer::start();
        let until = Instant::now() + Duration::from_millis(30);
        let mut x = 0u64;
        while Instant::now() < until {
            x = std::hint::black_box(x.wrapping_add(1));
        }
        let timing = timer.stop();

        assert!(timing.cpu_nanos >= 10_000_000, "cpu time was {timing:?}");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_reset_affinity_covers_all_cores() {
        let handle = std::thread::spawn(|| {
            let cores = reset_affinity().unwrap();
            let mask = current_affinity().unwrap();
            (cores, mask)
        });
        let (cores, mask) = handle.join().unwrap();
        // Containers may restrict the usable set below the configured count
        assert!(!mask.is_empty());
        assert!(mask.len() <= cores);
    }
}
