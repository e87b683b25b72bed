//! Automatic Memory Reclamation Control
//!
//! The worker's allocator normally hands freed memory back to the OS on its own
//! schedule. Inside a measured round that is noise, so a round can run with
//! automatic reclamation suspended and an explicit [`collect`] pass happens in the
//! untimed prerun window instead.
//!
//! On glibc targets suspension raises `M_TRIM_THRESHOLD` so `free` never trims the
//! heap top, and [`collect`] calls `malloc_trim`. Elsewhere only the flag is tracked.

use std::sync::atomic::{AtomicBool, Ordering};

/// glibc's documented default for `M_TRIM_THRESHOLD`
const DEFAULT_TRIM_THRESHOLD: libc::c_int = 128 * 1024;

static AUTOMATIC: AtomicBool = AtomicBool::new(true);

/// Serializes unit tests that toggle the process-wide state
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Whether automatic reclamation is currently enabled in this process
pub fn is_enabled() -> bool {
    AUTOMATIC.load(Ordering::Acquire)
}

/// Run an explicit reclamation pass. Returns whether memory went back to the OS.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub fn collect() -> bool {
    // SAFETY: malloc_trim only walks allocator-internal state.
    unsafe { libc::malloc_trim(0) == 1 }
}

/// Run an explicit reclamation pass. Returns whether memory went back to the OS.
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub fn collect() -> bool {
    false
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn set_trim_threshold(threshold: libc::c_int) {
    // SAFETY: mallopt is thread-safe and takes plain integers.
    unsafe {
        libc::mallopt(libc::M_TRIM_THRESHOLD, threshold);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn set_trim_threshold(_threshold: libc::c_int) {}

/// Disable automatic reclamation
pub fn suspend() {
    set_trim_threshold(libc::c_int::MAX);
    AUTOMATIC.store(false, Ordering::Release);
}

/// Re-enable automatic reclamation
pub fn resume() {
    set_trim_threshold(DEFAULT_TRIM_THRESHOLD);
    AUTOMATIC.store(true, Ordering::Release);
}

/// Keeps automatic reclamation suspended until dropped
///
/// Dropping always re-enables reclamation, whether the guarded call returned,
/// failed, or unwound.
#[derive(Debug)]
#[must_use = "reclamation resumes as soon as the guard is dropped"]
pub struct SuspendGuard {
    suspended: bool,
}

impl SuspendGuard {
    /// Suspend reclamation unless `keep_active` is set
    pub fn new(keep_active: bool) -> Self {
        if !keep_active {
            suspend();
        }
        Self {
            suspended: !keep_active,
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if self.suspended {
            resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_reclamation() {
        let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert!(is_enabled());

        {
            let _guard = SuspendGuard::new(true);
            assert!(is_enabled());
        }

        {
            let _guard = SuspendGuard::new(false);
            assert!(!is_enabled());
        }
        assert!(is_enabled());

        let unwound = std::panic::catch_unwind(|| {
            let _guard = SuspendGuard::new(false);
            panic!("workload failed");
        });
        assert!(unwound.is_err());
        assert!(is_enabled());

        // An explicit pass is always allowed
        let _ = collect();
        assert!(is_enabled());
    }
}
