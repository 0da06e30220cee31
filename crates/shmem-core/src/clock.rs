//! Cross-process monotonic clock and process liveness probes.

/// Milliseconds on `CLOCK_MONOTONIC`.
///
/// The clock is shared by every process on the host, so heartbeat stamps
/// written by one peer are comparable by the other. Never returns 0, which
/// the segment header reserves for "no heartbeat yet".
#[must_use]
pub fn monotonic_millis() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 1;
    }
    let millis = (ts.tv_sec as u64)
        .saturating_mul(1000)
        .saturating_add(ts.tv_nsec as u64 / 1_000_000);
    millis.max(1)
}

/// Current process id
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether a process with `pid` still exists.
///
/// `EPERM` means the process exists but belongs to someone else.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
