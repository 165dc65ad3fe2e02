//! Process signalling.

/// Sends SIGTERM to `pid`. Returns false if the signal could not be sent.
#[cfg(unix)]
#[allow(unsafe_code)]
pub(crate) fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // preconditions. The pid belongs to a child we spawned and have not
    // reaped yet, so it cannot have been recycled.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

/// Graceful termination is not available; callers fall back to killing.
#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32) -> bool {
    false
}
