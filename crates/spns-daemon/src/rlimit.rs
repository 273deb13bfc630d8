//! Open-file limit adjustment.

/// Raise the `RLIMIT_NOFILE` soft limit to at least `min`, capped at the
/// hard limit. The engine opens one connection per storage node, so the
/// usual 1024 default is nowhere near enough.
pub fn raise_nofile_limit(min: u64) {
    // SAFETY: getrlimit/setrlimit with a valid rlimit struct.
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            tracing::warn!("getrlimit(RLIMIT_NOFILE) failed; leaving limit alone");
            return;
        }
        if limit.rlim_cur >= min {
            return;
        }
        let target = min.min(limit.rlim_max);
        let previous = limit.rlim_cur;
        limit.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            tracing::warn!("setrlimit(RLIMIT_NOFILE, {target}) failed");
        } else {
            tracing::info!("raised open file limit from {previous} to {target}");
            if target < min {
                tracing::warn!(
                    "hard limit caps open files at {target}; large networks may exhaust it"
                );
            }
        }
    }
}
