#![allow(dead_code)]

use std::path::PathBuf;

pub mod line_matcher;

/// Path to the `sshfront` binary built for this test run.
pub fn sshfront_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sshfront"))
}

/// A loopback port scoped by this process's pid plus a per-call counter,
/// so that parallel test binaries run by cargo don't collide on the same
/// port, and neither do concurrent tests within one binary.
pub fn test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static NEXT: AtomicU16 = AtomicU16::new(0);
    let slot = NEXT.fetch_add(1, Ordering::Relaxed);
    20000 + (std::process::id() % 1000) as u16 * 10 + (slot % 10)
}

/// Gracefully stop a spawned `sshfront` subprocess: SIGTERM first, falling
/// back to SIGKILL if it hasn't exited after a short grace period.
pub async fn stop(mut child: tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
    if tokio::time::timeout(std::time::Duration::from_millis(500), child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Retry `connect` with backoff until it succeeds or attempts run out,
/// since the server is spawned as a subprocess with no readiness signal
/// other than "the listener is up".
pub async fn retry_connect<T, F, Fut>(mut connect: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut sleep_dur = std::time::Duration::from_millis(20);
    let mut last_err = None;
    for _ in 0..10 {
        match connect().await {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(sleep_dur).await;
        sleep_dur *= 2;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry_connect: no attempts made")))
}
