// Shared sub-process supervision helpers: exponential backoff bookkeeping
// and graceful-then-forceful FFmpeg teardown. Used by both the segment
// buffer (MAIN capture) and the detector (SUB frame source).

use std::io::Write;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(windows)]
use std::os::windows::process::CommandExt;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Hide the console window FFmpeg would otherwise pop up on Windows.
pub fn hide_console(cmd: &mut Command) {
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    #[cfg(not(windows))]
    let _ = cmd;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_failed_restarts: u32,
    pub max_unhealthy: Duration,
}

impl BackoffConfig {
    pub fn new(max_delay: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay,
            max_failed_restarts: 10,
            max_unhealthy: Duration::from_secs(120),
        }
    }
}

/// Tracks consecutive restart attempts for one supervised sub-process.
#[derive(Debug, Clone)]
pub struct BackoffState {
    attempt: u32,
    unhealthy_since: Option<Instant>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            unhealthy_since: None,
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.attempt += 1;
        if self.unhealthy_since.is_none() {
            self.unhealthy_since = Some(now);
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.unhealthy_since = None;
    }

    /// Delay before the next restart attempt: 1s doubling to `max_delay`.
    pub fn next_delay(&self, config: &BackoffConfig) -> Duration {
        let factor = 1u64 << self.attempt.min(10);
        let delay = config.initial_delay.saturating_mul(factor as u32);
        delay.min(config.max_delay)
    }

    /// True once enough consecutive failures (or enough elapsed unhealthy
    /// time) have accumulated to warrant wiping state and starting clean.
    pub fn needs_hard_reset(&self, config: &BackoffConfig, now: Instant) -> bool {
        if self.attempt >= config.max_failed_restarts {
            return true;
        }
        match self.unhealthy_since {
            Some(since) => now.duration_since(since) >= config.max_unhealthy,
            None => false,
        }
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask FFmpeg to quit cleanly via stdin, then force-kill after `grace`.
pub fn stop_child(child: &mut Child, grace: Duration) {
    if let Some(stdin) = child.stdin.as_mut() {
        let _ = stdin.write_all(b"q\n");
        let _ = stdin.flush();
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// A sub-process handle shared between the thread that owns its read loop
/// and whatever calls `stop()` on the supervising struct. Letting `stop()`
/// reach in and kill the child is what makes shutdown bounded even when the
/// owning thread is blocked on a read that will never return on its own.
pub type SharedChild = Arc<Mutex<Option<Child>>>;

pub fn new_shared_child() -> SharedChild {
    Arc::new(Mutex::new(None))
}

pub fn try_wait_shared(current: &SharedChild) -> Option<std::process::ExitStatus> {
    current
        .lock()
        .unwrap()
        .as_mut()
        .and_then(|c| c.try_wait().ok().flatten())
}

/// Ask the child to quit cleanly (same protocol as `stop_child`), removing
/// it from `current` either way so a stale handle can't be killed twice.
pub fn stop_shared(current: &SharedChild, grace: Duration) {
    if let Some(mut child) = current.lock().unwrap().take() {
        stop_child(&mut child, grace);
    }
}

pub fn kill_shared(current: &SharedChild) {
    if let Some(mut child) = current.lock().unwrap().take() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Join `handle` within `grace`; if it hasn't finished by the deadline, kill
/// whatever sub-process `current` is holding to unblock the stuck read, then
/// join unconditionally.
pub fn join_with_grace(handle: JoinHandle<()>, grace: Duration, current: &SharedChild) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("process: worker did not exit within grace period, killing sub-process");
            kill_shared(current);
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = handle.join();
}
