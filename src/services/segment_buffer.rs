// Runs FFmpeg against the MAIN RTSP stream, capturing a rolling HLS segment
// directory. Supervises the sub-process with exponential backoff and hard
// resets, enforces retention, and fans new segments out to subscribers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use which::which;

use crate::clock::Clock;
use crate::error::BufferError;
use crate::models::Segment;
use crate::services::process::{
    hide_console, join_with_grace, new_shared_child, stop_shared, try_wait_shared, BackoffConfig,
    BackoffState, SharedChild,
};
use crate::services::watcher::{ChangeKind, FilesystemWatcher};

const SEGMENT_PREFIX: &str = "clip_";
const SEGMENT_SUFFIX: &str = ".ts";
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct SegmentBufferConfig {
    pub rtsp_main: String,
    pub buffer_dir: PathBuf,
    pub segment_seconds: u64,
    pub retention_count: u64,
    pub max_reconnect_delay: Duration,
}

struct Internal {
    segments: VecDeque<Segment>,
    seq_counter: u64,
    subscribers: Vec<Sender<Segment>>,
}

pub struct SegmentBuffer {
    config: SegmentBufferConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<Internal>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    current_child: SharedChild,
    supervisor: Option<JoinHandle<()>>,
}

impl SegmentBuffer {
    pub fn new(config: SegmentBufferConfig, clock: Arc<dyn Clock>) -> Result<Self, BufferError> {
        if !config.buffer_dir.exists() {
            std::fs::create_dir_all(&config.buffer_dir)?;
        } else {
            for entry in std::fs::read_dir(&config.buffer_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(SEGMENT_PREFIX) && name.ends_with(SEGMENT_SUFFIX) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        Ok(Self {
            config,
            clock,
            state: Arc::new(Mutex::new(Internal {
                segments: VecDeque::new(),
                seq_counter: 0,
                subscribers: Vec::new(),
            })),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            current_child: new_shared_child(),
            supervisor: None,
        })
    }

    pub fn subscribe(&self) -> Receiver<Segment> {
        let (tx, rx) = channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    pub fn recent_segments(&self, count: usize) -> Vec<Segment> {
        let state = self.state.lock().unwrap();
        let len = state.segments.len();
        let skip = len.saturating_sub(count);
        state.segments.iter().skip(skip).cloned().collect()
    }

    /// Register a newly observed segment and fan it out to subscribers,
    /// stamping it with the buffer's clock. Used by the real discovery path
    /// (via `observe_change`) and directly by tests driving the event loop
    /// without a real filesystem watch.
    pub fn ingest(&self, path: PathBuf) -> Segment {
        ingest_into(
            &self.state,
            path,
            self.config.retention_count,
            self.clock.as_ref(),
            self.config.segment_seconds,
        )
    }

    pub fn start(&mut self, watcher: Arc<dyn FilesystemWatcher>) -> Result<(), BufferError> {
        let ffmpeg = which("ffmpeg").map_err(|_| {
            BufferError::Watch("ffmpeg binary not found on PATH".to_string())
        })?;

        let shutdown = Arc::clone(&self.shutdown);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let current_child = Arc::clone(&self.current_child);
        let buffer_dir = self.config.buffer_dir.clone();
        let rtsp_main = self.config.rtsp_main.clone();
        let segment_seconds = self.config.segment_seconds;
        let retention_count = self.config.retention_count;
        let backoff_config = BackoffConfig::new(self.config.max_reconnect_delay);

        let handle = thread::spawn(move || {
            supervisor_loop(
                ffmpeg,
                rtsp_main,
                buffer_dir,
                segment_seconds,
                retention_count,
                backoff_config,
                state,
                clock,
                shutdown,
                watcher,
                current_child,
            );
        });
        self.supervisor = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.supervisor.take() {
            join_with_grace(handle, STOP_GRACE, &self.current_child);
        }
    }
}

impl Drop for SegmentBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ffmpeg(ffmpeg: &Path, rtsp_main: &str, buffer_dir: &Path, segment_seconds: u64) -> std::io::Result<Child> {
    let segment_pattern = buffer_dir.join(format!("{SEGMENT_PREFIX}%05d{SEGMENT_SUFFIX}"));
    let playlist = buffer_dir.join("playlist.m3u8");

    let mut cmd = Command::new(ffmpeg);
    cmd.args([
        "-rtsp_transport",
        "tcp",
        "-i",
        rtsp_main,
        "-c",
        "copy",
        "-f",
        "hls",
        "-hls_time",
        &segment_seconds.to_string(),
        "-hls_list_size",
        "0",
        "-hls_segment_type",
        "mpegts",
        "-hls_flags",
        "delete_segments+append_list",
        "-hls_segment_filename",
    ])
    .arg(&segment_pattern)
    .arg(&playlist)
    .stdin(Stdio::piped())
    .stdout(Stdio::null())
    .stderr(Stdio::piped());

    hide_console(&mut cmd);
    cmd.spawn()
}

/// Mutable cursor tracking arrival health across one `watcher.recv_timeout`
/// cycle, separated out so it can be driven directly by unit tests.
struct WatchCycle {
    last_arrival: std::time::Instant,
    missed_ticks: u32,
}

enum WatchOutcome {
    Progressed,
    Idle,
    Stalled,
}

/// One discovery cycle: wait for the next filesystem change (or timeout),
/// ingest it if it's a segment close, and report whether the stream looks
/// stalled. Pure with respect to process management -- no `Child` involved
/// -- so it's fully covered by `FakeWatcher` + `TestClock` in tests.
#[allow(clippy::too_many_arguments)]
fn observe_change(
    watcher: &dyn FilesystemWatcher,
    timeout: Duration,
    clock: &dyn Clock,
    cursor: &mut WatchCycle,
    state: &Arc<Mutex<Internal>>,
    retention_count: u64,
    segment_seconds: u64,
) -> WatchOutcome {
    match watcher.recv_timeout(timeout) {
        Some(change) if change.kind == ChangeKind::ClosedWrite => {
            let name = change
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !name.starts_with(SEGMENT_PREFIX) || !name.ends_with(SEGMENT_SUFFIX) {
                return WatchOutcome::Idle;
            }
            cursor.last_arrival = clock.now();
            cursor.missed_ticks = 0;
            ingest_into(state, change.path, retention_count, clock, segment_seconds);
            WatchOutcome::Progressed
        }
        Some(_) => WatchOutcome::Idle,
        None => {
            cursor.missed_ticks += 1;
            if clock.now().duration_since(cursor.last_arrival) > timeout && cursor.missed_ticks >= 3 {
                WatchOutcome::Stalled
            } else {
                WatchOutcome::Idle
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn supervisor_loop(
    ffmpeg: PathBuf,
    rtsp_main: String,
    buffer_dir: PathBuf,
    segment_seconds: u64,
    retention_count: u64,
    backoff_config: BackoffConfig,
    state: Arc<Mutex<Internal>>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    watcher: Arc<dyn FilesystemWatcher>,
    current_child: SharedChild,
) {
    let mut backoff = BackoffState::new();

    'outer: while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
        let child = match spawn_ffmpeg(&ffmpeg, &rtsp_main, &buffer_dir, segment_seconds) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("segment buffer: failed to spawn ffmpeg: {e}");
                backoff.record_failure(clock.now());
                thread::sleep(backoff.next_delay(&backoff_config));
                continue;
            }
        };
        *current_child.lock().unwrap() = Some(child);

        let tick_timeout = Duration::from_secs(segment_seconds * 2);
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };

        loop {
            if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                stop_shared(&current_child, STOP_GRACE);
                break 'outer;
            }

            if let Some(status) = try_wait_shared(&current_child) {
                log::warn!("segment buffer: ffmpeg exited with {status}");
                backoff.record_failure(clock.now());
                break;
            }

            match observe_change(
                watcher.as_ref(),
                tick_timeout,
                clock.as_ref(),
                &mut cursor,
                &state,
                retention_count,
                segment_seconds,
            ) {
                WatchOutcome::Progressed => backoff.reset(),
                WatchOutcome::Idle => {}
                WatchOutcome::Stalled => {
                    log::warn!("segment buffer: no new segments for longer than {:?}", tick_timeout);
                    backoff.record_failure(clock.now());
                    stop_shared(&current_child, STOP_GRACE);
                    break;
                }
            }

            if backoff.needs_hard_reset(&backoff_config, clock.now()) {
                log::warn!("segment buffer: hard reset after repeated failures");
                stop_shared(&current_child, STOP_GRACE);
                let _ = std::fs::remove_dir_all(&buffer_dir);
                let _ = std::fs::create_dir_all(&buffer_dir);
                state.lock().unwrap().segments.clear();
                backoff.reset();
                break;
            }
        }

        if !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            thread::sleep(backoff.next_delay(&backoff_config));
        }
    }
}

fn ingest_into(
    state: &Arc<Mutex<Internal>>,
    path: PathBuf,
    retention_count: u64,
    clock: &dyn Clock,
    segment_seconds: u64,
) -> Segment {
    let mut state = state.lock().unwrap();
    state.seq_counter += 1;
    let seg = Segment::new(
        path,
        state.seq_counter,
        clock.now(),
        Duration::from_secs(segment_seconds),
    );

    state.subscribers.retain(|tx| tx.send(seg.clone()).is_ok());
    state.segments.push_back(seg.clone());

    while state.segments.len() as u64 > retention_count {
        if let Some(old) = state.segments.pop_front() {
            let _ = std::fs::remove_file(&old.path);
        }
    }
    seg
}

/// Compute the pre-roll segment count and fetch them from the buffer. Kept
/// as a free function so SessionManager itself never touches I/O.
pub fn fetch_pre_roll(buffer: &SegmentBuffer, pre_roll_segment_count: u64) -> Vec<Segment> {
    buffer.recent_segments(pre_roll_segment_count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SystemClock, TestClock};
    use crate::services::watcher::FakeWatcher;

    fn new_state() -> Arc<Mutex<Internal>> {
        Arc::new(Mutex::new(Internal {
            segments: VecDeque::new(),
            seq_counter: 0,
            subscribers: Vec::new(),
        }))
    }

    #[test]
    fn recent_segments_returns_youngest_in_order() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = new_state();
        for i in 1..=5u64 {
            ingest_into(&state, PathBuf::from(format!("clip_{i:05}.ts")), 3, clock.as_ref(), 5);
        }
        let buf = SegmentBuffer {
            config: SegmentBufferConfig {
                rtsp_main: String::new(),
                buffer_dir: PathBuf::from("/tmp"),
                segment_seconds: 5,
                retention_count: 3,
                max_reconnect_delay: Duration::from_secs(30),
            },
            clock,
            state,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            current_child: new_shared_child(),
            supervisor: None,
        };
        let recent = buf.recent_segments(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].seq, 4);
        assert_eq!(recent[1].seq, 5);
    }

    #[test]
    fn retention_evicts_oldest_beyond_count() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = new_state();
        for i in 1..=6u64 {
            ingest_into(&state, PathBuf::from(format!("clip_{i:05}.ts")), 3, clock.as_ref(), 5);
        }
        let guard = state.lock().unwrap();
        assert_eq!(guard.segments.len(), 3);
        assert_eq!(guard.segments.front().unwrap().seq, 4);
    }

    #[test]
    fn recent_segments_returns_all_when_fewer_than_requested() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = new_state();
        ingest_into(&state, PathBuf::from("clip_00001.ts"), 10, clock.as_ref(), 5);
        let buf = SegmentBuffer {
            config: SegmentBufferConfig {
                rtsp_main: String::new(),
                buffer_dir: PathBuf::from("/tmp"),
                segment_seconds: 5,
                retention_count: 10,
                max_reconnect_delay: Duration::from_secs(30),
            },
            clock,
            state,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            current_child: new_shared_child(),
            supervisor: None,
        };
        assert_eq!(buf.recent_segments(5).len(), 1);
    }

    #[test]
    fn ingest_stamps_segment_with_injected_clock() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(42));
        let state = new_state();
        let seg = ingest_into(&state, PathBuf::from("clip_00001.ts"), 5, &clock, 5);
        assert_eq!(seg.created_at, t0 + Duration::from_secs(42));
        assert_eq!(seg.duration, Duration::from_secs(5));
    }

    #[test]
    fn observe_change_ingests_matching_closed_write() {
        let (watcher, handle) = FakeWatcher::new();
        let clock = TestClock::new();
        let state = new_state();
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };
        handle.push(PathBuf::from("clip_00001.ts"), ChangeKind::ClosedWrite);
        let outcome = observe_change(&watcher, Duration::from_secs(1), &clock, &mut cursor, &state, 5, 5);
        assert!(matches!(outcome, WatchOutcome::Progressed));
        assert_eq!(state.lock().unwrap().segments.len(), 1);
    }

    #[test]
    fn observe_change_ignores_non_segment_filenames() {
        let (watcher, handle) = FakeWatcher::new();
        let clock = TestClock::new();
        let state = new_state();
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };
        handle.push(PathBuf::from("playlist.m3u8"), ChangeKind::ClosedWrite);
        let outcome = observe_change(&watcher, Duration::from_secs(1), &clock, &mut cursor, &state, 5, 5);
        assert!(matches!(outcome, WatchOutcome::Idle));
        assert!(state.lock().unwrap().segments.is_empty());
    }

    #[test]
    fn observe_change_ignores_created_events() {
        let (watcher, handle) = FakeWatcher::new();
        let clock = TestClock::new();
        let state = new_state();
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };
        handle.push(PathBuf::from("clip_00001.ts"), ChangeKind::Created);
        let outcome = observe_change(&watcher, Duration::from_secs(1), &clock, &mut cursor, &state, 5, 5);
        assert!(matches!(outcome, WatchOutcome::Idle));
        assert!(state.lock().unwrap().segments.is_empty());
    }

    #[test]
    fn observe_change_reports_stalled_after_three_missed_ticks_past_timeout() {
        // `recv_timeout` blocks on real wall time regardless of the fake
        // clock, so the wait itself is kept tiny; only the logical
        // staleness check (`clock.now() - last_arrival > timeout`) is driven
        // by the advanced `TestClock`.
        let watcher = FakeWatcher::new().0;
        let clock = TestClock::new();
        let state = new_state();
        let timeout = Duration::from_millis(5);
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };

        let mut last = WatchOutcome::Idle;
        for _ in 0..3 {
            clock.advance(Duration::from_millis(6));
            last = observe_change(&watcher, timeout, &clock, &mut cursor, &state, 5, 5);
        }
        assert!(matches!(last, WatchOutcome::Stalled));
    }

    #[test]
    fn observe_change_stays_idle_before_three_missed_ticks() {
        let watcher = FakeWatcher::new().0;
        let clock = TestClock::new();
        let state = new_state();
        let timeout = Duration::from_millis(5);
        let mut cursor = WatchCycle {
            last_arrival: clock.now(),
            missed_ticks: 0,
        };

        clock.advance(Duration::from_millis(6));
        let first = observe_change(&watcher, timeout, &clock, &mut cursor, &state, 5, 5);
        assert!(matches!(first, WatchOutcome::Idle));
    }
}
