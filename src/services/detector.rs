// Reads raw gray8 frames from the SUB RTSP stream and emits smoothed
// motion/light transitions. The frame source itself is a black-box FFmpeg
// sub-process; this module owns the scoring algorithm and the strict
// Start/Stop alternation contract.

use std::collections::VecDeque;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use which::which;

use crate::clock::Clock;
use crate::error::DetectorError;
use crate::models::MotionEvent;
use crate::services::process::{
    hide_console, join_with_grace, new_shared_child, BackoffConfig, BackoffState, SharedChild,
};

const SMOOTHING_WINDOW: usize = 15;
const HYSTERESIS_FRAMES: u32 = 30;
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct DetectorConfig {
    pub rtsp_sub: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub motion_threshold: f64,
    pub light_jump_threshold: f64,
    pub min_motion_seconds: f64,
    pub startup_delay: Duration,
    pub max_reconnect_delay: Duration,
}

/// Scoring state, isolated from process plumbing so it can be unit tested
/// against synthetic frames without spawning ffmpeg.
struct ScoringState {
    background: Option<Vec<u8>>,
    last_mean_luma: Option<f64>,
    window: VecDeque<f64>,
    low_motion_run: u32,
    above_since: Option<Instant>,
    currently_motion: bool,
}

impl ScoringState {
    fn new() -> Self {
        Self {
            background: None,
            last_mean_luma: None,
            window: VecDeque::with_capacity(SMOOTHING_WINDOW),
            low_motion_run: 0,
            above_since: None,
            currently_motion: false,
        }
    }

    fn motion_score(&mut self, frame: &[u8]) -> f64 {
        let background = match &mut self.background {
            Some(bg) => bg,
            None => {
                self.background = Some(frame.to_vec());
                return 0.0;
            }
        };

        let mut foreground = 0usize;
        for (px, bgpx) in frame.iter().zip(background.iter_mut()) {
            let diff = (*px as i16 - *bgpx as i16).unsigned_abs();
            if diff > 25 {
                foreground += 1;
            }
            // running-average background model
            *bgpx = ((*bgpx as u16 * 31 + *px as u16) / 32) as u8;
        }
        foreground as f64 / frame.len().max(1) as f64
    }

    fn light_score(&mut self, frame: &[u8]) -> f64 {
        let mean = frame.iter().map(|&b| b as f64).sum::<f64>() / frame.len().max(1) as f64;
        let score = match self.last_mean_luma {
            Some(prev) => (mean - prev).abs(),
            None => 0.0,
        };
        self.last_mean_luma = Some(mean);
        score
    }

    fn smoothed_motion(&mut self, raw: f64) -> f64 {
        if self.window.len() == SMOOTHING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(raw);
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Feed one frame, returning a transition if the smoothed signal crossed
    /// a threshold with hysteresis applied.
    fn observe(
        &mut self,
        frame: &[u8],
        now: Instant,
        config: &DetectorConfig,
    ) -> Option<MotionEvent> {
        let raw_motion = self.motion_score(frame);
        let light = self.light_score(frame);
        let smoothed = self.smoothed_motion(raw_motion);

        let triggered = smoothed > config.motion_threshold || light > config.light_jump_threshold;

        if triggered {
            self.low_motion_run = 0;
            if !self.currently_motion {
                let since = self.above_since.get_or_insert(now);
                if now.duration_since(*since).as_secs_f64() >= config.min_motion_seconds {
                    self.currently_motion = true;
                    self.above_since = None;
                    return Some(MotionEvent::Start(now));
                }
            }
            None
        } else {
            self.above_since = None;
            if self.currently_motion {
                self.low_motion_run += 1;
                if self.low_motion_run >= HYSTERESIS_FRAMES {
                    self.currently_motion = false;
                    self.low_motion_run = 0;
                    return Some(MotionEvent::Stop(now));
                }
            }
            None
        }
    }

    fn reset(&mut self) {
        *self = ScoringState::new();
    }
}

pub struct Detector {
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    current_child: SharedChild,
    worker: Option<JoinHandle<()>>,
}

impl Detector {
    pub fn new(config: DetectorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            current_child: new_shared_child(),
            worker: None,
        }
    }

    pub fn start(&mut self) -> Result<Receiver<MotionEvent>, DetectorError> {
        let ffmpeg = which("ffmpeg")
            .map_err(|_| DetectorError::Spawn(std::io::Error::other("ffmpeg not found")))?;

        let (tx, rx) = channel();
        let shutdown = Arc::clone(&self.shutdown);
        let clock = Arc::clone(&self.clock);
        let current_child = Arc::clone(&self.current_child);
        let rtsp_sub = self.config.rtsp_sub.clone();
        let width = self.config.width;
        let height = self.config.height;
        let fps = self.config.fps;
        let frame_size = (width * height) as usize;
        let startup_delay = self.config.startup_delay;
        let min_motion_seconds = self.config.min_motion_seconds;
        let motion_threshold = self.config.motion_threshold;
        let light_jump_threshold = self.config.light_jump_threshold;
        let max_reconnect_delay = self.config.max_reconnect_delay;

        let handle = thread::spawn(move || {
            let config = DetectorConfig {
                rtsp_sub,
                width,
                height,
                fps,
                motion_threshold,
                light_jump_threshold,
                min_motion_seconds,
                startup_delay,
                max_reconnect_delay,
            };
            frame_loop(ffmpeg, frame_size, config, clock, shutdown, current_child, tx);
        });
        self.worker = Some(handle);
        Ok(rx)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            join_with_grace(handle, STOP_GRACE, &self.current_child);
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ffmpeg(
    ffmpeg: &PathBuf,
    rtsp_sub: &str,
    width: u32,
    height: u32,
    fps: u32,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(ffmpeg);
    cmd.args([
        "-rtsp_transport",
        "tcp",
        "-i",
        rtsp_sub,
        "-an",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "gray8",
        "-s:v",
        &format!("{width}x{height}"),
        "-r",
        &fps.to_string(),
        "pipe:1",
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    hide_console(&mut cmd);
    cmd.spawn()
}

fn frame_loop(
    ffmpeg: PathBuf,
    frame_size: usize,
    config: DetectorConfig,
    clock: Arc<dyn Clock>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    current_child: SharedChild,
    tx: Sender<MotionEvent>,
) {
    let backoff_config = BackoffConfig::new(config.max_reconnect_delay);
    let mut backoff = BackoffState::new();

    while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
        let mut child = match spawn_ffmpeg(&ffmpeg, &config.rtsp_sub, config.width, config.height, config.fps) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("detector: failed to spawn ffmpeg: {e}");
                backoff.record_failure(clock.now());
                thread::sleep(backoff.next_delay(&backoff_config));
                continue;
            }
        };
        let mut stdout = child.stdout.take().expect("piped stdout");
        // Published so `Detector::stop()` can force-kill this process from
        // outside the thread if a stalled read never reaches the shutdown
        // check below.
        *current_child.lock().unwrap() = Some(child);
        let mut scoring = ScoringState::new();
        let start = Instant::now();
        let mut buf = vec![0u8; frame_size];

        loop {
            if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                crate::services::process::kill_shared(&current_child);
                return;
            }

            match stdout.read_exact(&mut buf) {
                Ok(()) => {
                    backoff.reset();
                    let now = clock.now();
                    if now.duration_since(start) < config.startup_delay {
                        scoring.motion_score(&buf);
                        scoring.light_score(&buf);
                        continue;
                    }
                    if let Some(event) = scoring.observe(&buf, now, &config) {
                        if tx.send(event).is_err() {
                            crate::services::process::kill_shared(&current_child);
                            return;
                        }
                    }
                }
                Err(_) => {
                    log::warn!("detector: frame source closed, reconnecting");
                    crate::services::process::kill_shared(&current_child);
                    scoring.reset();
                    backoff.record_failure(clock.now());
                    break;
                }
            }
        }

        if !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            thread::sleep(backoff.next_delay(&backoff_config));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn config() -> DetectorConfig {
        DetectorConfig {
            rtsp_sub: String::new(),
            width: 4,
            height: 4,
            fps: 10,
            motion_threshold: 0.1,
            light_jump_threshold: 60.0,
            min_motion_seconds: 0.0,
            startup_delay: Duration::ZERO,
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn no_background_frame_reports_zero_motion() {
        let mut state = ScoringState::new();
        let frame = vec![10u8; 16];
        assert_eq!(state.motion_score(&frame), 0.0);
    }

    #[test]
    fn large_pixel_shift_registers_as_foreground() {
        let mut state = ScoringState::new();
        let dark = vec![10u8; 16];
        let bright = vec![250u8; 16];
        state.motion_score(&dark);
        let score = state.motion_score(&bright);
        assert!(score > 0.9);
    }

    #[test]
    fn start_then_stop_alternate_strictly() {
        let cfg = config();
        let mut state = ScoringState::new();
        let dark = vec![10u8; 16];
        let bright = vec![250u8; 16];
        let clock = TestClock::new();
        state.motion_score(&dark);

        let mut start_events = 0;
        for _ in 0..SMOOTHING_WINDOW {
            clock.advance(Duration::from_millis(33));
            if let Some(MotionEvent::Start(_)) = state.observe(&bright, clock.now(), &cfg) {
                start_events += 1;
            }
        }
        assert_eq!(start_events, 1);

        let mut stop_events = 0;
        for _ in 0..(HYSTERESIS_FRAMES + SMOOTHING_WINDOW as u32) {
            clock.advance(Duration::from_millis(33));
            if let Some(MotionEvent::Stop(_)) = state.observe(&dark, clock.now(), &cfg) {
                stop_events += 1;
            }
        }
        assert_eq!(stop_events, 1);
    }

    #[test]
    fn light_jump_alone_can_trigger_start() {
        let cfg = config();
        let mut state = ScoringState::new();
        let dark = vec![10u8; 16];
        let bright_uniform = vec![200u8; 16];
        state.light_score(&dark);
        let clock = TestClock::new();
        let event = state.observe(&bright_uniform, clock.now(), &cfg);
        clock.advance(Duration::from_millis(1));
        assert!(matches!(event, Some(MotionEvent::Start(_))) || state.currently_motion);
    }
}
