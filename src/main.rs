use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::LevelFilter;

use device_pilot::clock::{Clock, SystemClock};
use device_pilot::config::Config;
use device_pilot::error::RuntimeError;
use device_pilot::redact_url;
use device_pilot::services::detector::{Detector, DetectorConfig};
use device_pilot::services::event_loop::{EventLoop, LoopMessage};
use device_pilot::services::recorder::{FfmpegRecorder, Recorder};
use device_pilot::services::segment_buffer::{SegmentBuffer, SegmentBufferConfig};
use device_pilot::services::watcher::{FilesystemWatcher, NotifyWatcher};

const SUB_FRAME_WIDTH: u32 = 640;
const SUB_FRAME_HEIGHT: u32 = 360;
const SUB_FRAME_FPS: u32 = 10;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    init_logger(config.verbosity);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("unrecoverable runtime error: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn run(config: Config) -> Result<(), RuntimeError> {
    log::info!("starting device-pilot");
    log::info!("MAIN source: {}", redact_url(&config.rtsp_main));
    log::info!("SUB source: {}", redact_url(&config.rtsp_sub));

    let clock = Arc::new(SystemClock) as Arc<dyn Clock>;

    let mut buffer = SegmentBuffer::new(
        SegmentBufferConfig {
            rtsp_main: config.rtsp_main.clone(),
            buffer_dir: config.buffer_dir.clone(),
            segment_seconds: config.segment_seconds,
            retention_count: config.retention_count(),
            max_reconnect_delay: Duration::from_secs(config.max_reconnect_delay_seconds),
        },
        Arc::clone(&clock),
    )?;
    let watcher: Arc<dyn FilesystemWatcher> = Arc::new(
        NotifyWatcher::watch(&config.buffer_dir)
            .map_err(|e| device_pilot::error::BufferError::Watch(e.to_string()))?,
    );
    buffer.start(watcher)?;
    let segment_rx = buffer.subscribe();
    let buffer = Arc::new(Mutex::new(buffer));

    let mut detector = Detector::new(
        DetectorConfig {
            rtsp_sub: config.rtsp_sub.clone(),
            width: SUB_FRAME_WIDTH,
            height: SUB_FRAME_HEIGHT,
            fps: SUB_FRAME_FPS,
            motion_threshold: config.motion_threshold,
            light_jump_threshold: config.light_jump_threshold,
            min_motion_seconds: config.min_motion_seconds,
            startup_delay: Duration::from_secs(config.startup_delay_seconds),
            max_reconnect_delay: Duration::from_secs(config.max_reconnect_delay_seconds),
        },
        Arc::clone(&clock),
    );
    let motion_rx = detector.start()?;

    let recorder: Arc<dyn Recorder> = Arc::new(FfmpegRecorder::new(config.sessions_dir.clone())?);
    let mut event_loop = EventLoop::new(&config, Arc::clone(&buffer), Arc::clone(&clock), recorder);

    let loop_tx = event_loop.sender();
    {
        let tx = loop_tx.clone();
        std::thread::spawn(move || {
            while let Ok(seg) = segment_rx.recv() {
                if tx.send(LoopMessage::Segment(seg)).is_err() {
                    break;
                }
            }
        });
    }
    {
        let tx = loop_tx.clone();
        std::thread::spawn(move || {
            while let Ok(event) = motion_rx.recv() {
                if tx.send(LoopMessage::Motion(event)).is_err() {
                    break;
                }
            }
        });
    }

    event_loop.start_ticker();

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let shutdown_requested = Arc::clone(&shutdown_requested);
        let tx = loop_tx.clone();
        ctrlc::set_handler(move || {
            if shutdown_requested.swap(true, Ordering::SeqCst) {
                return;
            }
            log::info!("shutdown signal received, draining in-flight work");
            let _ = tx.send(LoopMessage::Shutdown);
        })
        .expect("failed to install signal handler");
    }

    event_loop.run();

    if let Ok(mut buffer) = buffer.lock() {
        buffer.stop();
    }
    detector.stop();

    log::info!("device-pilot shut down cleanly");
    Ok(())
}
