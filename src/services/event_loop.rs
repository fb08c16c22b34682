// The core event loop: a single thread that serializes every state
// mutation (segment arrivals, motion transitions, ticks, recorder results)
// through one mailbox. Producer threads and the recorder worker pool run
// independently and only ever push messages into this mailbox.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::models::{MotionEvent, Segment};
use crate::services::recorder::Recorder;
use crate::services::segment_buffer::{fetch_pre_roll, SegmentBuffer};
use crate::services::session_manager::SessionManager;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const RECORDER_DRAIN_GRACE: Duration = Duration::from_secs(30);

pub enum LoopMessage {
    Segment(Segment),
    Motion(MotionEvent),
    Tick(Instant),
    Finalized { id: Uuid, result: Result<(), String> },
    Shutdown,
}

struct FinalizeJob {
    id: Uuid,
    segments: Vec<Segment>,
    output: PathBuf,
}

pub struct EventLoop {
    tx: Sender<LoopMessage>,
    rx: Receiver<LoopMessage>,
    manager: SessionManager,
    buffer: Arc<Mutex<SegmentBuffer>>,
    clock: Arc<dyn Clock>,
    pre_roll_segment_count: u64,
    ticker: Option<JoinHandle<()>>,
    recorder_queue: Option<Sender<FinalizeJob>>,
    recorder_workers: Vec<JoinHandle<()>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl EventLoop {
    pub fn new(
        config: &Config,
        buffer: Arc<Mutex<SegmentBuffer>>,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        let (tx, rx) = channel();
        let manager = SessionManager::new(
            Duration::from_secs(config.pre_roll_seconds),
            Duration::from_secs(config.cooldown_seconds),
            config.evidence_dir.clone(),
        );

        let (recorder_tx, recorder_rx) = channel::<FinalizeJob>();
        let recorder_rx = Arc::new(Mutex::new(recorder_rx));
        let mut recorder_workers = Vec::new();
        for _ in 0..config.recorder_workers {
            let rx = Arc::clone(&recorder_rx);
            let loop_tx = tx.clone();
            let recorder = Arc::clone(&recorder);
            recorder_workers.push(thread::spawn(move || {
                recorder_worker_loop(rx, loop_tx, recorder);
            }));
        }

        Self {
            tx,
            rx,
            manager,
            buffer,
            clock,
            pre_roll_segment_count: config.pre_roll_segment_count(),
            ticker: None,
            recorder_queue: Some(recorder_tx),
            recorder_workers,
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn sender(&self) -> Sender<LoopMessage> {
        self.tx.clone()
    }

    pub fn start_ticker(&mut self) {
        let tx = self.tx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        self.ticker = Some(thread::spawn(move || {
            while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                thread::sleep(TICK_INTERVAL);
                if tx.send(LoopMessage::Tick(Instant::now())).is_err() {
                    break;
                }
            }
        }));
    }

    /// Run until a `Shutdown` message is received. Blocks the calling
    /// thread -- this IS the dedicated event loop thread.
    pub fn run(&mut self) {
        while let Ok(msg) = self.rx.recv() {
            match msg {
                LoopMessage::Segment(seg) => self.manager.on_segment(seg),
                LoopMessage::Motion(event) => {
                    let pre_roll = match event {
                        MotionEvent::Start(_) => {
                            let buffer = self.buffer.lock().unwrap();
                            fetch_pre_roll(&buffer, self.pre_roll_segment_count)
                        }
                        MotionEvent::Stop(_) => Vec::new(),
                    };
                    self.manager.on_motion_event(event, pre_roll);
                }
                LoopMessage::Tick(now) => {
                    let finalizing = self.manager.tick(now);
                    for id in finalizing {
                        self.dispatch_to_recorder(id);
                    }
                }
                LoopMessage::Finalized { id, result } => {
                    match result {
                        Ok(()) => self.manager.complete(id),
                        Err(e) => {
                            log::error!("session {id} failed to finalize: {e}");
                            self.manager.fail(id);
                        }
                    }
                    self.manager.remove_terminal();
                }
                LoopMessage::Shutdown => break,
            }
        }
        self.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        self.drain_recorders();
    }

    fn dispatch_to_recorder(&self, id: Uuid) {
        let Some((segments, output)) = self.manager.snapshot(id) else {
            return;
        };
        let job = FinalizeJob { id, segments, output };
        let sent = self
            .recorder_queue
            .as_ref()
            .map(|tx| tx.send(job).is_ok())
            .unwrap_or(false);
        if !sent {
            log::error!("recorder queue closed, dropping session {id}");
        }
    }

    fn drain_recorders(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        // Dropping the sender closes the channel so each worker's blocking
        // `recv()` returns once its current job (if any) finishes.
        self.recorder_queue = None;
        let deadline = Instant::now() + RECORDER_DRAIN_GRACE;
        for worker in self.recorder_workers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("recorder drain grace period elapsed, leaving worker detached");
                continue;
            }
            let _ = worker.join();
        }
    }
}

fn recorder_worker_loop(
    rx: Arc<Mutex<Receiver<FinalizeJob>>>,
    loop_tx: Sender<LoopMessage>,
    recorder: Arc<dyn Recorder>,
) {
    loop {
        let job = {
            let guard = rx.lock().unwrap();
            guard.recv()
        };
        let Ok(job) = job else { break };
        let result = recorder
            .finalize(job.id, &job.segments, &job.output)
            .map_err(|e| e.to_string());
        let _ = loop_tx.send(LoopMessage::Finalized { id: job.id, result });
    }
}
