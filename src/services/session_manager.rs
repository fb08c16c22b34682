// Holds the live sessions, routes detector events and buffer segments to
// them, and drives cooldown-to-finalizing transitions on tick. All methods
// are called exclusively from the core event loop thread -- no locking is
// needed here, the single-threaded event loop is the synchronization.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::models::{MotionEvent, Phase, Segment, Session};
use crate::services::segment_buffer::SegmentBuffer;

pub struct SessionManager {
    sessions: Vec<Session>,
    pre_roll: Duration,
    cooldown: Duration,
    evidence_dir: PathBuf,
}

impl SessionManager {
    pub fn new(pre_roll: Duration, cooldown: Duration, evidence_dir: PathBuf) -> Self {
        Self {
            sessions: Vec::new(),
            pre_roll,
            cooldown,
            evidence_dir,
        }
    }

    fn recording_index(&self) -> Option<usize> {
        self.sessions.iter().position(|s| s.phase() == Phase::Recording)
    }

    /// Route a motion event. `pre_roll_segments` is only consulted when a
    /// `Start` opens a brand-new session.
    pub fn on_motion_event(&mut self, event: MotionEvent, pre_roll_segments: Vec<Segment>) {
        match event {
            MotionEvent::Start(t) => {
                if let Some(idx) = self.recording_index() {
                    self.sessions[idx].on_motion_start(t);
                    return;
                }
                // No RECORDING session to extend -- open a new one even if
                // an older session is still draining its COOLDOWN tail.
                // That session keeps running independently; this is how
                // overlapping events both get their full footage.
                let session = Session::open(pre_roll_segments, t, self.pre_roll);
                self.sessions.push(session);
            }
            MotionEvent::Stop(t) => {
                if let Some(idx) = self.recording_index() {
                    self.sessions[idx].on_motion_stop(t, self.cooldown);
                } else {
                    log::error!("motion stop received with no RECORDING session active");
                }
            }
        }
    }

    pub fn on_segment(&mut self, seg: Segment) {
        for session in self.sessions.iter_mut() {
            if matches!(session.phase(), Phase::Recording | Phase::Cooldown) {
                session.on_segment(seg.clone());
            }
        }
    }

    /// Advance all sessions' timers; returns sessions that just became
    /// FINALIZING, ready for hand-off to the recorder worker pool.
    pub fn tick(&mut self, now: Instant) -> Vec<Uuid> {
        let mut finalizing = Vec::new();
        for session in self.sessions.iter_mut() {
            if session.tick(now, &self.evidence_dir) {
                finalizing.push(session.id);
            }
        }
        finalizing
    }

    /// Snapshot a FINALIZING session's segments/output for hand-off to the
    /// recorder worker pool. The session stays in the live set (still
    /// FINALIZING) until `complete` or `fail` resolves it.
    pub fn snapshot(&self, id: Uuid) -> Option<(Vec<Segment>, PathBuf)> {
        let session = self.sessions.iter().find(|s| s.id == id)?;
        let output = session.output_path()?.clone();
        Some((session.segments().to_vec(), output))
    }

    pub fn complete(&mut self, id: Uuid) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
            session.mark_completed();
        }
    }

    pub fn fail(&mut self, id: Uuid) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
            session.mark_failed();
        }
    }

    pub fn remove_terminal(&mut self) {
        self.sessions.retain(|s| !s.is_terminal());
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Compute the pre-roll segment count and fetch them from the buffer. Kept
/// as a free function so SessionManager itself never touches I/O.
pub fn fetch_pre_roll(buffer: &SegmentBuffer, pre_roll_segment_count: u64) -> Vec<Segment> {
    buffer.recent_segments(pre_roll_segment_count as usize)
}
