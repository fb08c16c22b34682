use std::path::PathBuf;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::models::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Recording,
    Cooldown,
    Finalizing,
    Completed,
    Failed,
}

/// A single event's state machine. Pure in-memory: a Session never performs
/// I/O itself, it only accumulates segment paths and phase transitions.
pub struct Session {
    pub id: Uuid,
    pub wall_start: chrono::DateTime<chrono::Utc>,
    pub detect_start: Instant,
    pre_roll_cutoff: Instant,
    segments: Vec<Segment>,
    phase: Phase,
    cooldown_deadline: Option<Instant>,
    output_path: Option<PathBuf>,
}

impl Session {
    /// Open a new session. `pre_roll_segments` seeds the segment list (the
    /// Recorder sees these as the footage preceding the trigger); segments
    /// created before `start - pre_roll` are rejected by `on_segment`.
    pub fn open(pre_roll_segments: Vec<Segment>, start: Instant, pre_roll: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            wall_start: chrono::Utc::now(),
            detect_start: start,
            pre_roll_cutoff: start.checked_sub(pre_roll).unwrap_or(start),
            segments: pre_roll_segments,
            phase: Phase::Recording,
            cooldown_deadline: None,
            output_path: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn output_path(&self) -> Option<&PathBuf> {
        self.output_path.as_ref()
    }

    /// Append a live segment, ignoring anything older than the pre-roll
    /// window. No-op once the session has left RECORDING/COOLDOWN.
    pub fn on_segment(&mut self, seg: Segment) {
        if !matches!(self.phase, Phase::Recording | Phase::Cooldown) {
            return;
        }
        if seg.created_at < self.pre_roll_cutoff {
            return;
        }
        self.segments.push(seg);
    }

    pub fn on_motion_start(&mut self, _now: Instant) {
        match self.phase {
            Phase::Cooldown => {
                self.phase = Phase::Recording;
                self.cooldown_deadline = None;
            }
            Phase::Recording => {}
            _ => {}
        }
    }

    pub fn on_motion_stop(&mut self, now: Instant, cooldown: Duration) {
        if self.phase == Phase::Recording {
            self.phase = Phase::Cooldown;
            self.cooldown_deadline = Some(now + cooldown);
        }
    }

    /// Advance COOLDOWN -> FINALIZING once the deadline has passed, assigning
    /// the session's output path under `evidence_dir`.
    pub fn tick(&mut self, now: Instant, evidence_dir: &std::path::Path) -> bool {
        if self.phase != Phase::Cooldown {
            return false;
        }
        let Some(deadline) = self.cooldown_deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }
        self.phase = Phase::Finalizing;
        let filename = format!(
            "{}_{}.mp4",
            self.wall_start.format("%Y-%m-%d_%H-%M-%S"),
            self.id
        );
        self.output_path = Some(evidence_dir.join(filename));
        true
    }

    pub fn mark_completed(&mut self) {
        self.phase = Phase::Completed;
    }

    pub fn mark_failed(&mut self) {
        self.phase = Phase::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, TestClock};
    use std::path::PathBuf;

    fn seg(seq: u64, created_at: Instant) -> Segment {
        Segment::new(PathBuf::from(format!("clip_{seq:05}.ts")), seq, created_at, Duration::from_secs(5))
    }

    #[test]
    fn recording_extends_on_repeated_motion_start() {
        let clock = TestClock::new();
        let t0 = clock.now();
        let mut s = Session::open(vec![], t0, Duration::from_secs(3));
        s.on_motion_start(t0 + Duration::from_secs(1));
        assert_eq!(s.phase(), Phase::Recording);
    }

    #[test]
    fn motion_start_during_cooldown_reopens_recording() {
        let clock = TestClock::new();
        let t0 = clock.now();
        let mut s = Session::open(vec![], t0, Duration::from_secs(3));
        s.on_motion_stop(t0 + Duration::from_secs(8), Duration::from_secs(3));
        assert_eq!(s.phase(), Phase::Cooldown);
        s.on_motion_start(t0 + Duration::from_secs(9));
        assert_eq!(s.phase(), Phase::Recording);
    }

    #[test]
    fn tick_transitions_to_finalizing_after_deadline() {
        let clock = TestClock::new();
        let t0 = clock.now();
        let mut s = Session::open(vec![], t0, Duration::from_secs(3));
        s.on_motion_stop(t0 + Duration::from_secs(8), Duration::from_secs(3));
        let dir = PathBuf::from("/tmp/evidence");
        assert!(!s.tick(t0 + Duration::from_secs(10), &dir));
        assert!(s.tick(t0 + Duration::from_secs(11), &dir));
        assert_eq!(s.phase(), Phase::Finalizing);
        assert!(s.output_path().is_some());
    }

    #[test]
    fn stale_segment_before_pre_roll_window_is_dropped() {
        let clock = TestClock::new();
        let t0 = clock.now() + Duration::from_secs(100);
        let mut s = Session::open(vec![], t0, Duration::from_secs(3));
        s.on_segment(seg(1, t0 - Duration::from_secs(10)));
        s.on_segment(seg(2, t0 - Duration::from_secs(1)));
        assert_eq!(s.segments().len(), 1);
        assert_eq!(s.segments()[0].seq, 2);
    }

    #[test]
    fn segments_ignored_once_terminal() {
        let clock = TestClock::new();
        let t0 = clock.now();
        let mut s = Session::open(vec![], t0, Duration::from_secs(3));
        s.mark_completed();
        s.on_segment(seg(1, t0));
        assert!(s.segments().is_empty());
    }
}
