// Finalizes a session into a single MP4 by concat-demuxing its collected
// segments with stream copy. Runs on the recorder worker pool, never on the
// core event loop thread.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use uuid::Uuid;
use which::which;

use crate::error::RecorderError;
use crate::models::Segment;
use crate::services::process::hide_console;

/// Assembles a session's segments into a finished MP4. A trait so the event
/// loop can be driven end-to-end in tests against a fake that never shells
/// out to FFmpeg.
pub trait Recorder: Send + Sync {
    fn finalize(&self, session_id: Uuid, segments: &[Segment], output: &Path) -> Result<(), RecorderError>;
}

pub struct FfmpegRecorder {
    ffmpeg: PathBuf,
    sessions_dir: PathBuf,
}

impl FfmpegRecorder {
    pub fn new(sessions_dir: PathBuf) -> Result<Self, RecorderError> {
        let ffmpeg =
            which("ffmpeg").map_err(|_| RecorderError::Io(std::io::Error::other("ffmpeg not found")))?;
        Ok(Self { ffmpeg, sessions_dir })
    }
}

impl Recorder for FfmpegRecorder {
    /// Assemble `segments` into `output`. Retries once after a short delay
    /// on failure; the scratch manifest directory is left on disk for
    /// post-mortem if the retry also fails.
    fn finalize(&self, session_id: Uuid, segments: &[Segment], output: &Path) -> Result<(), RecorderError> {
        let usable: Vec<&Segment> = dedupe_existing(segments);
        if usable.is_empty() {
            return Err(RecorderError::NoSegments(session_id.to_string()));
        }

        let scratch_dir = self.sessions_dir.join(session_id.to_string());
        std::fs::create_dir_all(&scratch_dir)?;
        let manifest_path = scratch_dir.join("concat.txt");
        write_manifest(&manifest_path, &usable)?;

        let result = match run_concat(&self.ffmpeg, &manifest_path, output) {
            Ok(()) => Ok(()),
            Err(_) => {
                thread::sleep(Duration::from_secs(1));
                run_concat(&self.ffmpeg, &manifest_path, output)
            }
        };

        result.and_then(|()| {
            // Force the finished file to disk before telling the event loop
            // this session is done -- a crash right after this point must
            // not be able to leave a COMPLETED session with a truncated MP4.
            std::fs::File::open(output)
                .and_then(|f| f.sync_all())
                .map_err(RecorderError::Io)?;
            let _ = std::fs::remove_dir_all(&scratch_dir);
            Ok(())
        })
    }
}

fn dedupe_existing(segments: &[Segment]) -> Vec<&Segment> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        if !seen.insert(&seg.path) {
            continue;
        }
        match std::fs::metadata(&seg.path) {
            Ok(meta) if meta.len() > 0 => out.push(seg),
            _ => log::warn!("recorder: skipping missing or empty segment {:?}", seg.path),
        }
    }
    out
}

fn write_manifest(path: &Path, segments: &[&Segment]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for seg in segments {
        let abs = std::fs::canonicalize(&seg.path).unwrap_or_else(|_| seg.path.clone());
        writeln!(file, "file '{}'", abs.display())?;
    }
    Ok(())
}

fn run_concat(ffmpeg: &Path, manifest: &Path, output: &Path) -> Result<(), RecorderError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-f", "concat", "-safe", "0", "-i"])
        .arg(manifest)
        .args(["-c", "copy", "-movflags", "+faststart"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    hide_console(&mut cmd);

    let output_result = cmd.output()?;
    if output_result.status.success() {
        Ok(())
    } else {
        log::warn!(
            "recorder: ffmpeg concat stderr: {}",
            String::from_utf8_lossy(&output_result.stderr)
        );
        Err(RecorderError::ConcatFailed(output_result.status))
    }
}
