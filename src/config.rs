// Runtime configuration: environment variables first, CLI flags override.
// Assembled once in main() before any thread or sub-process starts.

use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;

const DEFAULT_SEGMENT_SECONDS: u64 = 5;
const DEFAULT_PRE_ROLL_SECONDS: u64 = 15;
const DEFAULT_COOLDOWN_SECONDS: u64 = 30;
const DEFAULT_STARTUP_DELAY_SECONDS: u64 = 10;
const DEFAULT_MIN_MOTION_SECONDS: f64 = 0.5;
const DEFAULT_MOTION_THRESHOLD: f64 = 0.02;
const DEFAULT_LIGHT_JUMP_THRESHOLD: f64 = 30.0;
const DEFAULT_MAX_RECONNECT_DELAY_SECONDS: u64 = 30;
const DEFAULT_RETENTION_HEADROOM: u64 = 2;
const DEFAULT_RECORDER_WORKERS: usize = 2;

/// Device Pilot: records self-contained MP4s for every motion/light event
/// observed on a camera's low-res stream, with pre-roll pulled from the
/// camera's high-res stream.
#[derive(Parser, Debug)]
#[command(name = "device-pilot", version, about)]
struct Cli {
    /// High-resolution RTSP source used for pre-roll and event footage
    #[arg(long)]
    rtsp_main: Option<String>,

    /// Low-resolution RTSP source used for motion/light detection
    #[arg(long)]
    rtsp_sub: Option<String>,

    /// Seconds of MAIN footage to include before a detected event
    #[arg(long)]
    pre_roll: Option<u64>,

    /// Seconds to keep recording after motion stops before finalizing
    #[arg(long)]
    cooldown: Option<u64>,

    /// Smoothed motion score threshold in [0, 1]
    #[arg(long, value_parser = clap::value_parser!(f64))]
    motion_threshold: Option<f64>,

    /// Luminance jump threshold in [0, 255]
    #[arg(long, value_parser = clap::value_parser!(f64))]
    light_threshold: Option<f64>,

    /// Directory holding the rolling MAIN-stream segment buffer
    #[arg(long)]
    buffer_dir: Option<PathBuf>,

    /// Scratch directory for in-progress concat manifests
    #[arg(long)]
    sessions_dir: Option<PathBuf>,

    /// Directory that finished MP4s are written to
    #[arg(long)]
    evidence_dir: Option<PathBuf>,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rtsp_main: String,
    pub rtsp_sub: String,
    pub segment_seconds: u64,
    pub pre_roll_seconds: u64,
    pub cooldown_seconds: u64,
    pub startup_delay_seconds: u64,
    pub min_motion_seconds: f64,
    pub motion_threshold: f64,
    pub light_jump_threshold: f64,
    pub max_reconnect_delay_seconds: u64,
    pub retention_headroom: u64,
    pub recorder_workers: usize,
    pub buffer_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub verbosity: u8,
}

impl Config {
    /// Build configuration from the process environment and CLI arguments.
    /// CLI flags win on conflict; everything else falls back to documented
    /// defaults. Fails fast: no sub-process or thread is started before this
    /// returns.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        Self::from_parts(cli, |key| std::env::var(key).ok())
    }

    fn from_parts(
        cli: Cli,
        env: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let rtsp_main = cli
            .rtsp_main
            .or_else(|| env("RTSP_URL_MAIN"))
            .ok_or(ConfigError::MissingEnv("RTSP_URL_MAIN"))?;
        let rtsp_sub = cli
            .rtsp_sub
            .or_else(|| env("RTSP_URL_SUB"))
            .ok_or(ConfigError::MissingEnv("RTSP_URL_SUB"))?;

        let pre_roll_seconds = cli.pre_roll.or_else(|| parse_env(&env, "PILOT_PRE_ROLL_SECONDS")).unwrap_or(DEFAULT_PRE_ROLL_SECONDS);
        let cooldown_seconds = cli.cooldown.or_else(|| parse_env(&env, "PILOT_COOLDOWN_SECONDS")).unwrap_or(DEFAULT_COOLDOWN_SECONDS);
        let startup_delay_seconds = parse_env(&env, "PILOT_STARTUP_DELAY_SECONDS").unwrap_or(DEFAULT_STARTUP_DELAY_SECONDS);
        let min_motion_seconds = parse_env(&env, "PILOT_MIN_MOTION_SECONDS").unwrap_or(DEFAULT_MIN_MOTION_SECONDS);
        let max_reconnect_delay_seconds = parse_env(&env, "PILOT_MAX_RECONNECT_DELAY").unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_SECONDS);

        let motion_threshold = cli.motion_threshold.or_else(|| parse_env(&env, "PILOT_MOTION_THRESHOLD")).unwrap_or(DEFAULT_MOTION_THRESHOLD);
        if !(0.0..=1.0).contains(&motion_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "motion-threshold",
                value: motion_threshold.to_string(),
                reason: "must be within [0, 1]",
            });
        }

        let light_jump_threshold = cli.light_threshold.or_else(|| parse_env(&env, "PILOT_LIGHT_JUMP_THRESHOLD")).unwrap_or(DEFAULT_LIGHT_JUMP_THRESHOLD);
        if !(0.0..=255.0).contains(&light_jump_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "light-threshold",
                value: light_jump_threshold.to_string(),
                reason: "must be within [0, 255]",
            });
        }

        let buffer_dir = cli
            .buffer_dir
            .or_else(|| env("PILOT_BUFFER_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("buffer"));
        let sessions_dir = cli
            .sessions_dir
            .or_else(|| env("PILOT_SESSIONS_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("sessions"));
        let evidence_dir = cli
            .evidence_dir
            .or_else(|| env("PILOT_EVIDENCE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("evidence"));

        for dir in [&buffer_dir, &sessions_dir, &evidence_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        Ok(Config {
            rtsp_main,
            rtsp_sub,
            segment_seconds: DEFAULT_SEGMENT_SECONDS,
            pre_roll_seconds,
            cooldown_seconds,
            startup_delay_seconds,
            min_motion_seconds,
            motion_threshold,
            light_jump_threshold,
            max_reconnect_delay_seconds,
            retention_headroom: DEFAULT_RETENTION_HEADROOM,
            recorder_workers: DEFAULT_RECORDER_WORKERS,
            buffer_dir,
            sessions_dir,
            evidence_dir,
            verbosity: cli.verbose,
        })
    }

    /// Number of most-recent segments the buffer must retain to cover the
    /// configured pre-roll plus headroom.
    pub fn retention_count(&self) -> u64 {
        self.pre_roll_seconds.div_ceil(self.segment_seconds) + self.retention_headroom
    }

    /// Number of segments that make up the configured pre-roll window.
    pub fn pre_roll_segment_count(&self) -> u64 {
        self.pre_roll_seconds.div_ceil(self.segment_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&'static str) -> Option<String>,
    key: &'static str,
) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with(rtsp_main: Option<&str>, rtsp_sub: Option<&str>) -> Cli {
        Cli {
            rtsp_main: rtsp_main.map(String::from),
            rtsp_sub: rtsp_sub.map(String::from),
            pre_roll: None,
            cooldown: None,
            motion_threshold: None,
            light_threshold: None,
            buffer_dir: Some(std::env::temp_dir().join("dp-test-buffer")),
            sessions_dir: Some(std::env::temp_dir().join("dp-test-sessions")),
            evidence_dir: Some(std::env::temp_dir().join("dp-test-evidence")),
            verbose: 0,
        }
    }

    #[test]
    fn missing_rtsp_main_is_config_error() {
        let cli = cli_with(None, Some("rtsp://sub"));
        let result = Config::from_parts(cli, |_| None);
        assert!(matches!(result, Err(ConfigError::MissingEnv("RTSP_URL_MAIN"))));
    }

    #[test]
    fn env_fills_in_missing_cli_flags() {
        let cli = cli_with(None, None);
        let cfg = Config::from_parts(cli, |key| match key {
            "RTSP_URL_MAIN" => Some("rtsp://main".into()),
            "RTSP_URL_SUB" => Some("rtsp://sub".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.rtsp_main, "rtsp://main");
        assert_eq!(cfg.rtsp_sub, "rtsp://sub");
        assert_eq!(cfg.pre_roll_seconds, DEFAULT_PRE_ROLL_SECONDS);
    }

    #[test]
    fn cli_overrides_env() {
        let mut cli = cli_with(Some("rtsp://cli-main"), Some("rtsp://cli-sub"));
        cli.pre_roll = Some(7);
        let cfg = Config::from_parts(cli, |key| match key {
            "RTSP_URL_MAIN" => Some("rtsp://env-main".into()),
            "PILOT_PRE_ROLL_SECONDS" => Some("99".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.rtsp_main, "rtsp://cli-main");
        assert_eq!(cfg.pre_roll_seconds, 7);
    }

    #[test]
    fn out_of_range_motion_threshold_rejected() {
        let mut cli = cli_with(Some("rtsp://m"), Some("rtsp://s"));
        cli.motion_threshold = Some(1.5);
        let result = Config::from_parts(cli, |_| None);
        assert!(result.is_err());
    }

    #[test]
    fn retention_count_covers_pre_roll_plus_headroom() {
        let cli = cli_with(Some("rtsp://m"), Some("rtsp://s"));
        let cfg = Config::from_parts(cli, |_| None).unwrap();
        assert_eq!(cfg.segment_seconds, 5);
        assert_eq!(cfg.pre_roll_seconds, DEFAULT_PRE_ROLL_SECONDS);
        assert_eq!(cfg.retention_count(), 3 + DEFAULT_RETENTION_HEADROOM);
    }
}
