use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct HashProgress {
    pub percent: u8,
    /// Human readable throughput, e.g. `1.7 GiB/s`
    pub speed: String,
    pub eta: Option<Duration>,
}

/// Receives progress updates while hashing. Called from blocking worker threads.
pub type ProgressSink = Arc<dyn Fn(&HashProgress) + Send + Sync>;

/// Sink that reports through `tracing`.
pub fn log_progress() -> ProgressSink {
    Arc::new(|progress: &HashProgress| {
        tracing::info!(
            percent = progress.percent,
            speed = %progress.speed,
            eta = ?progress.eta,
            "hashing pieces"
        );
    })
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Hashing pieces.*?\[(\d+(?:\.\d+)? (?:G|M)(?:B|iB)/s)\]\s+(\d+)%")
            .unwrap_or_else(|e| unreachable!("static regex is valid: {e}"))
    })
}

fn eta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)s:(\d+)s\]").unwrap_or_else(|e| unreachable!("static regex is valid: {e}")))
}

/// Parses one output line of the external hashing tool.
///
/// When the line carries no `[elapsed:remaining]` pair the ETA is extrapolated from `elapsed`.
pub fn parse_external_line(line: &str, elapsed: Duration) -> Option<HashProgress> {
    let captures = progress_re().captures(line)?;
    let speed = captures.get(1)?.as_str().to_owned();
    let percent: u8 = captures.get(2)?.as_str().parse().ok()?;

    let eta = eta_re()
        .captures(line)
        .and_then(|eta| eta.get(2))
        .and_then(|remaining| remaining.as_str().parse().ok())
        .map(Duration::from_secs)
        .or_else(|| estimate_eta(percent, elapsed));

    Some(HashProgress {
        percent: percent.min(100),
        speed,
        eta,
    })
}

pub fn estimate_eta(percent: u8, elapsed: Duration) -> Option<Duration> {
    if percent == 0 {
        return None;
    }
    let total = elapsed.as_secs_f64() * 100.0 / f64::from(percent.min(100));
    Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)))
}

/// Formats bytes per second the way the external tool does.
pub fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let mib = bytes as f64 / (1024.0 * 1024.0) / secs;
    if mib >= 1024.0 {
        format!("{:.1} GiB/s", mib / 1024.0)
    } else {
        format!("{mib:.1} MiB/s")
    }
}
