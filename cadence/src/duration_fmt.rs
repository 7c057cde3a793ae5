//! Parsing and formatting of human timer durations (`25m`, `1h30m`, `MM:SS`).

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

fn duration_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").ok())
        .as_ref()
}

/// Parse `90s`, `25m`, `1h30m`, `1h5m10s`, or a bare number of minutes.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("Duration is empty".to_string());
    }

    if let Ok(minutes) = trimmed.parse::<u64>() {
        return positive(Duration::from_secs(minutes * 60), input);
    }

    let caps = duration_regex()
        .and_then(|re| re.captures(&trimmed))
        .ok_or_else(|| format!("Invalid duration: '{input}'. Expected e.g. 90s, 25m, 1h30m"))?;

    let part = |index: usize| -> u64 {
        caps.get(index)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let seconds = part(1) * 3600 + part(2) * 60 + part(3);
    positive(Duration::from_secs(seconds), input)
}

fn positive(duration: Duration, input: &str) -> Result<Duration, String> {
    if duration.is_zero() {
        Err(format!("Duration must be greater than zero: '{input}'"))
    } else {
        Ok(duration)
    }
}

/// `MM:SS`, with minutes allowed to exceed 59 (`90:00`).
pub fn format_clock(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Short human form: `25m`, `1h30m`, `45s`.
pub fn format_human(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0 || out.is_empty() {
        out.push_str(&format!("{seconds}s"));
    }
    out
}
