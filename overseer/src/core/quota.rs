//! Rate-limit detection and wait-target computation.
//!
//! Pure functions over `chrono::NaiveDateTime` (local wall clock). The sleeping
//! itself lives in `io::clock`.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use regex::Regex;

pub const ABSOLUTE_BUFFER: Duration = Duration::from_secs(60);
pub const RELATIVE_BUFFER: Duration = Duration::from_secs(30);
pub const FALLBACK_WAIT: Duration = Duration::from_secs(3600);

static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b429\b|too many requests|rate[ _-]?limit(ed)?|resource[ _]exhausted|quota (exceeded|exhausted)|usage limit|try again (after|in|later)|resets? (at )?\d{1,2}(:\d{2})?\s*(am|pm)?|out of capacity|at capacity",
    )
    .expect("rate limit signature regex")
});
static ABSOLUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b")
        .expect("absolute reset regex")
});
static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:after|in)\s+(?:(\d+)\s*h)?\s*(?:(\d+)\s*m(?:in)?)?\s*(?:(\d+)\s*s)?")
        .expect("relative reset regex")
});

/// How the wait was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSource {
    Absolute,
    Relative,
    Fallback,
}

/// A computed rate-limit wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWait {
    pub target: NaiveDateTime,
    pub source: WaitSource,
}

impl QuotaWait {
    /// Remaining time from `now` (zero once the target has passed).
    pub fn remaining(&self, now: NaiveDateTime) -> Duration {
        (self.target - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// True when the output looks like a rate-limit or quota response.
pub fn is_rate_limited(output: &str) -> bool {
    SIGNATURE_RE.is_match(output)
}

/// Rate-limit check for a whole agent reply.
///
/// Successful replies only count when short; long successful output may just
/// talk about rate limits.
pub fn reply_rate_limited(output: &str, succeeded: bool) -> bool {
    if !is_rate_limited(output) {
        return false;
    }
    !succeeded || output.trim().chars().count() <= SHORT_REPLY_CHARS
}

/// Longest successful reply still treated as a bare rate-limit notice.
pub const SHORT_REPLY_CHARS: usize = 400;

/// Compute when to resume after a rate-limit message.
///
/// Absolute reset times roll to the next day when they are not after `now`.
/// Unparseable messages get a conservative fixed wait.
pub fn compute_wait(message: &str, now: NaiveDateTime) -> QuotaWait {
    if let Some(target) = absolute_target(message, now) {
        return QuotaWait {
            target,
            source: WaitSource::Absolute,
        };
    }
    if let Some(delta) = relative_delta(message) {
        return QuotaWait {
            target: now + delta + to_chrono(RELATIVE_BUFFER),
            source: WaitSource::Relative,
        };
    }
    QuotaWait {
        target: now + to_chrono(FALLBACK_WAIT),
        source: WaitSource::Fallback,
    }
}

fn absolute_target(message: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    for caps in ABSOLUTE_RE.captures_iter(message) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps.get(2).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let meridiem = caps.get(3).map(|m| m.as_str().to_ascii_lowercase());
        // A bare number without minutes or am/pm is not a clock time.
        if caps.get(2).is_none() && meridiem.is_none() {
            continue;
        }
        let hour = match meridiem.as_deref() {
            Some("am") if (1..=12).contains(&hour) => hour % 12,
            Some("pm") if (1..=12).contains(&hour) => hour % 12 + 12,
            Some(_) => continue,
            None => hour,
        };
        let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
            continue;
        };
        let mut target = now.date().and_time(time);
        if target <= now {
            target += ChronoDuration::days(1);
        }
        return Some(target + to_chrono(ABSOLUTE_BUFFER));
    }
    None
}

fn relative_delta(message: &str) -> Option<ChronoDuration> {
    for caps in RELATIVE_RE.captures_iter(message) {
        let part = |idx: usize| -> i64 {
            caps.get(idx)
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .unwrap_or(0)
        };
        if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() {
            continue;
        }
        return Some(
            ChronoDuration::hours(part(1))
                + ChronoDuration::minutes(part(2))
                + ChronoDuration::seconds(part(3)),
        );
    }
    None
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::hours(1))
}
