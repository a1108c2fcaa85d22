//! Pacing and give-up rules for `bcp watch`.
//!
//! A 404 means the job row does not exist yet; a short run of them is polled
//! again before the job counts as missing.

use std::time::Duration;

use reqwest::StatusCode;

/// Longest server-supplied `Retry-After` we will sleep for.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// Poll again, after `after` when the server asked for a specific wait.
    Retry { after: Option<Duration> },
    GiveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub max_attempts: usize,
    pub base: Duration,
    pub max: Duration,
    /// Consecutive 404s accepted before the job counts as missing.
    pub not_found_grace: usize,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            base: Duration::from_secs(2),
            max: Duration::from_secs(15),
            not_found_grace: 3,
        }
    }
}

impl PollSchedule {
    /// Wait before poll `attempt + 1`: doubles from `base` up to `max`, a server hint wins.
    pub fn delay(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(RETRY_AFTER_CAP);
        }
        let factor = 1u32 << attempt.min(6);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Verdict for a non-success status response. `not_found_seen` counts the
    /// 404s in a row including this one.
    pub fn judge_status(
        &self,
        status: StatusCode,
        retry_after: Option<&str>,
        not_found_seen: usize,
    ) -> PollVerdict {
        match status {
            StatusCode::NOT_FOUND if not_found_seen <= self.not_found_grace => {
                PollVerdict::Retry { after: None }
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => PollVerdict::Retry {
                after: retry_after.and_then(parse_retry_after),
            },
            s if s.is_server_error() => PollVerdict::Retry {
                after: retry_after.and_then(parse_retry_after),
            },
            _ => PollVerdict::GiveUp,
        }
    }
}

/// Transport failures: the service restarting or a slow hop are worth another poll.
pub fn judge_transport(err: &reqwest::Error) -> PollVerdict {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        PollVerdict::Retry { after: None }
    } else {
        PollVerdict::GiveUp
    }
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_job_is_retried_only_within_grace() {
        let schedule = PollSchedule::default();
        for seen in 1..=3 {
            assert_eq!(
                schedule.judge_status(StatusCode::NOT_FOUND, None, seen),
                PollVerdict::Retry { after: None }
            );
        }
        assert_eq!(
            schedule.judge_status(StatusCode::NOT_FOUND, None, 4),
            PollVerdict::GiveUp
        );
    }

    #[test]
    fn auth_failures_stop_immediately() {
        let schedule = PollSchedule::default();
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN, StatusCode::BAD_REQUEST] {
            assert_eq!(schedule.judge_status(status, None, 0), PollVerdict::GiveUp);
        }
    }

    #[test]
    fn throttling_honours_retry_after() {
        let schedule = PollSchedule::default();
        assert_eq!(
            schedule.judge_status(StatusCode::TOO_MANY_REQUESTS, Some("7"), 0),
            PollVerdict::Retry {
                after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(
            schedule.judge_status(StatusCode::BAD_GATEWAY, Some("soon"), 0),
            PollVerdict::Retry { after: None }
        );
        assert_eq!(schedule.delay(0, Some(Duration::from_secs(600))), RETRY_AFTER_CAP);
    }

    #[test]
    fn delay_doubles_then_caps() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.delay(0, None), Duration::from_secs(2));
        assert_eq!(schedule.delay(1, None), Duration::from_secs(4));
        assert_eq!(schedule.delay(2, None), Duration::from_secs(8));
        assert_eq!(schedule.delay(3, None), Duration::from_secs(15));
        assert_eq!(schedule.delay(50, None), Duration::from_secs(15));
    }
}
