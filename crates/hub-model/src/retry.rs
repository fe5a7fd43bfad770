// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded retry with exponential backoff and symmetric jitter.
//!
//! The policy retries a declared list of HTTP status codes.  When the
//! server sends `Retry-After` (delta-seconds or an HTTP-date) that value
//! wins; otherwise the delay is `min(max_backoff, base · 2^attempt)`
//! jittered by `±jitter_ratio`.  Cancellation aborts any backoff sleep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Environment knobs: `LLM_RETRY_MAX`, `LLM_RETRY_BACKOFF_MS`,
/// `LLM_RETRY_MAX_BACKOFF_MS`, `LLM_RETRY_JITTER_RATIO`,
/// `LLM_RETRY_STATUS_CODES` (comma-separated).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_ratio: f64,
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter_ratio: 0.2,
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the `LLM_RETRY_*` environment, falling back to
    /// defaults field by field.
    pub fn from_env() -> Self {
        let mut p = Self::default();
        if let Some(n) = env_parse::<u32>("LLM_RETRY_MAX") {
            p.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("LLM_RETRY_BACKOFF_MS") {
            p.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("LLM_RETRY_MAX_BACKOFF_MS") {
            p.max_backoff = Duration::from_millis(ms);
        }
        if let Some(r) = env_parse::<f64>("LLM_RETRY_JITTER_RATIO") {
            p.jitter_ratio = r;
        }
        if let Ok(codes) = std::env::var("LLM_RETRY_STATUS_CODES") {
            let parsed: Vec<u16> = codes
                .split(',')
                .filter_map(|c| c.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                p.retry_statuses = parsed;
            }
        }
        p
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Delay before retry number `attempt` (0-based).  `retry_after` is the
    /// server-provided hint, already parsed; it takes precedence over the
    /// exponential schedule but is still capped at `max_backoff`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(d) = retry_after {
            return d.min(self.max_backoff);
        }
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        jitter(exp, self.jitter_ratio)
    }
}

/// Apply symmetric jitter: a uniform factor in `[1 - ratio, 1 + ratio]`.
fn jitter(d: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return d;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-ratio..=ratio);
    d.mul_f64(factor.max(0.0))
}

/// Parse a `Retry-After` header value: either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - now;
    delta.to_std().ok()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
