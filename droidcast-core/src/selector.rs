//! Latency-based ranking of ADB capture methods.
//!
//! Keeps the last few capture durations per method and, once per
//! evaluation interval, recommends the method with the lowest mean. scrcpy
//! timings are tracked for reporting but never compete: when scrcpy is
//! usable it is always tried first anyway.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::types::CaptureMethod;

/// Samples kept per method.
pub const HISTORY_LEN: usize = 5;

// ── MethodStats ──────────────────────────────────────────────────

/// Recent durations for one method.
#[derive(Debug, Clone)]
pub struct MethodStats {
    pub method: CaptureMethod,
    recent: VecDeque<Duration>,
    last_evaluated_at: Option<Instant>,
}

impl MethodStats {
    fn new(method: CaptureMethod) -> Self {
        Self {
            method,
            recent: VecDeque::with_capacity(HISTORY_LEN),
            last_evaluated_at: None,
        }
    }

    fn push(&mut self, d: Duration) {
        if self.recent.len() == HISTORY_LEN {
            self.recent.pop_front();
        }
        self.recent.push_back(d);
    }

    pub fn samples(&self) -> usize {
        self.recent.len()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.recent.is_empty() {
            return None;
        }
        let total: Duration = self.recent.iter().sum();
        Some(total / self.recent.len() as u32)
    }

    pub fn last_evaluated_at(&self) -> Option<Instant> {
        self.last_evaluated_at
    }
}

// ── MethodSelector ───────────────────────────────────────────────

/// Mean latency of one method, as reported by [`MethodSelector::ranking`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MethodTiming {
    pub method: CaptureMethod,
    pub mean_ms: f64,
    pub samples: usize,
}

pub struct MethodSelector {
    stats: BTreeMap<CaptureMethod, MethodStats>,
    interval: Duration,
    failure_penalty: Duration,
    last_evaluation: Option<Instant>,
    recommended: Option<CaptureMethod>,
}

impl MethodSelector {
    /// `failure_penalty` is the sample recorded for a failed attempt.
    pub fn new(interval: Duration, failure_penalty: Duration) -> Self {
        Self {
            stats: BTreeMap::new(),
            interval,
            failure_penalty,
            last_evaluation: None,
            recommended: None,
        }
    }

    pub fn record(&mut self, method: CaptureMethod, duration: Duration) {
        self.stats
            .entry(method)
            .or_insert_with(|| MethodStats::new(method))
            .push(duration);
    }

    pub fn record_failure(&mut self, method: CaptureMethod) {
        let penalty = self.failure_penalty;
        self.record(method, penalty);
    }

    /// Re-rank now. Returns the new recommendation.
    pub fn evaluate(&mut self, now: Instant) -> Option<CaptureMethod> {
        self.last_evaluation = Some(now);
        let mut best: Option<(CaptureMethod, Duration)> = None;
        for stats in self.stats.values_mut() {
            stats.last_evaluated_at = Some(now);
            if !stats.method.is_ranked() {
                continue;
            }
            let Some(mean) = stats.mean() else { continue };
            if best.is_none_or(|(_, b)| mean < b) {
                best = Some((stats.method, mean));
            }
        }
        self.recommended = best.map(|(m, _)| m);
        self.recommended
    }

    /// Current recommendation, re-evaluating first if the interval has
    /// elapsed (or if samples exist but nothing was ever evaluated).
    pub fn recommended(&mut self, now: Instant) -> Option<CaptureMethod> {
        let due = match self.last_evaluation {
            None => self.stats.values().any(|s| s.method.is_ranked() && s.samples() > 0),
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        };
        if due {
            self.evaluate(now);
        }
        self.recommended
    }

    pub fn stats(&self, method: CaptureMethod) -> Option<&MethodStats> {
        self.stats.get(&method)
    }

    /// Every method with samples, fastest first.
    pub fn ranking(&self) -> Vec<MethodTiming> {
        let mut out: Vec<MethodTiming> = self
            .stats
            .values()
            .filter_map(|s| {
                s.mean().map(|m| MethodTiming {
                    method: s.method,
                    mean_ms: m.as_secs_f64() * 1000.0,
                    samples: s.samples(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.mean_ms.total_cmp(&b.mean_ms));
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────
