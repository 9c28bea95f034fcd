//! Process-wide counters and histograms with Prometheus text exposition.
//!
//! Append-only: components increment, `/metrics` renders. Nothing here feeds
//! back into control flow, so plain atomics (and one small mutex for the
//! histogram) are enough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::RunStatus;

/// Upper bounds (seconds) of the approval latency histogram buckets.
const LATENCY_BUCKETS: [f64; 9] = [0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

#[derive(Debug, Default)]
struct Histogram {
    bucket_counts: [u64; 9],
    sum: f64,
    count: u64,
}

/// Gateway metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_canceled: AtomicU64,
    runs_timed_out: AtomicU64,
    tool_calls_ok: AtomicU64,
    tool_calls_err: AtomicU64,
    events_published: AtomicU64,
    rate_limit_denials: AtomicU64,
    approval_latency: Mutex<Histogram>,
}

impl Metrics {
    /// Fresh registry with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a run reaching a terminal status. Non-terminal statuses are
    /// ignored.
    pub fn record_run_terminal(&self, status: RunStatus) {
        let counter = match status {
            RunStatus::Completed => &self.runs_completed,
            RunStatus::Failed => &self.runs_failed,
            RunStatus::Canceled => &self.runs_canceled,
            RunStatus::TimedOut => &self.runs_timed_out,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a tool invocation by result.
    pub fn record_tool_call(&self, ok: bool) {
        if ok {
            self.tool_calls_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tool_calls_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a published bus event.
    pub fn record_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rate-limit denial.
    pub fn record_rate_limit_denial(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Observe the latency of one resolved approval, in seconds.
    pub fn observe_approval_latency(&self, seconds: f64) {
        let mut hist = match self.approval_latency.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                hist.bucket_counts[i] = hist.bucket_counts[i].saturating_add(1);
            }
        }
        hist.sum += seconds;
        hist.count = hist.count.saturating_add(1);
    }

    /// Render the Prometheus text exposition.
    ///
    /// `bus_lag` and `active_subscribers` are sampled by the caller because
    /// the event bus owns them.
    pub fn render(&self, bus_lag: u64, active_subscribers: u64) -> String {
        let mut out = String::with_capacity(1_024);

        out.push_str("# TYPE agentgate_runs_total counter\n");
        for (status, counter) in [
            ("completed", &self.runs_completed),
            ("failed", &self.runs_failed),
            ("canceled", &self.runs_canceled),
            ("timed_out", &self.runs_timed_out),
        ] {
            out.push_str(&format!(
                "agentgate_runs_total{{status=\"{status}\"}} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE agentgate_tool_calls_total counter\n");
        out.push_str(&format!(
            "agentgate_tool_calls_total{{result=\"ok\"}} {}\n",
            self.tool_calls_ok.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "agentgate_tool_calls_total{{result=\"error\"}} {}\n",
            self.tool_calls_err.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE agentgate_events_published_total counter\n");
        out.push_str(&format!(
            "agentgate_events_published_total {}\n",
            self.events_published.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE agentgate_bus_lag_total counter\n");
        out.push_str(&format!("agentgate_bus_lag_total {bus_lag}\n"));

        out.push_str("# TYPE agentgate_active_subscribers gauge\n");
        out.push_str(&format!("agentgate_active_subscribers {active_subscribers}\n"));

        out.push_str("# TYPE agentgate_rate_limit_denials_total counter\n");
        out.push_str(&format!(
            "agentgate_rate_limit_denials_total {}\n",
            self.rate_limit_denials.load(Ordering::Relaxed)
        ));

        let hist = match self.approval_latency.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        out.push_str("# TYPE agentgate_approval_latency_seconds histogram\n");
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            out.push_str(&format!(
                "agentgate_approval_latency_seconds_bucket{{le=\"{bound}\"}} {}\n",
                hist.bucket_counts[i]
            ));
        }
        out.push_str(&format!(
            "agentgate_approval_latency_seconds_bucket{{le=\"+Inf\"}} {}\n",
            hist.count
        ));
        out.push_str(&format!(
            "agentgate_approval_latency_seconds_sum {}\n",
            hist.sum
        ));
        out.push_str(&format!(
            "agentgate_approval_latency_seconds_count {}\n",
            hist.count
        ));

        out
    }
}
