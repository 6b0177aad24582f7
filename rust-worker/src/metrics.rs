//! Counters and gauges for health and metrics scraping.
//!
//! Updated from the ingestion handlers and the worker loop, exported in
//! Prometheus text format.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

const NAMESPACE: &str = "eventflow";

/// Process-wide metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    events_published: AtomicU64,
    events_completed: AtomicU64,
    events_retried: AtomicU64,
    events_dead_lettered: AtomicU64,
    emails_sent: AtomicU64,
    emails_failed: AtomicU64,
    rate_limit_denied: AtomicU64,
    transport_errors: AtomicU64,
    workers_running: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_completed: u64,
    pub events_retried: u64,
    pub events_dead_lettered: u64,
    pub emails_sent: u64,
    pub emails_failed: u64,
    pub rate_limit_denied: u64,
    pub transport_errors: u64,
    pub workers_running: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.events_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.events_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.events_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_email_sent(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_email_failed(&self) {
        self.emails_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_denied(&self) {
        self.rate_limit_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        self.workers_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_stopped(&self) {
        self.workers_running.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_completed: self.events_completed.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            rate_limit_denied: self.rate_limit_denied.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            workers_running: self.workers_running.load(Ordering::Relaxed),
        }
    }

    /// Render counters plus the given queue gauges as Prometheus text.
    ///
    /// Gauges that could not be read (queue unreachable) are omitted.
    pub fn export(&self, queue_length: Option<u64>, dlq_length: Option<u64>) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        write_metric(
            &mut out,
            "events_published_total",
            "counter",
            "Total events published to the queue",
            &[(None, s.events_published)],
        );

        let processed: BTreeMap<&str, u64> = [
            ("success", s.events_completed),
            ("retry", s.events_retried),
            ("dead_lettered", s.events_dead_lettered),
        ]
        .into_iter()
        .collect();
        write_metric(
            &mut out,
            "events_processed_total",
            "counter",
            "Total events processed by status",
            &processed
                .iter()
                .map(|(status, v)| (Some(("status", *status)), *v))
                .collect::<Vec<_>>(),
        );

        write_metric(
            &mut out,
            "emails_sent_total",
            "counter",
            "Total delivery attempts by result",
            &[
                (Some(("status", "success")), s.emails_sent),
                (Some(("status", "failed")), s.emails_failed),
            ],
        );

        write_metric(
            &mut out,
            "rate_limit_denied_total",
            "counter",
            "Send attempts denied by the daily limit",
            &[(None, s.rate_limit_denied)],
        );

        write_metric(
            &mut out,
            "transport_errors_total",
            "counter",
            "Queue or dead-letter store failures",
            &[(None, s.transport_errors)],
        );

        write_metric(
            &mut out,
            "worker_up",
            "gauge",
            "Number of running workers in this process",
            &[(None, s.workers_running)],
        );

        if let Some(len) = queue_length {
            write_metric(&mut out, "queue_length", "gauge", "Events waiting in the queue", &[(None, len)]);
        }
        if let Some(len) = dlq_length {
            write_metric(&mut out, "dlq_length", "gauge", "Entries in the dead-letter store", &[(None, len)]);
        }

        out
    }
}

type Sample<'a> = (Option<(&'a str, &'a str)>, u64);

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, samples: &[Sample<'_>]) {
    let full_name = format!("{}_{}", NAMESPACE, name);
    let _ = writeln!(out, "# HELP {} {}", full_name, help);
    let _ = writeln!(out, "# TYPE {} {}", full_name, kind);
    for (label, value) in samples {
        match label {
            Some((key, val)) => {
                let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", full_name, key, val, value);
            }
            None => {
                let _ = writeln!(out, "{} {}", full_name, value);
            }
        }
    }
}
