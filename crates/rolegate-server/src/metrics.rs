use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use rolegate_core::sync::SyncReport;

#[derive(Debug, Default)]
pub struct Metrics {
    request_total: AtomicU64,
    request_success: AtomicU64,
    request_error: AtomicU64,
    policies_pushed: AtomicU64,
    policies_pruned: AtomicU64,
    grants_skipped: AtomicU64,
    sync_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.request_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.request_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.request_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, report: &SyncReport) {
        self.policies_pushed
            .fetch_add(report.created as u64, Ordering::Relaxed);
        self.policies_pruned
            .fetch_add(report.pruned as u64, Ordering::Relaxed);
        self.grants_skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_total(&self) -> u64 {
        self.request_total.load(Ordering::Relaxed)
    }

    pub fn request_success(&self) -> u64 {
        self.request_success.load(Ordering::Relaxed)
    }

    pub fn request_error(&self) -> u64 {
        self.request_error.load(Ordering::Relaxed)
    }

    pub fn policies_pushed(&self) -> u64 {
        self.policies_pushed.load(Ordering::Relaxed)
    }

    pub fn policies_pruned(&self) -> u64 {
        self.policies_pruned.load(Ordering::Relaxed)
    }

    pub fn grants_skipped(&self) -> u64 {
        self.grants_skipped.load(Ordering::Relaxed)
    }

    pub fn sync_failures(&self) -> u64 {
        self.sync_failures.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            (
                "rolegate_requests_total",
                "Total number of requests.",
                self.request_total(),
            ),
            (
                "rolegate_requests_success_total",
                "Total successful requests.",
                self.request_success(),
            ),
            (
                "rolegate_requests_error_total",
                "Total failed requests.",
                self.request_error(),
            ),
            (
                "rolegate_policies_pushed_total",
                "Policy tuples sent to the enforcement engine.",
                self.policies_pushed(),
            ),
            (
                "rolegate_policies_pruned_total",
                "Stale policy tuples removed from the enforcement engine.",
                self.policies_pruned(),
            ),
            (
                "rolegate_grants_skipped_total",
                "Grants left out of a push because a reference did not resolve.",
                self.grants_skipped(),
            ),
            (
                "rolegate_sync_failures_total",
                "Policy syncs that failed and rolled back their change.",
                self.sync_failures(),
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        }
        output
    }
}

pub async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}
