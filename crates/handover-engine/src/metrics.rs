//! # Prometheus Metrics
//!
//! Engine counters are plain atomics bumped on the decision path. A
//! [`MetricsSnapshot`] combines them with breaker and queue state and is
//! rendered in Prometheus text exposition format by a lightweight HTTP
//! server for scraping.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::breaker::BreakerSnapshot;
use crate::decision::{DecisionMethod, FallbackReason};

/// Running sum / count / max of a latency, in microseconds.
#[derive(Debug, Default)]
pub struct LatencyStat {
    sum_us: AtomicU64,
    count: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyStat {
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            sum_us: self.sum_us.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub sum_us: u64,
    pub count: u64,
    pub max_us: u64,
}

/// Write-only counters owned by one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    decisions_ml: AtomicU64,
    decisions_rule: AtomicU64,
    decisions_none: AtomicU64,
    handovers_applied: AtomicU64,
    fallback_ml_unavailable: AtomicU64,
    fallback_qos_rejected: AtomicU64,
    fallback_low_confidence: AtomicU64,
    qos_pass: AtomicU64,
    qos_fail: AtomicU64,
    predictions_ok: AtomicU64,
    predictions_failed: AtomicU64,
    predictions_malformed: AtomicU64,
    queue_submitted: AtomicU64,
    queue_rejected: AtomicU64,
    queue_completed: AtomicU64,
    queue_failed: AtomicU64,
    queue_timed_out: AtomicU64,
    queue_cancelled: AtomicU64,
    sink_dropped: AtomicU64,
    pub prediction_latency: LatencyStat,
    pub task_latency: LatencyStat,
    pub decision_latency: LatencyStat,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, method: DecisionMethod, applied: bool) {
        match method {
            DecisionMethod::Ml => bump(&self.decisions_ml),
            DecisionMethod::Rule => bump(&self.decisions_rule),
            DecisionMethod::None => bump(&self.decisions_none),
        }
        if applied {
            bump(&self.handovers_applied);
        }
    }

    pub fn record_fallback(&self, reason: FallbackReason) {
        match reason {
            FallbackReason::MlUnavailable => bump(&self.fallback_ml_unavailable),
            FallbackReason::QosRejected => bump(&self.fallback_qos_rejected),
            FallbackReason::LowConfidence => bump(&self.fallback_low_confidence),
        }
    }

    pub fn record_qos(&self, priority_ok: bool) {
        if priority_ok {
            bump(&self.qos_pass);
        } else {
            bump(&self.qos_fail);
        }
    }

    pub fn record_prediction_ok(&self) {
        bump(&self.predictions_ok);
    }

    pub fn record_prediction_failed(&self, malformed: bool) {
        bump(&self.predictions_failed);
        if malformed {
            bump(&self.predictions_malformed);
        }
    }

    pub fn record_queue_submitted(&self) {
        bump(&self.queue_submitted);
    }

    pub fn record_queue_rejected(&self) {
        bump(&self.queue_rejected);
    }

    pub fn record_queue_completed(&self) {
        bump(&self.queue_completed);
    }

    pub fn record_queue_failed(&self) {
        bump(&self.queue_failed);
    }

    pub fn record_queue_timed_out(&self) {
        bump(&self.queue_timed_out);
    }

    pub fn record_queue_cancelled(&self) {
        bump(&self.queue_cancelled);
    }

    pub fn record_sink_dropped(&self) {
        bump(&self.sink_dropped);
    }

    pub fn counters(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            decisions_ml: load(&self.decisions_ml),
            decisions_rule: load(&self.decisions_rule),
            decisions_none: load(&self.decisions_none),
            handovers_applied: load(&self.handovers_applied),
            fallback_ml_unavailable: load(&self.fallback_ml_unavailable),
            fallback_qos_rejected: load(&self.fallback_qos_rejected),
            fallback_low_confidence: load(&self.fallback_low_confidence),
            qos_pass: load(&self.qos_pass),
            qos_fail: load(&self.qos_fail),
            predictions_ok: load(&self.predictions_ok),
            predictions_failed: load(&self.predictions_failed),
            predictions_malformed: load(&self.predictions_malformed),
            queue_submitted: load(&self.queue_submitted),
            queue_rejected: load(&self.queue_rejected),
            queue_completed: load(&self.queue_completed),
            queue_failed: load(&self.queue_failed),
            queue_timed_out: load(&self.queue_timed_out),
            queue_cancelled: load(&self.queue_cancelled),
            sink_dropped: load(&self.sink_dropped),
            prediction_latency: self.prediction_latency.snapshot(),
            task_latency: self.task_latency.snapshot(),
            decision_latency: self.decision_latency.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub decisions_ml: u64,
    pub decisions_rule: u64,
    pub decisions_none: u64,
    pub handovers_applied: u64,
    pub fallback_ml_unavailable: u64,
    pub fallback_qos_rejected: u64,
    pub fallback_low_confidence: u64,
    pub qos_pass: u64,
    pub qos_fail: u64,
    pub predictions_ok: u64,
    pub predictions_failed: u64,
    pub predictions_malformed: u64,
    pub queue_submitted: u64,
    pub queue_rejected: u64,
    pub queue_completed: u64,
    pub queue_failed: u64,
    pub queue_timed_out: u64,
    pub queue_cancelled: u64,
    pub sink_dropped: u64,
    pub prediction_latency: LatencySnapshot,
    pub task_latency: LatencySnapshot,
    pub decision_latency: LatencySnapshot,
}

impl CounterSnapshot {
    pub fn decisions_total(&self) -> u64 {
        self.decisions_ml + self.decisions_rule + self.decisions_none
    }
}

/// Everything the `/metrics` endpoint exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub counters: CounterSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub queue_pending: usize,
    pub queue_running: usize,
}

/// Anything that can produce a metrics snapshot on demand.
pub trait MetricsSource: Send + Sync {
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn labeled_counter(out: &mut String, name: &str, help: &str, label: &str, rows: &[(&str, u64)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (value_label, v) in rows {
        let _ = writeln!(out, "{name}{{{label}=\"{value_label}\"}} {v}");
    }
}

fn latency(out: &mut String, name: &str, help: &str, l: &LatencySnapshot) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} summary");
    let _ = writeln!(out, "{name}_sum {:.6}", l.sum_us as f64 / 1e6);
    let _ = writeln!(out, "{name}_count {}", l.count);
    let _ = writeln!(out, "# HELP {name}_max Largest observed value in seconds.");
    let _ = writeln!(out, "# TYPE {name}_max gauge");
    let _ = writeln!(out, "{name}_max {:.6}", l.max_us as f64 / 1e6);
}

/// Render a metrics snapshot as Prometheus text exposition format.
pub fn render_prometheus(snap: &MetricsSnapshot) -> String {
    let c = &snap.counters;
    let mut out = String::with_capacity(4096);

    // ── Decisions ───────────────────────────────────────────────

    labeled_counter(
        &mut out,
        "handover_decisions_total",
        "Handover decisions emitted, by decision method.",
        "method",
        &[
            ("ml", c.decisions_ml),
            ("rule", c.decisions_rule),
            ("none", c.decisions_none),
        ],
    );
    counter(
        &mut out,
        "handover_applied_total",
        "Decisions that moved a UE to a new cell.",
        c.handovers_applied,
    );
    counter(
        &mut out,
        "handover_skipped_total",
        "Decisions that kept the UE on its serving cell.",
        c.decisions_total().saturating_sub(c.handovers_applied),
    );
    labeled_counter(
        &mut out,
        "handover_ml_fallbacks_total",
        "Decisions that fell back to the A3 rule, by reason.",
        "reason",
        &[
            ("ml_unavailable", c.fallback_ml_unavailable),
            ("qos_rejected", c.fallback_qos_rejected),
            ("low_confidence", c.fallback_low_confidence),
        ],
    );
    labeled_counter(
        &mut out,
        "handover_qos_checks_total",
        "QoS compliance checks, by result.",
        "result",
        &[("pass", c.qos_pass), ("fail", c.qos_fail)],
    );

    // ── Prediction provider ─────────────────────────────────────

    labeled_counter(
        &mut out,
        "handover_predictions_total",
        "Prediction calls, by outcome.",
        "outcome",
        &[
            ("ok", c.predictions_ok),
            ("failed", c.predictions_failed),
            ("malformed", c.predictions_malformed),
        ],
    );
    latency(
        &mut out,
        "handover_prediction_latency_seconds",
        "Latency of prediction provider calls.",
        &c.prediction_latency,
    );
    latency(
        &mut out,
        "handover_decision_latency_seconds",
        "End-to-end latency of decide_and_apply.",
        &c.decision_latency,
    );

    // ── Circuit breakers ────────────────────────────────────────

    let _ = writeln!(
        out,
        "# HELP handover_breaker_state Circuit breaker state (0=closed, 1=open, 2=half_open)."
    );
    let _ = writeln!(out, "# TYPE handover_breaker_state gauge");
    for b in &snap.breakers {
        let v = match b.state {
            crate::breaker::CircuitState::Closed => 0,
            crate::breaker::CircuitState::Open => 1,
            crate::breaker::CircuitState::HalfOpen => 2,
        };
        let _ = writeln!(
            out,
            "handover_breaker_state{{breaker=\"{}\",state=\"{}\"}} {v}",
            b.name,
            b.state.as_str()
        );
    }

    let _ = writeln!(
        out,
        "# HELP handover_breaker_consecutive_failures Current consecutive transport failures."
    );
    let _ = writeln!(out, "# TYPE handover_breaker_consecutive_failures gauge");
    for b in &snap.breakers {
        let _ = writeln!(
            out,
            "handover_breaker_consecutive_failures{{breaker=\"{}\"}} {}",
            b.name, b.consecutive_failures
        );
    }

    let _ = writeln!(
        out,
        "# HELP handover_breaker_transitions_total Breaker state transitions, by target state."
    );
    let _ = writeln!(out, "# TYPE handover_breaker_transitions_total counter");
    for b in &snap.breakers {
        for (to, v) in [
            ("open", b.times_opened),
            ("half_open", b.times_half_opened),
            ("closed", b.times_closed),
        ] {
            let _ = writeln!(
                out,
                "handover_breaker_transitions_total{{breaker=\"{}\",to=\"{to}\"}} {v}",
                b.name
            );
        }
    }

    let _ = writeln!(
        out,
        "# HELP handover_breaker_rejected_total Calls rejected without reaching the provider."
    );
    let _ = writeln!(out, "# TYPE handover_breaker_rejected_total counter");
    for b in &snap.breakers {
        let _ = writeln!(
            out,
            "handover_breaker_rejected_total{{breaker=\"{}\"}} {}",
            b.name, b.rejected_calls
        );
    }

    // ── Operation queue ─────────────────────────────────────────

    let _ = writeln!(out, "# HELP handover_queue_pending Tasks waiting for a worker.");
    let _ = writeln!(out, "# TYPE handover_queue_pending gauge");
    let _ = writeln!(out, "handover_queue_pending {}", snap.queue_pending);
    let _ = writeln!(out, "# HELP handover_queue_running Tasks currently held by a worker.");
    let _ = writeln!(out, "# TYPE handover_queue_running gauge");
    let _ = writeln!(out, "handover_queue_running {}", snap.queue_running);

    counter(
        &mut out,
        "handover_queue_submitted_total",
        "Tasks accepted by the operation queue.",
        c.queue_submitted,
    );
    counter(
        &mut out,
        "handover_queue_rejected_total",
        "Tasks rejected because the queue was full.",
        c.queue_rejected,
    );
    labeled_counter(
        &mut out,
        "handover_queue_finished_total",
        "Tasks that reached a terminal state, by status.",
        "status",
        &[
            ("completed", c.queue_completed),
            ("failed", c.queue_failed),
            ("timed_out", c.queue_timed_out),
            ("cancelled", c.queue_cancelled),
        ],
    );
    latency(
        &mut out,
        "handover_queue_task_latency_seconds",
        "Execution time of queued operations.",
        &c.task_latency,
    );

    counter(
        &mut out,
        "handover_sink_dropped_total",
        "Decision records dropped by a full sink.",
        c.sink_dropped,
    );

    out
}

/// A lightweight HTTP server that serves `/metrics` for Prometheus scraping.
///
/// Runs in a background thread and asks its [`MetricsSource`] for a fresh
/// snapshot on every scrape.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start(
        bind_addr: SocketAddr,
        source: Arc<dyn MetricsSource>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("handover-metrics".into())
            .spawn(move || serve_loop(listener, source, running_clone))
            .map_err(std::io::Error::other)?;

        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(listener: TcpListener, source: Arc<dyn MetricsSource>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, source.as_ref()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, source: &dyn MetricsSource) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    if request.starts_with("GET /metrics") {
        let body = render_prometheus(&source.metrics_snapshot());
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes());
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let _ = stream.write_all(response.as_bytes());
    }
}
