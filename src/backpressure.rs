//! Admission control gate for the execution pool: token-bucket rate limiting, a
//! concurrency semaphore, a priority queue, a three-state circuit breaker, and
//! adaptive (AIMD-like) throttling driven by a periodic monitoring timer.
//!
//! Naming and the breaker/bulkhead/rate-limiter vocabulary are grounded in
//! `other_examples`' `tower-resilience` crate; the admission contract itself
//! (grant/queue/reject with typed reasons) follows §4.4.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BackpressureConfig;
use crate::error::{ErrorKind, Result};
use crate::event_bus::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub throughput: f64,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub connection_pool_utilization: f64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStatus {
    pub enabled: bool,
    pub active: bool,
    pub level: f64,
    pub active_operations: usize,
    pub max_operations: usize,
    pub queued_operations: usize,
    pub current_rate_limit: f64,
    pub tokens_remaining: f64,
    pub circuit_state: CircuitState,
    pub circuit_failures: u32,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct Permission {
    pub granted: bool,
    pub queued: bool,
    pub queue_position: Option<usize>,
    pub estimated_delay_ms: Option<u64>,
    pub reason: String,
}

struct QueuedRequest {
    priority: i64,
    enqueued_at: Instant,
    seq: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedRequest {}
impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedRequest {
    // BinaryHeap is a max-heap: higher priority first, and for equal priority
    // the earlier-enqueued (lower seq) request must come out first, so we
    // invert the seq comparison.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    active_operations: usize,
    queue: BinaryHeap<QueuedRequest>,
    next_seq: u64,
    current_rate_limit: f64,
    tokens: f64,
    last_refill: Instant,
    circuit_state: CircuitState,
    circuit_failures: u32,
    last_state_change: Instant,
    metrics: Metrics,
    level: f64,
    active: bool,
}

/// Gate for admission to the execution pool. Generic over no connection type —
/// backpressure reasons about abstract "operations" identified by priority only.
pub struct BackpressureController<P: EventPublisher> {
    config: BackpressureConfig,
    state: Mutex<State>,
    publisher: P,
    notify: Notify,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: EventPublisher + Clone + Send + Sync + 'static> BackpressureController<P> {
    pub fn new(config: BackpressureConfig, publisher: P) -> Self {
        let now = Instant::now();
        BackpressureController {
            state: Mutex::new(State {
                active_operations: 0,
                queue: BinaryHeap::new(),
                next_seq: 0,
                current_rate_limit: config.base_rate_limit,
                tokens: config.base_rate_limit,
                last_refill: now,
                circuit_state: CircuitState::Closed,
                circuit_failures: 0,
                last_state_change: now,
                metrics: Metrics::default(),
                level: 0.0,
                active: false,
            }),
            config,
            publisher,
            notify: Notify::new(),
            monitor_handle: Mutex::new(None),
        }
    }

    fn refill(state: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let refill_amount = state.current_rate_limit * elapsed;
        state.tokens = (state.tokens + refill_amount).min(state.current_rate_limit);
        state.last_refill = now;
    }

    fn maybe_transition_circuit(&self, state: &mut State) {
        if state.circuit_state == CircuitState::Open {
            let elapsed = state.last_state_change.elapsed();
            if elapsed >= Duration::from_millis(self.config.reset_timeout_ms) {
                state.circuit_state = CircuitState::HalfOpen;
                state.last_state_change = Instant::now();
                self.publisher.emit(
                    "CircuitBreakerStateChanged",
                    serde_json::json!({"from": "open", "to": "half_open"}),
                );
            }
        }
    }

    /// Request permission to run `priority`-ranked work. Grants immediately,
    /// queues, or rejects with a typed reason.
    pub async fn request_permission(&self, priority: i64) -> Result<Permission> {
        if !self.config.enabled {
            return Ok(Permission {
                granted: true,
                queued: false,
                queue_position: None,
                estimated_delay_ms: None,
                reason: "backpressure disabled".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        self.maybe_transition_circuit(&mut state);

        if state.circuit_state == CircuitState::Open {
            return Err(ErrorKind::CircuitBreakerOpen.into());
        }

        Self::refill(&mut state);

        if state.active_operations >= self.config.max_concurrent_operations || state.tokens < 1.0 {
            let seq = state.next_seq;
            state.next_seq += 1;
            let position = state.queue.len() + 1;
            state.queue.push(QueuedRequest {
                priority,
                enqueued_at: Instant::now(),
                seq,
            });
            state.metrics.queue_depth = state.queue.len();
            return Ok(Permission {
                granted: false,
                queued: true,
                queue_position: Some(position),
                estimated_delay_ms: Some(
                    (position as f64 / state.current_rate_limit.max(1.0) * 1000.0) as u64,
                ),
                reason: "at capacity, queued".to_string(),
            });
        }

        state.tokens -= 1.0;
        state.active_operations += 1;
        Ok(Permission {
            granted: true,
            queued: false,
            queue_position: None,
            estimated_delay_ms: None,
            reason: "admitted".to_string(),
        })
    }

    /// Report the outcome of a previously admitted operation; drives the
    /// circuit breaker and admits the next queued request if capacity allows.
    pub fn report_completion(&self, success: bool, response_time_ms: Option<f64>) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.active_operations = state.active_operations.saturating_sub(1);

        if let Some(rt) = response_time_ms {
            state.metrics.average_response_time_ms = (state.metrics.average_response_time_ms + rt) / 2.0;
        }

        match state.circuit_state {
            CircuitState::Closed => {
                if success {
                    state.circuit_failures = 0;
                } else {
                    state.circuit_failures += 1;
                    if state.circuit_failures >= self.config.failure_threshold {
                        state.circuit_state = CircuitState::Open;
                        state.last_state_change = Instant::now();
                        self.publisher.emit(
                            "CircuitBreakerStateChanged",
                            serde_json::json!({"from": "closed", "to": "open"}),
                        );
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    state.circuit_state = CircuitState::Closed;
                    state.circuit_failures = 0;
                    state.last_state_change = Instant::now();
                    self.publisher.emit(
                        "CircuitBreakerStateChanged",
                        serde_json::json!({"from": "half_open", "to": "closed"}),
                    );
                } else {
                    state.circuit_state = CircuitState::Open;
                    state.last_state_change = Instant::now();
                    self.publisher.emit(
                        "CircuitBreakerStateChanged",
                        serde_json::json!({"from": "half_open", "to": "open"}),
                    );
                }
            }
            CircuitState::Open => {}
        }

        self.process_queue(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Pop the highest-priority eligible request while capacity allows.
    fn process_queue(&self, state: &mut State) {
        Self::refill(state);
        while state.active_operations < self.config.max_concurrent_operations && state.tokens >= 1.0 {
            if state.queue.pop().is_some() {
                state.tokens -= 1.0;
                state.active_operations += 1;
            } else {
                break;
            }
        }
        state.metrics.queue_depth = state.queue.len();
    }

    /// Evaluate adaptive throttling against the current metrics snapshot; call
    /// on a fixed monitoring interval. Level in `[0,1]`, reduction is sharper
    /// than restoration (AIMD-like).
    pub fn evaluate_backpressure(&self) {
        let mut state = self.state.lock().unwrap();
        let over_pool = state.metrics.connection_pool_utilization > self.config.pool_utilization_critical;
        let over_latency = state.metrics.average_response_time_ms > self.config.response_time_warning_ms;
        let over_queue = state.metrics.queue_depth > self.config.queue_depth_warning;

        let was_active = state.active;
        if over_pool || over_latency || over_queue {
            state.level = (state.level + 0.2).min(1.0);
            state.current_rate_limit = (self.config.base_rate_limit * (1.0 - state.level)).max(1.0);
            state.active = true;
        } else if state.level > 0.0 {
            state.level = (state.level - 0.05).max(0.0);
            state.current_rate_limit = self.config.base_rate_limit * (1.0 - state.level);
            state.active = state.level > 0.0;
        }

        if state.active && !was_active {
            self.publisher
                .emit("BackpressureActivated", serde_json::json!({"level": state.level}));
        } else if !state.active && was_active {
            self.publisher.emit("BackpressureDeactivated", serde_json::json!({}));
        }
    }

    /// Update the observed metrics that `evaluate_backpressure` reasons about.
    /// Typically called by an external monitor (pool stats, response times).
    pub fn record_metrics(&self, pool_utilization: f64, avg_response_ms: f64) {
        let mut state = self.state.lock().unwrap();
        state.metrics.connection_pool_utilization = pool_utilization;
        state.metrics.average_response_time_ms = avg_response_ms;
    }

    pub fn status(&self) -> BackpressureStatus {
        let state = self.state.lock().unwrap();
        BackpressureStatus {
            enabled: self.config.enabled,
            active: state.active,
            level: state.level,
            active_operations: state.active_operations,
            max_operations: self.config.max_concurrent_operations,
            queued_operations: state.queue.len(),
            current_rate_limit: state.current_rate_limit,
            tokens_remaining: state.tokens,
            circuit_state: state.circuit_state,
            circuit_failures: state.circuit_failures,
            metrics: state.metrics.clone(),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_operations = 0;
        state.queue.clear();
        state.tokens = self.config.base_rate_limit;
        state.current_rate_limit = self.config.base_rate_limit;
        state.circuit_state = CircuitState::Closed;
        state.circuit_failures = 0;
        state.level = 0.0;
        state.active = false;
        state.metrics = Metrics::default();
    }

    /// Start the periodic adaptive-throttling evaluation loop. Idempotent: a
    /// second call while a monitor is already running is a no-op.
    pub fn start_monitoring(self: &std::sync::Arc<Self>) {
        let mut handle = self.monitor_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let this = std::sync::Arc::clone(self);
        let interval_ms = self.config.monitoring_interval_ms;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                this.evaluate_backpressure();
                debug!("backpressure monitoring tick");
            }
        }));
    }

    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Stop the monitor, clear the queue, and emit a final summary.
    pub fn shutdown(&self) {
        self.stop_monitoring();
        let mut state = self.state.lock().unwrap();
        let cleared = state.queue.len();
        state.queue.clear();
        info!(cleared, "backpressure controller shut down");
        self.publisher
            .emit("BackpressureShutdown", serde_json::json!({"cleared_queue": cleared}));
    }
}
