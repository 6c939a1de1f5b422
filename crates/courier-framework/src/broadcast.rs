//! Mass delivery of one message to a lazy sequence of recipients.
//!
//! A broadcast job runs a single feeder task. The feeder takes one of
//! `concurrency` permits, then pulls the next recipient from the
//! [`TargetProvider`] and spawns a worker holding that permit. At most
//! `concurrency` recipients are therefore in memory at any time, whatever the
//! size of the audience. Workers deliver through the shared
//! [`OutboundSender`], so broadcasts and interactive replies draw on the
//! same rate budget.
//!
//! ```text
//!  TargetProvider ──next_target──▶ feeder ──spawn──▶ worker ─▶ OutboundSender
//!                                    ▲                  │
//!                                    └──── permit ◀─────┘ (released on completion)
//! ```
//!
//! Permanent failures are recorded and skipped. A run of consecutive
//! systemic failures (rejected credentials) aborts the job, since every
//! remaining delivery would fail the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use courier_core::{ChatId, FailureClass, OutboundAction, TargetProvider};

use crate::error::DeliveryResult;
use crate::outbound::OutboundSender;

/// Broadcast settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Deliveries in flight per job.
    pub concurrency: usize,
    /// Failure samples kept in the report.
    pub failure_sample_cap: usize,
    /// Consecutive systemic failures that abort the job.
    pub systemic_abort_threshold: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            failure_sample_cap: 100,
            systemic_abort_threshold: 5,
        }
    }
}

/// Why a job stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum AbortReason {
    /// [`BroadcastHandle::cancel`] was called.
    Cancelled,
    /// Too many consecutive systemic failures; carries the last error.
    Systemic(String),
}

/// Lifecycle of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Deliveries are still being scheduled or in flight.
    Running,
    /// Every recipient was attempted.
    Completed,
    /// The job stopped before exhausting its recipients.
    Aborted(AbortReason),
}

/// Progress and outcome of a broadcast job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Successful deliveries.
    pub sent: u64,
    /// Failed deliveries, whatever the cause.
    pub failed: u64,
    /// Failures caused by throttling (included in `failed`).
    pub rate_limited: u64,
    /// Systemic failures (included in `failed`).
    pub systemic: u64,
    /// Sample of failed recipients with their error.
    pub failures: Vec<(ChatId, String)>,
    /// Failures not sampled because the cap was reached.
    pub dropped_samples: u64,
    /// Current status.
    pub status: JobStatus,
}

impl DeliveryReport {
    fn new() -> Self {
        Self {
            sent: 0,
            failed: 0,
            rate_limited: 0,
            systemic: 0,
            failures: Vec::new(),
            dropped_samples: 0,
            status: JobStatus::Running,
        }
    }

    /// Recipients attempted so far.
    pub fn attempted(&self) -> u64 {
        self.sent + self.failed
    }

    /// Whether the job has finished.
    pub fn is_finished(&self) -> bool {
        self.status != JobStatus::Running
    }
}

struct JobState {
    report: DeliveryReport,
    consecutive_systemic: u32,
    abort: Option<AbortReason>,
}

/// Handle to a running broadcast.
pub struct BroadcastHandle {
    job_id: u64,
    state: Arc<Mutex<JobState>>,
    cancel: CancellationToken,
    task: JoinHandle<DeliveryReport>,
}

impl BroadcastHandle {
    /// Id of the job, unique within the process.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Current progress.
    pub fn snapshot(&self) -> DeliveryReport {
        self.state.lock().report.clone()
    }

    /// Stops scheduling new deliveries. In-flight deliveries finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the job to finish and returns the final report.
    pub async fn wait(self) -> DeliveryReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(job_id = self.job_id, error = %e, "Broadcast feeder panicked");
                let mut state = self.state.lock();
                state.report.status = JobStatus::Aborted(AbortReason::Cancelled);
                state.report.clone()
            }
        }
    }
}

/// Launches broadcast jobs.
#[derive(Clone)]
pub struct BroadcastEngine {
    sender: OutboundSender,
    config: BroadcastConfig,
    next_job: Arc<AtomicU64>,
}

impl BroadcastEngine {
    /// Creates an engine delivering through `sender`.
    pub fn new(sender: OutboundSender, config: BroadcastConfig) -> Self {
        Self {
            sender,
            config,
            next_job: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Starts delivering `text` to every recipient of `targets`.
    ///
    /// Must be called within a tokio runtime.
    pub fn launch(
        &self,
        targets: impl TargetProvider,
        text: impl Into<String>,
    ) -> BroadcastHandle {
        let template = OutboundAction::broadcast(0, text);
        self.launch_action(targets, template)
    }

    /// Like [`launch`](Self::launch) with a full action template; its
    /// `chat_id` is replaced per recipient.
    pub fn launch_action(
        &self,
        targets: impl TargetProvider,
        template: OutboundAction,
    ) -> BroadcastHandle {
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(JobState {
            report: DeliveryReport::new(),
            consecutive_systemic: 0,
            abort: None,
        }));
        let cancel = CancellationToken::new();

        let job = Job {
            sender: self.sender.clone(),
            config: self.config,
            state: state.clone(),
            cancel: cancel.clone(),
            halt: cancel.child_token(),
        };
        let span = span!(Level::INFO, "broadcast", job_id);
        let task = tokio::spawn(job.run(targets, template).instrument(span));

        BroadcastHandle {
            job_id,
            state,
            cancel,
            task,
        }
    }
}

struct Job {
    sender: OutboundSender,
    config: BroadcastConfig,
    state: Arc<Mutex<JobState>>,
    /// Cancelled by the caller.
    cancel: CancellationToken,
    /// Cancelled by the caller or by a systemic abort.
    halt: CancellationToken,
}

impl Job {
    async fn run(self, mut targets: impl TargetProvider, template: OutboundAction) -> DeliveryReport {
        info!(concurrency = self.config.concurrency, "Broadcast started");
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut exhausted = false;

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.halt.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(done) = workers.try_join_next() {
                log_join_error(done);
            }

            let target = tokio::select! {
                biased;
                _ = self.halt.cancelled() => break,
                target = targets.next_target() => target,
            };
            let Some(chat_id) = target else {
                debug!("Recipients exhausted");
                exhausted = true;
                break;
            };

            let mut action = template.clone();
            action.chat_id = chat_id;
            let sender = self.sender.clone();
            let state = self.state.clone();
            let halt = self.halt.clone();
            let threshold = self.config.systemic_abort_threshold;
            let cap = self.config.failure_sample_cap;
            workers.spawn(async move {
                let _permit = permit;
                let result = sender.send(&action).await;
                if record(&state, chat_id, result, cap, threshold) {
                    halt.cancel();
                }
            });
        }

        while let Some(done) = workers.join_next().await {
            log_join_error(done);
        }

        let mut state = self.state.lock();
        // A cancel that arrives while the last deliveries drain skips nothing.
        let status = match state.abort.clone() {
            Some(reason) => JobStatus::Aborted(reason),
            None if !exhausted && self.cancel.is_cancelled() => {
                JobStatus::Aborted(AbortReason::Cancelled)
            }
            None => JobStatus::Completed,
        };
        state.report.status = status;
        let report = state.report.clone();
        drop(state);

        info!(
            sent = report.sent,
            failed = report.failed,
            status = ?report.status,
            "Broadcast finished"
        );
        report
    }
}

/// Updates the report with one delivery result. Returns `true` when the job
/// must abort.
fn record(
    state: &Mutex<JobState>,
    chat_id: ChatId,
    result: DeliveryResult<courier_core::PlatformResponse>,
    cap: usize,
    threshold: u32,
) -> bool {
    let mut state = state.lock();
    let err = match result {
        Ok(_) => {
            state.report.sent += 1;
            state.consecutive_systemic = 0;
            return false;
        }
        Err(err) => err,
    };

    state.report.failed += 1;
    match err.class() {
        FailureClass::RateLimited => {
            state.report.rate_limited += 1;
            state.consecutive_systemic = 0;
        }
        FailureClass::Systemic => {
            state.report.systemic += 1;
            state.consecutive_systemic += 1;
        }
        FailureClass::Transient | FailureClass::Permanent => state.consecutive_systemic = 0,
    }
    if state.report.failures.len() < cap {
        state.report.failures.push((chat_id, err.to_string()));
    } else {
        state.report.dropped_samples += 1;
    }

    if state.abort.is_none() && threshold > 0 && state.consecutive_systemic >= threshold {
        warn!(chat_id, error = %err, "Systemic failures reached threshold, aborting broadcast");
        state.abort = Some(AbortReason::Systemic(err.to_string()));
        return true;
    }
    false
}

fn log_join_error(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        error!(error = %e, "Broadcast worker panicked");
    }
}
