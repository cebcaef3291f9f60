//! Time-based rotation of consumer assignments
//!
//! Each tick collects consumers whose binding is older than the policy
//! interval and rotates them on a bounded worker fan-out. A tick never waits
//! for the previous batch; a consumer whose rotation is still in flight is
//! simply not claimed again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use super::assignment::AssignmentTable;
use super::health::{probe_and_record, HealthProbe};
use super::registry::{PolicyHandle, ProxyRegistry};
use crate::models::{LeaseOutcome, RotationReport};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due assignments are collected
    pub tick: Duration,
    /// Rotations running concurrently within one batch
    pub workers: usize,
    /// Probe the newly bound endpoint after each rotation
    pub probe_after_rotate: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            workers: 4,
            probe_after_rotate: true,
        }
    }
}

enum SchedulerState {
    Stopped,
    Running {
        shutdown_tx: watch::Sender<bool>,
        _task: JoinHandle<()>,
    },
}

enum Rotation {
    Rotated,
    Exhausted,
    Skipped,
}

struct SchedulerInner {
    assignments: Arc<AssignmentTable>,
    registry: Arc<ProxyRegistry>,
    policy: PolicyHandle,
    probe: Arc<dyn HealthProbe>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Consumers with a rotation currently in flight
    rotating: DashSet<String>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Claim on one consumer's rotation, released on drop
struct InFlight {
    inner: Arc<SchedulerInner>,
    consumer_id: String,
}

impl InFlight {
    fn claim(inner: &Arc<SchedulerInner>, consumer_id: String) -> Option<Self> {
        if !inner.rotating.insert(consumer_id.clone()) {
            debug!(consumer_id = %consumer_id, "Rotation already in flight, skipping");
            return None;
        }
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Self {
            inner: inner.clone(),
            consumer_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.rotating.remove(&self.consumer_id);
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl SchedulerInner {
    fn claim_due(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<InFlight> {
        let interval = self.policy.load().interval();
        self.assignments
            .due_for_rotation(now, interval)
            .into_iter()
            .filter_map(|consumer_id| InFlight::claim(self, consumer_id))
            .collect()
    }

    async fn run_batch(self: Arc<Self>, claims: Vec<InFlight>) -> RotationReport {
        let workers = self.config.workers.max(1);

        let results = futures::stream::iter(claims)
            .map(|claim| {
                let inner = self.clone();
                async move {
                    let rotation = inner.rotate_one(&claim.consumer_id).await;
                    drop(claim);
                    rotation
                }
            })
            .buffer_unordered(workers)
            .collect::<Vec<Rotation>>()
            .await;

        let mut report = RotationReport::default();
        for rotation in results {
            match rotation {
                Rotation::Rotated => report.rotated += 1,
                Rotation::Exhausted => report.exhausted += 1,
                Rotation::Skipped => report.skipped += 1,
            }
        }
        report
    }

    /// Rotate a claimed consumer. A consumer released since the claim keeps
    /// no binding.
    async fn rotate_one(&self, consumer_id: &str) -> Rotation {
        match self.assignments.rotate_existing(consumer_id) {
            Some(LeaseOutcome::Assigned(lease)) => {
                if self.config.probe_after_rotate {
                    let timeout = self.policy.load().probe_timeout();
                    if let Err(e) =
                        probe_and_record(&self.registry, self.probe.as_ref(), &lease.address, timeout)
                            .await
                    {
                        debug!(address = %lease.address, error = %e, "Post-rotation probe skipped");
                    }
                }
                Rotation::Rotated
            }
            Some(LeaseOutcome::Exhausted) => Rotation::Exhausted,
            None => {
                debug!(consumer_id = %consumer_id, "Consumer released before its rotation, skipping");
                Rotation::Skipped
            }
        }
    }
}

async fn run_loop(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.tick);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let claims = inner.claim_due(Utc::now());
                if claims.is_empty() {
                    continue;
                }

                debug!(count = claims.len(), "Dispatching scheduled rotations");
                let batch = inner.clone();
                tokio::spawn(async move {
                    let report = batch.run_batch(claims).await;
                    info!(
                        rotated = report.rotated,
                        exhausted = report.exhausted,
                        skipped = report.skipped,
                        "Scheduled rotation batch complete"
                    );
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Rotation scheduler shutting down");
                    break;
                }
            }
        }
    }
}

/// Background rotation driver. Cheap to clone.
#[derive(Clone)]
pub struct RotationScheduler {
    inner: Arc<SchedulerInner>,
}

impl RotationScheduler {
    pub fn new(
        assignments: Arc<AssignmentTable>,
        registry: Arc<ProxyRegistry>,
        policy: PolicyHandle,
        probe: Arc<dyn HealthProbe>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                assignments,
                registry,
                policy,
                probe,
                config,
                state: Mutex::new(SchedulerState::Stopped),
                rotating: DashSet::new(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Start the tick loop. Idempotent; must be called within a Tokio runtime.
    ///
    /// Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(*state, SchedulerState::Running { .. }) {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(self.inner.clone(), shutdown_rx));
        *state = SchedulerState::Running {
            shutdown_tx,
            _task: task,
        };

        info!(
            tick_secs = self.inner.config.tick.as_secs(),
            workers = self.inner.config.workers,
            "Rotation scheduler started"
        );
        true
    }

    /// Stop scheduling new ticks. Rotations already dispatched run to
    /// completion; await [`drain`](Self::drain) to wait for them.
    ///
    /// Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state.lock();
        match std::mem::replace(&mut *state, SchedulerState::Stopped) {
            SchedulerState::Running { shutdown_tx, .. } => {
                let _ = shutdown_tx.send(true);
                info!("Rotation scheduler stopped");
                true
            }
            SchedulerState::Stopped => false,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), SchedulerState::Running { .. })
    }

    /// Rotations currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Run one rotation pass as if the clock read `now`, waiting for it
    pub async fn rotate_due(&self, now: DateTime<Utc>) -> RotationReport {
        let claims = self.inner.claim_due(now);
        self.inner.clone().run_batch(claims).await
    }

    /// Wait until no rotation is in flight
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}
