use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend;
use crate::config::Config;
use crate::domain::{FlowSnapshot, TrafficUpdate};
use crate::gateway::{self, unix_ms};

/// Last-observed cumulative counters for one flow.
#[derive(Debug, Clone, Copy, Default)]
struct FlowCounterState {
    last_upload: i64,
    last_download: i64,
    /// Wall-clock time of the most recent observation. Drives staleness
    /// eviction only; independent of the snapshot's own timestamp.
    last_seen_ms: i64,
}

/// Converts cumulative snapshots into traffic deltas and buffers them for
/// transmission.
///
/// The flow state store and the pending queue are the only shared mutable
/// state in the agent. Both live behind their own mutex, held only for the
/// duration of the map/queue mutation and never across a network call: the
/// poll cycle produces into the queue while the report cycle drains it.
pub struct Runner {
    max_pending_updates: usize,
    stale_flow_timeout_ms: i64,
    flows: Mutex<HashMap<String, FlowCounterState>>,
    pending: Mutex<VecDeque<TrafficUpdate>>,
}

/// Recover the guard from a poisoned lock; the protected structures stay
/// consistent because every mutation completes before the guard drops.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Runner {
    pub fn new(max_pending_updates: usize, stale_flow_timeout: Duration) -> Self {
        Self {
            max_pending_updates,
            stale_flow_timeout_ms: stale_flow_timeout.as_millis() as i64,
            flows: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Ingest one poll's snapshots observed at wall-clock time `now_ms`.
    ///
    /// Per snapshot, in input order: an unseen flow starts from a zero
    /// baseline; a cumulative counter below the stored baseline means the
    /// gateway's counter was reset, so the baseline is replaced and nothing
    /// is emitted this round; otherwise the subtraction delta is emitted and
    /// the baseline advances. Stale flows are swept afterwards, and emitted
    /// updates are appended to the pending queue under its bound.
    pub fn ingest_snapshots(&self, snapshots: &[FlowSnapshot], now_ms: i64) {
        let mut emitted = Vec::new();

        {
            let mut flows = lock(&self.flows);

            for snapshot in snapshots {
                let state = flows.entry(snapshot.id.clone()).or_default();

                if snapshot.upload < state.last_upload || snapshot.download < state.last_download {
                    // Counter reset: not convertible to a valid delta. The
                    // next observation diffs against this new baseline.
                    debug!(
                        id = %snapshot.id,
                        upload = snapshot.upload,
                        download = snapshot.download,
                        "counter reset detected, baseline replaced"
                    );
                } else {
                    emitted.push(TrafficUpdate::from_snapshot(
                        snapshot,
                        snapshot.upload - state.last_upload,
                        snapshot.download - state.last_download,
                    ));
                }

                state.last_upload = snapshot.upload;
                state.last_download = snapshot.download;
                state.last_seen_ms = now_ms;
            }

            // Bound memory for flows the gateway silently stopped reporting.
            // A reappearing id after eviction starts from a zero baseline.
            let cutoff = now_ms - self.stale_flow_timeout_ms;
            flows.retain(|_, state| state.last_seen_ms >= cutoff);
        }

        if !emitted.is_empty() {
            self.append_pending(emitted);
        }
    }

    /// Atomically remove and return up to `n` updates from the front of the
    /// pending queue, preserving FIFO order. No entry is ever returned twice.
    pub fn take_batch(&self, n: usize) -> Vec<TrafficUpdate> {
        let mut pending = lock(&self.pending);
        let take = n.min(pending.len());
        pending.drain(..take).collect()
    }

    /// Current pending queue length.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Number of flows currently tracked in the state store.
    pub fn tracked_flows(&self) -> usize {
        lock(&self.flows).len()
    }

    fn append_pending(&self, updates: Vec<TrafficUpdate>) {
        let mut pending = lock(&self.pending);
        let mut dropped = 0usize;

        for update in updates {
            // Prefer fresher observations over perfect delivery history.
            while pending.len() >= self.max_pending_updates {
                pending.pop_front();
                dropped += 1;
            }
            pending.push_back(update);
        }

        if dropped > 0 {
            debug!(dropped, "pending queue full, dropped oldest updates");
        }
    }
}

/// Agent orchestrates the poll, report and heartbeat cycles around one
/// shared [`Runner`] and one cancellation token.
pub struct Agent {
    cfg: Config,
    runner: Arc<Runner>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Self {
        let runner = Arc::new(Runner::new(cfg.max_pending_updates, cfg.stale_flow_timeout));

        Self {
            cfg,
            runner,
            cancel: CancellationToken::new(),
            tasks: Vec::with_capacity(3),
        }
    }

    /// Start the three cycles. Each runs until the shared token is
    /// cancelled; a failed tick never terminates its cycle.
    pub fn start(&mut self) -> Result<()> {
        let gateway_client = gateway::Client::new(&self.cfg.gateway, self.cfg.request_timeout)
            .context("creating gateway client")?;

        let backend_client = backend::Client::new(
            &self.cfg.server_api_base,
            &self.cfg.backend_token,
            self.cfg.backend_id,
            &self.cfg.agent_id,
            self.cfg.request_timeout,
        )
        .context("creating collector client")?;

        self.spawn_poll_cycle(gateway_client);
        self.spawn_report_cycle(backend_client.clone());
        self.spawn_heartbeat_cycle(backend_client);

        info!(
            gateway = %self.cfg.gateway.kind,
            poll_interval = ?self.cfg.gateway_poll_interval,
            report_interval = ?self.cfg.report_interval,
            heartbeat_interval = ?self.cfg.heartbeat_interval,
            "agent started"
        );

        Ok(())
    }

    /// Cancel all cycles and wait for them to finish. Updates still in the
    /// pending queue are not flushed.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "cycle task join failed");
            }
        }

        info!("agent stopped");
    }

    fn spawn_poll_cycle(&mut self, gateway_client: gateway::Client) {
        let cancel = self.cancel.clone();
        let runner = Arc::clone(&self.runner);
        let poll_interval = self.cfg.gateway_poll_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        // Race the collect call against cancellation so
                        // shutdown never waits out the request timeout.
                        let snapshots = tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = gateway_client.collect() => match result {
                                Ok(snapshots) => snapshots,
                                Err(e) => {
                                    warn!(error = %e, "gateway poll failed");
                                    continue;
                                }
                            },
                        };

                        runner.ingest_snapshots(&snapshots, unix_ms());

                        debug!(
                            flows = snapshots.len(),
                            tracked = runner.tracked_flows(),
                            pending = runner.pending_len(),
                            "gateway poll complete"
                        );
                    }
                }
            }
        }));
    }

    fn spawn_report_cycle(&mut self, backend_client: backend::Client) {
        let cancel = self.cancel.clone();
        let runner = Arc::clone(&self.runner);
        let report_interval = self.cfg.report_interval;
        let batch_size = self.cfg.report_batch_size;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(report_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let batch = runner.take_batch(batch_size);
                        if batch.is_empty() {
                            continue;
                        }

                        // At-most-once delivery: a failed batch is dropped,
                        // never re-queued, so the collector cannot double
                        // count across retries.
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = backend_client.report(&batch) => {
                                if let Err(e) = result {
                                    warn!(
                                        error = %e,
                                        dropped = batch.len(),
                                        "traffic report failed, batch dropped"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    fn spawn_heartbeat_cycle(&mut self, backend_client: backend::Client) {
        let cancel = self.cancel.clone();
        let heartbeat_interval = self.cfg.heartbeat_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            result = backend_client.heartbeat() => {
                                if let Err(e) = result {
                                    warn!(error = %e, "heartbeat failed");
                                }
                            }
                        }
                    }
                }
            }
        }));
    }
}
