//! Worker Pool
//!
//! Supervised background processing for the queue engine. One dispatcher
//! task owns a [`JoinSet`] and starts work on three triggers:
//!
//! - the poll ticker runs `process_next_batch`
//! - the recovery ticker releases stuck claims and finalizes exhausted items
//! - explicit handoffs arrive over a bounded channel
//!
//! A semaphore caps the work in flight at `worker_count`. The dispatcher
//! takes the permit before spawning: a tick that finds every worker busy is
//! skipped, and handoffs wait in the channel until a worker frees up. Task
//! errors and panics are logged and counted; [`WorkerPool::shutdown`] stops
//! intake and waits for in-flight work to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::engine::{StepOutcome, TransactionQueueEngine};
use super::error::QueueError;
use crate::config::WorkerConfig;
use crate::core_types::TransactionId;

/// Work accepted over the handoff channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    /// Step this transaction's unresolved item now
    Process(TransactionId),
    /// Run a batch outside the poll schedule
    RunBatch,
}

#[derive(Debug, Default)]
struct PoolCounters {
    batches_run: AtomicU64,
    items_settled: AtomicU64,
    handoffs: AtomicU64,
    recovered: AtomicU64,
    task_failures: AtomicU64,
    ticks_skipped: AtomicU64,
}

/// Point-in-time copy of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub batches_run: u64,
    /// Stage advances across batches and handoffs
    pub items_settled: u64,
    pub handoffs: u64,
    pub recovered: u64,
    pub task_failures: u64,
    /// Ticks dropped because every worker was busy
    pub ticks_skipped: u64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            batches_run: self.batches_run.load(Ordering::Relaxed),
            items_settled: self.items_settled.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable sender for explicit handoffs
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolCommand>,
}

impl PoolHandle {
    pub async fn submit(&self, transaction_id: TransactionId) -> Result<(), QueueError> {
        self.send(PoolCommand::Process(transaction_id)).await
    }

    pub async fn send(&self, command: PoolCommand) -> Result<(), QueueError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| QueueError::Storage("worker pool is shut down".to_string()))
    }
}

pub struct WorkerPool {
    handle: PoolHandle,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Start the dispatcher on the current runtime
    pub fn spawn(engine: Arc<TransactionQueueEngine>, config: WorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(PoolCounters::default());

        info!(
            worker_count = config.worker_count,
            poll_interval_ms = config.poll_interval_ms,
            recovery_interval_ms = config.recovery_interval_ms,
            node = engine.node_id(),
            "Starting worker pool"
        );

        let dispatcher = tokio::spawn(dispatch(
            engine,
            config,
            rx,
            shutdown_rx,
            counters.clone(),
        ));

        Self {
            handle: PoolHandle { tx },
            shutdown_tx,
            dispatcher,
            counters,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub async fn submit(&self, transaction_id: TransactionId) -> Result<(), QueueError> {
        self.handle.submit(transaction_id).await
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Stop intake, wait for in-flight work, return final counters
    pub async fn shutdown(self) -> PoolStats {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Worker pool dispatcher panicked");
        }
        let stats = self.counters.snapshot();
        info!(
            batches_run = stats.batches_run,
            items_settled = stats.items_settled,
            task_failures = stats.task_failures,
            ticks_skipped = stats.ticks_skipped,
            "Worker pool stopped"
        );
        stats
    }
}

async fn dispatch(
    engine: Arc<TransactionQueueEngine>,
    config: WorkerConfig,
    mut rx: mpsc::Receiver<PoolCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<PoolCounters>,
) {
    let permits = Arc::new(Semaphore::new(config.worker_count.max(1)));
    let mut tasks: JoinSet<Result<(), QueueError>> = JoinSet::new();

    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = tokio::time::interval(config.recovery_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            Some(command) = rx.recv(), if permits.available_permits() > 0 => {
                try_start(&mut tasks, &permits, &engine, &counters, command.into());
            }
            _ = poll.tick() => {
                try_start(&mut tasks, &permits, &engine, &counters, Work::Batch);
            }
            _ = sweep.tick() => {
                try_start(&mut tasks, &permits, &engine, &counters, Work::Sweep);
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                supervise(joined, &counters);
            }
        }
    }

    // Handoffs already accepted still run
    rx.close();
    while let Some(command) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        start(&mut tasks, permit, &engine, &counters, command.into());
    }
    debug!(in_flight = tasks.len(), "Draining worker pool");
    while let Some(joined) = tasks.join_next().await {
        supervise(joined, &counters);
    }
}

#[derive(Debug, Clone, Copy)]
enum Work {
    Batch,
    Handoff(TransactionId),
    Sweep,
}

impl From<PoolCommand> for Work {
    fn from(command: PoolCommand) -> Self {
        match command {
            PoolCommand::Process(id) => Work::Handoff(id),
            PoolCommand::RunBatch => Work::Batch,
        }
    }
}

/// Spawn `work` if a worker is free; returns false when the work is dropped
fn try_start(
    tasks: &mut JoinSet<Result<(), QueueError>>,
    permits: &Arc<Semaphore>,
    engine: &Arc<TransactionQueueEngine>,
    counters: &Arc<PoolCounters>,
    work: Work,
) -> bool {
    match permits.clone().try_acquire_owned() {
        Ok(permit) => {
            start(tasks, permit, engine, counters, work);
            true
        }
        Err(_) => {
            counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(?work, "All workers busy, skipping");
            false
        }
    }
}

fn start(
    tasks: &mut JoinSet<Result<(), QueueError>>,
    permit: OwnedSemaphorePermit,
    engine: &Arc<TransactionQueueEngine>,
    counters: &Arc<PoolCounters>,
    work: Work,
) {
    let engine = engine.clone();
    let counters = counters.clone();
    tasks.spawn(async move {
        let _permit = permit;
        run(&engine, &counters, work).await
    });
}

async fn run(
    engine: &TransactionQueueEngine,
    counters: &PoolCounters,
    work: Work,
) -> Result<(), QueueError> {
    match work {
        Work::Batch => {
            let report = engine.process_next_batch(engine.batch_size()).await?;
            counters.batches_run.fetch_add(1, Ordering::Relaxed);
            counters
                .items_settled
                .fetch_add(report.processed() as u64, Ordering::Relaxed);
        }
        Work::Handoff(id) => {
            counters.handoffs.fetch_add(1, Ordering::Relaxed);
            match engine.process_item(id).await {
                Ok(StepOutcome::Advanced { status }) => {
                    counters.items_settled.fetch_add(1, Ordering::Relaxed);
                    debug!(transaction_id = %id, stage = %status, "Handoff advanced");
                }
                Ok(outcome) => debug!(transaction_id = %id, ?outcome, "Handoff processed"),
                // Another worker already has it, or it already settled
                Err(QueueError::ConcurrencyConflict | QueueError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Work::Sweep => {
            let recovered = engine
                .recover_stuck_transactions(engine.stuck_timeout())
                .await?;
            let finalized = engine.finalize_exhausted(engine.batch_size()).await?;
            counters
                .recovered
                .fetch_add((recovered + finalized) as u64, Ordering::Relaxed);
        }
    }
    Ok(())
}

fn supervise(
    joined: Result<Result<(), QueueError>, tokio::task::JoinError>,
    counters: &PoolCounters,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            counters.task_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Worker task failed");
        }
        Err(e) => {
            counters.task_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::QueueConfig;
    use crate::ledger::{AccountLocks, InMemoryLedger};
    use crate::queue::gateway::{FixedOutcome, SimulatedBank};
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::processor::StageProcessor;

    fn idle_engine() -> Arc<TransactionQueueEngine> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let processor = Arc::new(StageProcessor::new(
            Arc::new(InMemoryLedger::new()),
            Arc::new(SimulatedBank::instant(Arc::new(FixedOutcome(true)), clock.clone())),
            Arc::new(AccountLocks::new()),
            clock.clone(),
        ));
        Arc::new(TransactionQueueEngine::new(
            Arc::new(InMemoryQueue::new(clock.clone())),
            processor,
            &QueueConfig::default(),
            "node-pool",
            clock,
        ))
    }

    #[tokio::test]
    async fn test_busy_pool_skips_ticks() {
        let engine = idle_engine();
        let counters = Arc::new(PoolCounters::default());
        let permits = Arc::new(Semaphore::new(1));
        let mut tasks = JoinSet::new();

        // The only worker is busy: ticks spawn nothing
        let busy = permits.clone().try_acquire_owned().unwrap();
        for _ in 0..3 {
            assert!(!try_start(&mut tasks, &permits, &engine, &counters, Work::Batch));
        }
        assert!(tasks.is_empty());
        assert_eq!(counters.snapshot().ticks_skipped, 3);

        drop(busy);
        assert!(try_start(&mut tasks, &permits, &engine, &counters, Work::Batch));
        assert_eq!(tasks.len(), 1);
        assert_eq!(permits.available_permits(), 0);

        while let Some(joined) = tasks.join_next().await {
            supervise(joined, &counters);
        }
        let stats = counters.snapshot();
        assert_eq!(stats.batches_run, 1);
        assert_eq!(stats.task_failures, 0);
        assert_eq!(permits.available_permits(), 1);
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.poll_interval(), std::time::Duration::from_secs(1));
        assert_eq!(config.recovery_interval(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = PoolCounters::default();
        counters.batches_run.fetch_add(2, Ordering::Relaxed);
        counters.task_failures.fetch_add(1, Ordering::Relaxed);
        let stats = counters.snapshot();
        assert_eq!(stats.batches_run, 2);
        assert_eq!(stats.task_failures, 1);
        assert_eq!(stats.items_settled, 0);
    }

    #[test]
    fn test_supervise_counts_failures() {
        let counters = PoolCounters::default();
        supervise(Ok(Ok(())), &counters);
        supervise(Ok(Err(QueueError::RetryExhausted)), &counters);
        assert_eq!(counters.snapshot().task_failures, 1);
    }
}
