//! The queue runtime: one service owning every control loop on this node.

pub mod executor;
pub mod leader;
pub mod notifier;
pub mod producer;
pub mod pruner;
pub mod refresher;
pub mod scheduler;
pub mod stager;

use crate::config::Config;
use crate::data::{jobs, producers};
use crate::status::{ServiceStatus, ServiceStatusRegistry};
use crate::telemetry::TelemetryRegistry;
use crate::worker::WorkerRegistry;
use executor::Executor;
use leader::Leader;
use notifier::Notifier;
use producer::Producer;
use pruner::Pruner;
use refresher::Refresher;
use scheduler::Scheduler;
use sqlx::PgPool;
use stager::Stager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Supervises the notifier, leader, producers, stager, refresher, pruner,
/// and cron scheduler for one node.
///
/// Tasks are grouped into two stages so [`QueueRuntime::shutdown`] can stop
/// them in order: the work stage (producers, stager, scheduler, and the
/// insert-notification dispatch) stops and drains first, then the support
/// stage (notifier, refresher, pruner, leader) follows. The leader only
/// releases its advisory lock once every in-flight executor has settled.
pub struct QueueRuntime {
    config: Config,
    pool: PgPool,
    registry: WorkerRegistry,
    telemetry: TelemetryRegistry,
    statuses: ServiceStatusRegistry,
    work_shutdown_tx: Option<broadcast::Sender<()>>,
    support_shutdown_tx: Option<broadcast::Sender<()>>,
    work_handles: Vec<JoinHandle<()>>,
    support_handles: Vec<JoinHandle<()>>,
}

impl QueueRuntime {
    pub fn new(
        config: Config,
        pool: PgPool,
        registry: WorkerRegistry,
        telemetry: TelemetryRegistry,
        statuses: ServiceStatusRegistry,
    ) -> Self {
        Self {
            config,
            pool,
            registry,
            telemetry,
            statuses,
            work_shutdown_tx: None,
            support_shutdown_tx: None,
            work_handles: Vec::new(),
            support_handles: Vec::new(),
        }
    }

    /// Start every control loop. Returns once the node is live.
    pub async fn start(&mut self) -> Result<(), anyhow::Error> {
        let ident = self.config.ident();

        // Recover jobs stranded by a previous unclean shutdown of this node
        // before any producer starts fetching.
        match jobs::force_rescue_node(&ident, &self.pool).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "rescued jobs stranded by a previous run"),
            Err(error) => warn!(error = ?error, "startup job rescue failed"),
        }

        info!(ident = %ident, queues = ?self.config.queues, "queue runtime starting");

        let (work_tx, _) = broadcast::channel(1);
        let (support_tx, _) = broadcast::channel(1);
        self.work_shutdown_tx = Some(work_tx.clone());
        self.support_shutdown_tx = Some(support_tx.clone());

        let notifier = Arc::new(Notifier::new(self.pool.clone()));
        self.support_handles
            .push(tokio::spawn(notifier.clone().run(support_tx.subscribe())));

        let (leader, leadership) = Leader::new(
            self.pool.clone(),
            self.config.leadership.clone(),
            &self.config.name,
            &self.config.node,
            notifier.clone(),
        );
        self.support_handles
            .push(tokio::spawn(leader.run(support_tx.subscribe())));

        let executor = Arc::new(Executor::new(
            self.pool.clone(),
            self.registry.clone(),
            self.telemetry.clone(),
            self.config.errors_with_traceback,
        ));

        let mut wakeups = HashMap::new();
        let mut uuids = Vec::new();

        for (queue, limit) in &self.config.queues {
            let uuid = Uuid::new_v4();
            let meta = producers::ProducerMeta {
                local_limit: *limit,
                paused: false,
            };

            producers::insert_producer(
                uuid,
                &self.config.name,
                &self.config.node,
                queue,
                &meta,
                &self.pool,
            )
            .await?;

            let wakeup = Arc::new(Notify::new());
            wakeups.insert(queue.clone(), wakeup.clone());
            uuids.push(uuid);

            let producer = Producer::new(
                self.pool.clone(),
                executor.clone(),
                uuid,
                ident.clone(),
                queue.clone(),
                *limit,
                false,
                wakeup,
                notifier.subscribe_signals(),
            );
            self.work_handles
                .push(tokio::spawn(producer.run(work_tx.subscribe())));
        }

        let wakeups = Arc::new(wakeups);

        // Fast path for enqueues: insert notifications wake the matching
        // local producer without waiting for the next staging pass.
        {
            let wakeups = wakeups.clone();
            let mut insert_rx = notifier.subscribe_inserts();
            let mut shutdown_rx = work_tx.subscribe();

            self.work_handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = insert_rx.recv() => match received {
                            Ok(payload) => {
                                if let Some(wakeup) = wakeups.get(&payload.queue) {
                                    wakeup.notify_one();
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        let stager = Stager::new(
            self.pool.clone(),
            self.config.stager.clone(),
            wakeups,
            notifier.clone(),
        );
        self.work_handles
            .push(tokio::spawn(stager.run(work_tx.subscribe())));

        let refresher = Refresher::new(
            self.pool.clone(),
            self.config.refresher.clone(),
            uuids,
            leadership.clone(),
        )?;
        self.support_handles
            .push(tokio::spawn(refresher.run(support_tx.subscribe())));

        let pruner = Pruner::new(
            self.pool.clone(),
            self.config.pruner.clone(),
            leadership.clone(),
        );
        self.support_handles
            .push(tokio::spawn(pruner.run(support_tx.subscribe())));

        let entries = self.config.cron_entries()?;
        if !entries.is_empty() {
            let scheduler = Scheduler::new(self.pool.clone(), entries, leadership, notifier);
            self.work_handles
                .push(tokio::spawn(scheduler.run(work_tx.subscribe())));
        }

        self.statuses.set("queue", ServiceStatus::Active);
        info!("queue runtime started");

        Ok(())
    }

    /// Resolve when any runtime task exits before shutdown was requested.
    ///
    /// Loops run until told to stop, so an early exit means a panic or a
    /// bug; callers treat it as a reason to stop the node. Pends forever on
    /// a runtime that was never started.
    pub(crate) async fn tend(&self) {
        loop {
            let exited = self
                .work_handles
                .iter()
                .chain(&self.support_handles)
                .any(|handle| handle.is_finished());

            if exited {
                return;
            }

            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Stop the node in stages.
    ///
    /// Work loops go first: producers stop fetching and drain their
    /// in-flight executors, the stager and scheduler stop promoting and
    /// emitting. Only after every work task has finished do the support
    /// loops stop, so the leader holds its advisory lock (and the refresher
    /// keeps heartbeating) until all in-flight jobs have settled.
    pub async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.statuses.set("queue", ServiceStatus::Disabled);
        info!("queue runtime shutting down");

        let (Some(work_tx), Some(support_tx)) = (
            self.work_shutdown_tx.take(),
            self.support_shutdown_tx.take(),
        ) else {
            return Err(anyhow::anyhow!("queue runtime was never started"));
        };

        let _ = work_tx.send(());
        let mut panicked = join_stage(&mut self.work_handles).await;

        let _ = support_tx.send(());
        panicked += join_stage(&mut self.support_handles).await;

        if panicked > 0 {
            warn!(count = panicked, "runtime tasks panicked during shutdown");
            return Err(anyhow::anyhow!("{panicked} task(s) panicked"));
        }

        info!("queue runtime stopped");
        Ok(())
    }
}

/// Await every task in a stage, returning how many panicked.
async fn join_stage(handles: &mut Vec<JoinHandle<()>>) -> usize {
    futures::future::join_all(handles.drain(..))
        .await
        .iter()
        .filter(|result| result.is_err())
        .count()
}
