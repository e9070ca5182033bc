//! Pipeline poller
//!
//! Lists claimable pipelines and drives each one it manages to claim in its
//! own task. The semaphore bounds how many run at once; a poll cycle does not
//! wait for them, so a freed permit is reused on the next tick. A heartbeat
//! task runs next to every claimed pipeline and signals the driving task once
//! ownership is lost.

use anyhow::{Context as AnyhowContext, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_coordinator::{CoordinationError, Coordinator, RetryOutcome};
use warden_core::domain::lease::{LeaseGrant, OwnerId};
use warden_core::domain::node::{Node, NodeStatus};
use warden_core::domain::pipeline::PipelineStatus;
use warden_core::dto::node::NodeStatusUpdate;
use warden_core::tenant::{self, ProjectId};

use crate::config::Config;
use crate::service::{ProgressReporter, StepContext, StepExecutor};

/// How driving one pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A step ran out of retries
    Failed { step: String },
    /// Another owner holds the pipeline
    NotClaimed,
    /// Ownership moved to another owner mid-run; nothing more was written
    LeaseLost,
    /// Shutdown was requested; the lease was released for another worker
    Interrupted,
    /// The pipeline was already terminal when claimed
    AlreadyFinished,
}

enum NextStep {
    Run(Node),
    Retry(Node),
    Exhausted(Node),
    Done,
}

/// Pipeline poller that claims and drives pipelines of one project
#[derive(Clone)]
pub struct PipelinePoller {
    config: Config,
    coordinator: Coordinator,
    executor: Arc<dyn StepExecutor>,
    owner: OwnerId,
    project: ProjectId,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    /// Pipelines with a live task in this process
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Removes a pipeline from the in-flight set when its task ends, even by panic
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    pipeline_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.pipeline_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PipelinePoller {
    pub fn new(
        config: Config,
        coordinator: Coordinator,
        executor: Arc<dyn StepExecutor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_pipelines));
        Self {
            owner: OwnerId::generate(&config.worker_id),
            project: ProjectId::new(config.project_id),
            config,
            coordinator,
            executor,
            semaphore,
            shutdown,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Owner ID this process claims pipelines under
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Starts the polling loop; returns once shutdown is signalled
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting pipeline poller as {} (interval: {:?})",
            self.owner, self.config.poll_interval
        );

        let mut interval = time::interval(self.config.poll_interval);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Ok(()) = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    info!("Pipeline poller stopping");
                    self.wait_for_tasks().await;
                    return Ok(());
                }
            }

            debug!("Polling for claimable pipelines");

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} pipeline task(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Performs a single poll cycle
    ///
    /// Returns the number of pipeline tasks started; they keep running after
    /// the cycle returns.
    async fn poll_once(&self) -> Result<usize> {
        self.reap_finished();

        let available = self.semaphore.available_permits();
        if available == 0 {
            debug!("Max parallel pipelines reached");
            return Ok(0);
        }

        let stale_after = self.stale_after()?;
        let pipelines = tenant::scope(
            self.project,
            self.coordinator
                .pipelines()
                .list_claimable(stale_after, available),
        )
        .await
        .context("Failed to list claimable pipelines")?;

        if pipelines.is_empty() {
            debug!("No pipelines available");
            return Ok(0);
        }

        info!("Found {} claimable pipeline(s)", pipelines.len());

        let mut started = 0;
        for pipeline in pipelines {
            // Unowned until its task claims it, so it can be listed twice
            if !lock(&self.in_flight).insert(pipeline.id) {
                debug!("Pipeline {} is already being driven here", pipeline.id);
                continue;
            }
            let guard = InFlight {
                set: self.in_flight.clone(),
                pipeline_id: pipeline.id,
            };

            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.spawn_pipeline_task(guard, permit);
                    started += 1;
                }
                Err(_) => {
                    debug!("Max parallel pipelines reached, skipping {} for now", pipeline.id);
                }
            }
        }

        Ok(started)
    }

    fn spawn_pipeline_task(&self, guard: InFlight, permit: OwnedSemaphorePermit) {
        let poller = self.clone();
        let pipeline_id = guard.pipeline_id;

        lock(&self.tasks).spawn(async move {
            let _permit = permit;
            let _guard = guard;
            match poller.run_pipeline(pipeline_id).await {
                Ok(outcome) => info!("Pipeline {} finished: {:?}", pipeline_id, outcome),
                Err(e) => error!("Failed to drive pipeline {}: {:#}", pipeline_id, e),
            }
        });
    }

    /// Collects finished pipeline tasks without waiting
    fn reap_finished(&self) {
        let mut tasks = lock(&self.tasks);
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!("Pipeline task panicked: {}", e);
            }
        }
    }

    /// Waits until every pipeline task started so far has ended
    pub async fn wait_for_tasks(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        if !tasks.is_empty() {
            info!("Waiting for {} pipeline task(s)", tasks.len());
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Pipeline task panicked: {}", e);
            }
        }
    }

    fn stale_after(&self) -> Result<Option<chrono::Duration>> {
        self.config
            .stale_lease_timeout
            .map(|timeout| {
                chrono::Duration::from_std(timeout).context("Stale lease timeout is out of range")
            })
            .transpose()
    }

    /// Claims one pipeline and drives it inside this worker's project scope
    pub async fn run_pipeline(&self, pipeline_id: Uuid) -> Result<RunOutcome> {
        tenant::scope(self.project, self.drive(pipeline_id)).await
    }

    async fn drive(&self, pipeline_id: Uuid) -> Result<RunOutcome> {
        let leases = self.coordinator.leases();
        let claim = match self.stale_after()? {
            Some(stale_after) => {
                leases
                    .reclaim_stale(pipeline_id, &self.owner, stale_after)
                    .await
            }
            None => leases.claim(pipeline_id, &self.owner).await,
        }
        .context("Failed to claim pipeline")?;

        let Some(grant) = claim.into_grant() else {
            debug!("Pipeline {} is held by another worker", pipeline_id);
            return Ok(RunOutcome::NotClaimed);
        };

        let (lost_tx, lost_rx) = watch::channel(false);
        let heartbeat = self.spawn_heartbeat(grant.clone(), lost_tx);
        let result = self.execute(&grant, lost_rx).await;
        heartbeat.abort();

        let lease_lost = match &result {
            Ok(outcome) => *outcome == RunOutcome::LeaseLost,
            Err(e) => is_lease_lost(e),
        };
        if lease_lost {
            warn!(
                "Lost ownership of pipeline {}, leaving it to the new owner",
                pipeline_id
            );
            return Ok(RunOutcome::LeaseLost);
        }

        if let Err(e) = leases.release(pipeline_id).await {
            warn!("Failed to release pipeline {}: {}", pipeline_id, e);
        }
        result
    }

    async fn execute(
        &self,
        grant: &LeaseGrant,
        mut lost: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let pipeline_id = grant.pipeline_id;
        let pipelines = self.coordinator.pipelines();
        let nodes = self.coordinator.nodes();

        let pipeline = pipelines.get(pipeline_id).await?;
        match pipeline.status {
            status if status.is_terminal() => return Ok(RunOutcome::AlreadyFinished),
            PipelineStatus::Pending => {
                pipelines
                    .update_status(grant, pipeline_id, PipelineStatus::Running, None)
                    .await?;
                info!(
                    "Started {} pipeline {} for resource {}",
                    pipeline.kind, pipeline_id, pipeline.resource_id
                );
            }
            _ => info!("Resuming pipeline {}", pipeline_id),
        }

        loop {
            if *lost.borrow() {
                return Ok(RunOutcome::LeaseLost);
            }
            if *self.shutdown.borrow() {
                return Ok(RunOutcome::Interrupted);
            }

            let node = match self.next_step(pipeline_id).await? {
                NextStep::Run(node) => node,
                NextStep::Retry(node) => {
                    match nodes
                        .retry(grant, node.id, self.config.max_step_retries)
                        .await?
                    {
                        RetryOutcome::Rescheduled(_) => continue,
                        RetryOutcome::Exhausted(node) => return self.fail(grant, node).await,
                    }
                }
                NextStep::Exhausted(node) => return self.fail(grant, node).await,
                NextStep::Done => break,
            };

            pipelines
                .update_status(
                    grant,
                    pipeline_id,
                    PipelineStatus::Running,
                    Some(node.step_name.clone()),
                )
                .await?;
            let node = nodes.apply(grant, NodeStatusUpdate::running(node.id)).await?;

            let step = StepContext {
                pipeline_id,
                kind: pipeline.kind,
                resource_id: pipeline.resource_id,
                node_id: node.id,
                step_name: node.step_name.clone(),
                step_order: node.step_order,
                attempt: node.retry_count,
                progress: ProgressReporter::new(self.coordinator.clone(), grant.clone(), node.id),
            };

            let mut shutdown = self.shutdown.clone();
            let result = tokio::select! {
                result = self.executor.execute_step(&step) => result,
                Ok(_) = lost.wait_for(|lost| *lost) => return Ok(RunOutcome::LeaseLost),
                Ok(_) = shutdown.wait_for(|stop| *stop) => {
                    info!(
                        "Interrupting step {} of pipeline {} for shutdown",
                        node.step_name, pipeline_id
                    );
                    return Ok(RunOutcome::Interrupted);
                }
            };

            match result {
                Ok(()) => {
                    nodes
                        .apply(grant, NodeStatusUpdate::completed(node.id))
                        .await?;
                    info!("Step {} of pipeline {} completed", node.step_name, pipeline_id);
                }
                Err(e) if is_lease_lost(&e) => return Ok(RunOutcome::LeaseLost),
                Err(e) => {
                    warn!(
                        "Step {} of pipeline {} failed: {:#}",
                        node.step_name, pipeline_id, e
                    );
                    nodes
                        .apply(grant, NodeStatusUpdate::failed(node.id, format!("{:#}", e)))
                        .await?;
                }
            }
        }

        pipelines
            .update_status(grant, pipeline_id, PipelineStatus::Completed, None)
            .await?;
        info!("Pipeline {} completed", pipeline_id);
        Ok(RunOutcome::Completed)
    }

    /// Pick what to do next: resume, retry, give up, start the next step, or finish
    async fn next_step(&self, pipeline_id: Uuid) -> Result<NextStep> {
        let nodes = self.coordinator.nodes();

        if let Some(node) = nodes.get_interrupted_node(pipeline_id).await? {
            info!(
                "Resuming interrupted step {} of pipeline {}",
                node.step_name, pipeline_id
            );
            return Ok(NextStep::Run(node));
        }

        // A failed step blocks every later one
        let all = nodes.list(pipeline_id).await?;
        if let Some(node) = all
            .into_iter()
            .find(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Exhausted))
        {
            return Ok(match node.status {
                NodeStatus::Failed => NextStep::Retry(node),
                _ => NextStep::Exhausted(node),
            });
        }

        Ok(match nodes.get_next_pending_node(pipeline_id).await? {
            Some(node) => NextStep::Run(node),
            None => NextStep::Done,
        })
    }

    async fn fail(&self, grant: &LeaseGrant, node: Node) -> Result<RunOutcome> {
        self.coordinator
            .pipelines()
            .update_status(
                grant,
                grant.pipeline_id,
                PipelineStatus::Failed,
                Some(node.step_name.clone()),
            )
            .await?;
        error!(
            "Pipeline {} failed at step {}: {}",
            grant.pipeline_id,
            node.step_name,
            node.error_message.as_deref().unwrap_or("no error message")
        );
        Ok(RunOutcome::Failed {
            step: node.step_name,
        })
    }

    /// Starts a background task renewing the lease of one pipeline
    fn spawn_heartbeat(&self, grant: LeaseGrant, lost: watch::Sender<bool>) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(tenant::scope(self.project, async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; the claim itself stamped the heartbeat
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match coordinator
                    .leases()
                    .heartbeat(grant.pipeline_id, &grant.owner_id)
                    .await
                {
                    Ok(at) => debug!("Heartbeat for pipeline {} at {}", grant.pipeline_id, at),
                    Err(e) if e.is_lease_lost() || matches!(e, CoordinationError::PipelineNotFound(_)) => {
                        warn!("Heartbeat for pipeline {} rejected: {}", grant.pipeline_id, e);
                        let _ = lost.send(true);
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to send heartbeat for pipeline {}: {}", grant.pipeline_id, e);
                    }
                }
            }
        }))
    }
}

fn is_lease_lost(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<CoordinationError>()
            .is_some_and(CoordinationError::is_lease_lost)
    })
}
