//! The scheduler loop.
//!
//! Each iteration:
//! 1. refresh this scheduler's heartbeat
//! 2. start PENDING jobs of the served kinds, oldest first
//! 3. forward cancellation requests to the backend
//! 4. advance every job this process owns: attach a reducer, submit, poll,
//!    and record results
//!
//! Backend and database errors are logged and retried on the next
//! iteration; they never become task failures.

use logvault_db::{DbError, HangingScope, JobOutcome, JobRecord, JobStore};
use logvault_protocol::config::SchedulerConfig;
use logvault_protocol::{
    codec, job_status_from_tasks, AggregationConfig, JobConfig, JobId, JobStatus, TaskParams,
    TaskPayload, TaskResult, TaskStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::{ResultHandle, TaskBackend};
use crate::error::Result;
use crate::metrics::METRICS;
use crate::partition::{plan_job, PartitionError};
use crate::reducer::{ReducerBridge, ReducerHandlerMessage, ReducerLink};

const NON_TERMINAL_RESULT_MESSAGE: &str = "A task reported a non-terminal status";

enum Phase {
    /// Aggregation job waiting for an idle reducer.
    WaitingForReducer {
        tasks: Vec<TaskParams>,
        aggregation: AggregationConfig,
        max_num_results: u32,
    },
    /// Tasks persisted but not (yet) accepted by the backend.
    Ready(Vec<TaskParams>),
    Submitted(Box<dyn ResultHandle>),
    /// Results collected, not yet recorded.
    Collected(Vec<TaskResult>),
    /// Results sent to the reducer; waiting for its verdict.
    WaitingForVerdict(Vec<TaskResult>),
    /// Final status decided, not yet written.
    Finishing {
        results: Vec<TaskResult>,
        status_override: Option<JobStatus>,
        status_msg: Option<String>,
    },
}

struct ActiveJob {
    /// Status this process last wrote or observed.
    status: JobStatus,
    phase: Phase,
    reducer: Option<ReducerLink>,
    cancel_sent: bool,
}

impl ActiveJob {
    fn new(status: JobStatus, phase: Phase) -> Self {
        Self {
            status,
            phase,
            reducer: None,
            cancel_sent: false,
        }
    }

    /// Tell an attached reducer to drop the job.
    fn abandon_reducer(&mut self, job_id: JobId, reason: &str) {
        if let Some(link) = self.reducer.take() {
            let _ = link.to_handler.send(ReducerHandlerMessage::Failure {
                job_id,
                error_message: Some(reason.to_string()),
            });
        }
    }
}

enum Finish {
    Done,
    Retry,
}

pub struct Scheduler {
    store: JobStore,
    backend: Arc<dyn TaskBackend>,
    config: SchedulerConfig,
    reducer: Option<ReducerBridge>,
    active: HashMap<JobId, ActiveJob>,
}

impl Scheduler {
    pub fn new(store: JobStore, backend: Arc<dyn TaskBackend>, config: SchedulerConfig) -> Self {
        Self {
            store,
            backend,
            config,
            reducer: None,
            active: HashMap::new(),
        }
    }

    /// Serve aggregation jobs through reducers acquired from `bridge`.
    pub fn with_reducer(mut self, bridge: ReducerBridge) -> Self {
        self.reducer = Some(bridge);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Number of jobs this process is driving.
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    /// Kill in-flight jobs a previous run of this scheduler left behind.
    pub async fn recover(&self) -> Result<Vec<JobId>> {
        let killed = self
            .store
            .kill_hanging_jobs(HangingScope::OwnedBy(&self.config.id))
            .await?;
        METRICS.add_jobs_killed(killed.len() as u64);
        Ok(killed)
    }

    /// Main loop; returns after `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.recover().await?;
        info!(
            scheduler_id = %self.config.id,
            backend = self.backend.name(),
            kinds = ?self.config.kinds,
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_iteration().await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_delay()) => {}
            }
        }

        info!(active = self.active.len(), "Scheduler stopped");
        Ok(())
    }

    pub async fn run_iteration(&mut self) {
        if let Err(e) = self.store.heartbeat(&self.config.id).await {
            warn!("Failed to refresh heartbeat: {}", e);
            METRICS.inc_db_errors();
        }
        if let Err(e) = self.schedule_pending().await {
            warn!("Failed to schedule pending jobs: {}", e);
            METRICS.inc_db_errors();
        }
        if let Err(e) = self.observe_cancellations().await {
            warn!("Failed to check for cancelled jobs: {}", e);
            METRICS.inc_db_errors();
        }

        let mut ids: Vec<JobId> = self.active.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(job) = self.active.remove(&id) {
                if let Some(job) = self.advance(id, job).await {
                    self.active.insert(id, job);
                }
            }
        }
    }

    // ========================================================================
    // Starting jobs
    // ========================================================================

    async fn schedule_pending(&mut self) -> Result<()> {
        let pending = self.store.list_pending_jobs(&self.config.kinds).await?;
        for record in pending {
            if self.active.contains_key(&record.id) {
                continue;
            }
            let id = record.id;
            if let Err(e) = self.start(record).await {
                warn!(job_id = %id, "Failed to start job: {}", e);
                METRICS.inc_db_errors();
            }
        }
        Ok(())
    }

    async fn start(&mut self, record: JobRecord) -> Result<()> {
        let id = record.id;
        let (config, payloads) = match plan_job(
            &self.store,
            record.kind,
            &record.config,
            self.config.target_task_size,
        )
        .await
        {
            Ok(plan) => plan,
            Err(PartitionError::Rejected(reason)) => return self.reject(id, &reason).await,
            Err(PartitionError::Db(e)) => return Err(e.into()),
        };

        let aggregation = match &config {
            JobConfig::Search(cfg) if cfg.needs_reducer() => Some((
                cfg.aggregation.clone().unwrap_or_default(),
                cfg.max_num_results,
            )),
            _ => None,
        };
        if aggregation.is_some() && self.reducer.is_none() {
            return self
                .reject(id, "Aggregation requested but no reducer is enabled")
                .await;
        }

        let blobs = payloads
            .iter()
            .map(|payload| codec::encode(payload))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let task_ids = match self.store.start_job(id, &self.config.id, &blobs).await {
            Ok(ids) => ids,
            Err(e) if e.is_lost_race() => {
                debug!(job_id = %id, "Job was started elsewhere");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        METRICS.inc_jobs_submitted();

        let tasks: Vec<TaskParams> = task_ids
            .into_iter()
            .zip(payloads)
            .map(|(task_id, payload)| TaskParams {
                job_id: id,
                task_id,
                payload,
            })
            .collect();
        info!(job_id = %id, kind = %record.kind, tasks = tasks.len(), "Job started");

        let phase = match aggregation {
            // A search over no archives has nothing to run or reduce.
            _ if tasks.is_empty() => Phase::Collected(Vec::new()),
            Some((aggregation, max_num_results)) => Phase::WaitingForReducer {
                tasks,
                aggregation,
                max_num_results,
            },
            None => Phase::Ready(tasks),
        };
        self.active
            .insert(id, ActiveJob::new(JobStatus::Running, phase));
        Ok(())
    }

    async fn reject(&self, id: JobId, reason: &str) -> Result<()> {
        match self
            .store
            .transition_job(id, JobStatus::Pending, JobStatus::Failed, Some(reason))
            .await
        {
            Ok(()) => {
                warn!(job_id = %id, "Job rejected: {}", reason);
                METRICS.inc_jobs_rejected();
                METRICS.record_finished(JobStatus::Failed);
                Ok(())
            }
            Err(e) if e.is_lost_race() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    async fn observe_cancellations(&mut self) -> Result<()> {
        let cancelling = self
            .store
            .list_jobs_in_status(JobStatus::Cancelling, Some(&self.config.id))
            .await?;

        for record in cancelling {
            let Some(job) = self.active.get_mut(&record.id) else {
                continue;
            };
            if job.cancel_sent {
                continue;
            }
            job.status = JobStatus::Cancelling;
            if matches!(job.phase, Phase::Submitted(_)) {
                if let Err(e) = self.backend.cancel(record.id).await {
                    warn!(job_id = %record.id, "Backend cancel failed: {}", e);
                    METRICS.inc_backend_errors();
                    continue;
                }
            }
            job.cancel_sent = true;
            info!(job_id = %record.id, "Cancellation forwarded");
        }
        Ok(())
    }

    // ========================================================================
    // Advancing jobs
    // ========================================================================

    async fn advance(&mut self, id: JobId, mut job: ActiveJob) -> Option<ActiveJob> {
        let phase = std::mem::replace(&mut job.phase, Phase::Ready(Vec::new()));
        job.phase = match phase {
            Phase::WaitingForReducer {
                tasks,
                aggregation,
                max_num_results,
            } => {
                let phase = self
                    .attach_reducer(id, &mut job, tasks, aggregation, max_num_results)
                    .await?;
                // Submit right away once a reducer is attached.
                if let Phase::Ready(tasks) = phase {
                    self.submit(id, &job, tasks).await?
                } else {
                    phase
                }
            }
            Phase::Ready(tasks) => self.submit(id, &job, tasks).await?,
            Phase::Submitted(mut handle) => {
                match handle.poll(self.config.result_poll_timeout()).await {
                    Ok(None) => Phase::Submitted(handle),
                    Ok(Some(results)) => return self.record_results(id, job, results).await,
                    Err(e) => {
                        warn!(job_id = %id, "Polling for results failed: {}", e);
                        METRICS.inc_backend_errors();
                        Phase::Submitted(handle)
                    }
                }
            }
            Phase::Collected(results) => return self.record_results(id, job, results).await,
            Phase::WaitingForVerdict(results) => return self.await_verdict(id, job, results).await,
            Phase::Finishing {
                results,
                status_override,
                status_msg,
            } => {
                return self
                    .finish_or_retry(id, job, results, status_override, status_msg)
                    .await
            }
        };
        Some(job)
    }

    /// Returns `None` when the job is no longer ours to drive.
    async fn attach_reducer(
        &mut self,
        id: JobId,
        job: &mut ActiveJob,
        tasks: Vec<TaskParams>,
        aggregation: AggregationConfig,
        max_num_results: u32,
    ) -> Option<Phase> {
        let waiting = |tasks, aggregation| {
            Some(Phase::WaitingForReducer {
                tasks,
                aggregation,
                max_num_results,
            })
        };

        if job.status == JobStatus::Cancelling {
            return Some(Phase::Ready(tasks));
        }
        if job.status == JobStatus::Running {
            match self
                .store
                .transition_job(id, JobStatus::Running, JobStatus::PendingReducer, None)
                .await
            {
                Ok(()) => job.status = JobStatus::PendingReducer,
                Err(e) if e.is_lost_race() => {
                    if let Ok(Some(JobStatus::Cancelling)) = self.store.get_job_status(id).await {
                        job.status = JobStatus::Cancelling;
                        return Some(Phase::Ready(tasks));
                    }
                    info!(job_id = %id, "Job left RUNNING before a reducer was requested");
                    return None;
                }
                Err(e) => {
                    warn!(job_id = %id, "Failed to mark job as waiting for a reducer: {}", e);
                    return waiting(tasks, aggregation);
                }
            }
        }

        // Cancellation or the reaper may have moved the job on.
        match self.store.get_job_status(id).await {
            Ok(Some(JobStatus::PendingReducer)) => {}
            Ok(other) => {
                info!(job_id = %id, status = ?other, "Job stopped waiting for a reducer");
                return None;
            }
            Err(e) => {
                warn!(job_id = %id, "Failed to read job status: {}", e);
                return waiting(tasks, aggregation);
            }
        }

        let link = self.reducer.as_mut()?.try_acquire();
        let Some(link) = link else {
            return waiting(tasks, aggregation);
        };
        let config = ReducerHandlerMessage::AggregationConfig {
            job_id: id,
            aggregation: aggregation.clone(),
            max_num_results,
        };
        if link.to_handler.send(config).is_err() {
            debug!(address = %link.address, "Reducer went away before accepting a job");
            return waiting(tasks, aggregation);
        }
        let address = link.address.clone();
        job.reducer = Some(link);

        match self
            .store
            .transition_job(id, JobStatus::PendingReducer, JobStatus::ReducerReady, None)
            .await
        {
            Ok(()) => job.status = JobStatus::ReducerReady,
            Err(e) if e.is_lost_race() => {
                job.abandon_reducer(id, "job stopped before tasks were dispatched");
                return None;
            }
            Err(e) => {
                warn!(job_id = %id, "Failed to mark reducer as ready: {}", e);
                job.abandon_reducer(id, "scheduler could not record the reducer");
                return waiting(tasks, aggregation);
            }
        }
        info!(job_id = %id, reducer = %address, "Reducer attached");

        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                if let TaskPayload::Search { reducer, .. } = &mut task.payload {
                    *reducer = Some(address.clone());
                }
                task
            })
            .collect();
        Some(Phase::Ready(tasks))
    }

    async fn submit(&mut self, id: JobId, job: &ActiveJob, tasks: Vec<TaskParams>) -> Option<Phase> {
        if job.status == JobStatus::Cancelling {
            let results = tasks
                .iter()
                .map(|task| TaskResult::cancelled(task.task_id))
                .collect();
            return Some(Phase::Collected(results));
        }

        let count = tasks.len() as u64;
        match self.backend.submit(id, tasks.clone()).await {
            Ok(handle) => {
                if let Err(e) = self.store.mark_tasks_running(id).await {
                    warn!(job_id = %id, "Failed to mark tasks running: {}", e);
                    METRICS.inc_db_errors();
                }
                METRICS.add_tasks_dispatched(count);
                debug!(job_id = %id, tasks = count, backend = self.backend.name(), "Tasks submitted");
                Some(Phase::Submitted(handle))
            }
            Err(e) => {
                warn!(job_id = %id, "Submitting tasks failed, will retry: {}", e);
                METRICS.inc_backend_errors();
                Some(Phase::Ready(tasks))
            }
        }
    }

    async fn record_results(
        &mut self,
        id: JobId,
        mut job: ActiveJob,
        mut results: Vec<TaskResult>,
    ) -> Option<ActiveJob> {
        let mut violation = false;
        for result in results.iter_mut() {
            if !result.status.is_terminal() {
                error!(
                    job_id = %id,
                    task_id = %result.task_id,
                    status = %result.status,
                    "Task result carries a non-terminal status"
                );
                result.status = TaskStatus::Failed;
                result.error_message = Some(NON_TERMINAL_RESULT_MESSAGE.to_string());
                violation = true;
            }
        }
        let derived = job_status_from_tasks(results.iter().map(|r| r.status));

        if violation {
            job.abandon_reducer(id, NON_TERMINAL_RESULT_MESSAGE);
            let status_override = Some(match job.status {
                JobStatus::Cancelling => JobStatus::Cancelled,
                _ => JobStatus::Failed,
            });
            return self
                .finish_or_retry(
                    id,
                    job,
                    results,
                    status_override,
                    Some(NON_TERMINAL_RESULT_MESSAGE.to_string()),
                )
                .await;
        }

        if job.reducer.is_some() {
            match self
                .store
                .transition_job(
                    id,
                    JobStatus::ReducerReady,
                    JobStatus::PendingReducerDone,
                    None,
                )
                .await
            {
                Ok(()) => job.status = JobStatus::PendingReducerDone,
                Err(e) if e.is_lost_race() => {
                    job.abandon_reducer(id, "job stopped while tasks were running");
                    return None;
                }
                Err(e) => {
                    warn!(job_id = %id, "Failed to record task completion: {}", e);
                    METRICS.inc_db_errors();
                    job.phase = Phase::Collected(results);
                    return Some(job);
                }
            }

            let verdict = match derived {
                Some(JobStatus::Succeeded) => ReducerHandlerMessage::Success { job_id: id },
                other => ReducerHandlerMessage::Failure {
                    job_id: id,
                    error_message: other.map(|status| format!("tasks finished {}", status)),
                },
            };
            let sent = job
                .reducer
                .as_ref()
                .map(|link| link.to_handler.send(verdict).is_ok())
                .unwrap_or(false);
            if !sent {
                job.reducer = None;
                return self
                    .finish_or_retry(
                        id,
                        job,
                        results,
                        Some(JobStatus::Failed),
                        Some("Reducer disconnected".to_string()),
                    )
                    .await;
            }
            job.phase = Phase::WaitingForVerdict(results);
            return Some(job);
        }

        let status_override = match (job.status, derived) {
            (JobStatus::Cancelling, Some(JobStatus::Killed)) => None,
            (JobStatus::Cancelling, _) => Some(JobStatus::Cancelled),
            _ => None,
        };
        self.finish_or_retry(id, job, results, status_override, None)
            .await
    }

    async fn await_verdict(
        &mut self,
        id: JobId,
        mut job: ActiveJob,
        results: Vec<TaskResult>,
    ) -> Option<ActiveJob> {
        let verdict = match job.reducer.as_mut() {
            Some(link) => link.from_handler.try_recv(),
            None => Err(TryRecvError::Disconnected),
        };

        let (status_override, status_msg) = match verdict {
            Ok(ReducerHandlerMessage::Success { .. }) => {
                let derived = job_status_from_tasks(results.iter().map(|r| r.status));
                match derived {
                    Some(JobStatus::Succeeded) | Some(JobStatus::Failed) | Some(JobStatus::Killed) => {
                        (None, None)
                    }
                    _ => (Some(JobStatus::Failed), None),
                }
            }
            Ok(ReducerHandlerMessage::Failure { error_message, .. }) => (
                Some(JobStatus::Failed),
                Some(error_message.unwrap_or_else(|| "Reducer failed".to_string())),
            ),
            Ok(ReducerHandlerMessage::AggregationConfig { .. }) | Err(TryRecvError::Empty) => {
                job.phase = Phase::WaitingForVerdict(results);
                return Some(job);
            }
            Err(TryRecvError::Disconnected) => (
                Some(JobStatus::Failed),
                Some("Reducer disconnected".to_string()),
            ),
        };

        // The handler is idle again; it re-offered itself on its own.
        job.reducer = None;
        self.finish_or_retry(id, job, results, status_override, status_msg)
            .await
    }

    async fn finish_or_retry(
        &mut self,
        id: JobId,
        mut job: ActiveJob,
        results: Vec<TaskResult>,
        status_override: Option<JobStatus>,
        status_msg: Option<String>,
    ) -> Option<ActiveJob> {
        match self
            .finish(id, job.status, &results, status_override, status_msg.as_deref())
            .await
        {
            Finish::Done => None,
            Finish::Retry => {
                job.phase = Phase::Finishing {
                    results,
                    status_override,
                    status_msg,
                };
                Some(job)
            }
        }
    }

    async fn finish(
        &self,
        id: JobId,
        from: JobStatus,
        results: &[TaskResult],
        status_override: Option<JobStatus>,
        status_msg: Option<&str>,
    ) -> Finish {
        let mut status_override = status_override;
        let mut status_msg = status_msg.map(str::to_string);

        loop {
            let outcome = JobOutcome {
                from,
                results,
                status_override,
                status_msg: status_msg.clone(),
            };
            return match self.store.finish_job(id, outcome).await {
                Ok(status) => {
                    let failed = results
                        .iter()
                        .filter(|r| r.status == TaskStatus::Failed)
                        .count();
                    info!(job_id = %id, %status, tasks = results.len(), failed, "Job finished");
                    METRICS.record_finished(status);
                    METRICS.add_tasks_failed(failed as u64);
                    Finish::Done
                }
                Err(e) if e.is_lost_race() => {
                    warn!(job_id = %id, "Job changed status while running, dropping: {}", e);
                    Finish::Done
                }
                Err(DbError::IllegalTransition { from, to, .. }) => {
                    error!(job_id = %id, %from, %to, "Cannot record job outcome");
                    if status_override != Some(JobStatus::Failed)
                        && from.can_transition_to(JobStatus::Failed)
                    {
                        status_override = Some(JobStatus::Failed);
                        status_msg = Some("Job outcome did not fit its state".to_string());
                        continue;
                    }
                    Finish::Done
                }
                Err(e) => {
                    warn!(job_id = %id, "Failed to record job outcome, will retry: {}", e);
                    METRICS.inc_db_errors();
                    Finish::Retry
                }
            };
        }
    }
}
