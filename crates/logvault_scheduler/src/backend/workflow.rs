//! Workflow backend.
//!
//! A job's tasks become the nodes of a [`JobGraph`] handed to a
//! [`WorkflowDriver`]. [`LocalWorkflowDriver`] runs graphs in-process: nodes
//! whose dependencies are done run in waves on tokio tasks, with at most
//! `max_parallel_tasks` executing at once.

use async_trait::async_trait;
use logvault_protocol::{JobId, TaskParams, TaskResult};
use logvault_worker::{CancellationToken, TaskExecutor};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{BackendError, ResultHandle, Result, TaskBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkflowJobId(u64);

impl fmt::Display for WorkflowJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wf-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub params: TaskParams,
    /// Indices of nodes that must finish first.
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    pub nodes: Vec<GraphNode>,
}

impl JobGraph {
    /// Independent nodes, one per task.
    pub fn flat(tasks: Vec<TaskParams>) -> Self {
        Self {
            nodes: tasks
                .into_iter()
                .map(|params| GraphNode {
                    params,
                    depends_on: Vec::new(),
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        for (ix, node) in self.nodes.iter().enumerate() {
            if let Some(dep) = node.depends_on.iter().find(|&&dep| dep >= ix) {
                return Err(BackendError::driver(format!(
                    "node {} depends on node {} which does not precede it",
                    ix, dep
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphState {
    Running { completed: usize, total: usize },
    /// Results in node order.
    Finished(Vec<TaskResult>),
}

#[async_trait]
pub trait WorkflowDriver: Send + Sync {
    async fn submit_graph(&self, graph: JobGraph) -> Result<WorkflowJobId>;

    async fn poll_graph(&self, id: WorkflowJobId) -> Result<GraphState>;

    async fn cancel_graph(&self, id: WorkflowJobId) -> Result<()>;
}

struct GraphRun {
    results: Vec<Option<TaskResult>>,
    cancel: CancellationToken,
}

type Runs = Arc<Mutex<HashMap<WorkflowJobId, GraphRun>>>;

/// Runs graphs on the local tokio runtime.
pub struct LocalWorkflowDriver {
    executor: Arc<dyn TaskExecutor>,
    permits: Arc<Semaphore>,
    runs: Runs,
    next_id: AtomicU64,
}

impl LocalWorkflowDriver {
    pub fn new(executor: Arc<dyn TaskExecutor>, max_parallel_tasks: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_parallel_tasks.max(1))),
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(runs: &Runs) -> Result<std::sync::MutexGuard<'_, HashMap<WorkflowJobId, GraphRun>>> {
        runs.lock()
            .map_err(|_| BackendError::driver("workflow state lock poisoned"))
    }
}

async fn run_graph(
    id: WorkflowJobId,
    graph: JobGraph,
    executor: Arc<dyn TaskExecutor>,
    permits: Arc<Semaphore>,
    runs: Runs,
    cancel: CancellationToken,
) {
    let total = graph.nodes.len();
    let mut done = vec![false; total];
    let mut started = vec![false; total];

    while done.iter().any(|d| !d) {
        let ready: Vec<usize> = (0..total)
            .filter(|&ix| !started[ix] && graph.nodes[ix].depends_on.iter().all(|&dep| done[dep]))
            .collect();
        if ready.is_empty() {
            break;
        }

        let mut wave = JoinSet::new();
        for ix in ready {
            started[ix] = true;
            let params = graph.nodes[ix].params.clone();
            let executor = Arc::clone(&executor);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            wave.spawn(async move {
                let task_id = params.task_id;
                if cancel.is_cancelled() {
                    return (ix, TaskResult::cancelled(task_id));
                }
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (ix, TaskResult::failed(task_id, 0.0, "workflow driver closed")),
                };
                if cancel.is_cancelled() {
                    return (ix, TaskResult::cancelled(task_id));
                }
                (ix, executor.execute(params, cancel).await)
            });
        }

        while let Some(joined) = wave.join_next().await {
            let (ix, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(workflow = %id, "Graph node panicked: {}", e);
                    continue;
                }
            };
            done[ix] = true;
            if let Ok(mut runs) = runs.lock() {
                if let Some(run) = runs.get_mut(&id) {
                    run.results[ix] = Some(result);
                }
            }
        }

        // A panicked node never reports; fail it so the graph can finish.
        for ix in 0..total {
            if started[ix] && !done[ix] {
                done[ix] = true;
                if let Ok(mut runs) = runs.lock() {
                    if let Some(run) = runs.get_mut(&id) {
                        let task_id = graph.nodes[ix].params.task_id;
                        run.results[ix] = Some(TaskResult::failed(task_id, 0.0, "task panicked"));
                    }
                }
            }
        }
    }
    debug!(workflow = %id, nodes = total, "Graph finished");
}

#[async_trait]
impl WorkflowDriver for LocalWorkflowDriver {
    async fn submit_graph(&self, graph: JobGraph) -> Result<WorkflowJobId> {
        graph.validate()?;
        let id = WorkflowJobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        Self::lock(&self.runs)?.insert(
            id,
            GraphRun {
                results: vec![None; graph.nodes.len()],
                cancel: cancel.clone(),
            },
        );

        tokio::spawn(run_graph(
            id,
            graph,
            Arc::clone(&self.executor),
            Arc::clone(&self.permits),
            Arc::clone(&self.runs),
            cancel,
        ));
        Ok(id)
    }

    async fn poll_graph(&self, id: WorkflowJobId) -> Result<GraphState> {
        let mut runs = Self::lock(&self.runs)?;
        let run = runs
            .get(&id)
            .ok_or_else(|| BackendError::driver(format!("unknown workflow {}", id)))?;

        let completed = run.results.iter().filter(|r| r.is_some()).count();
        let total = run.results.len();
        if completed < total {
            return Ok(GraphState::Running { completed, total });
        }

        let finished = runs
            .remove(&id)
            .map(|run| run.results.into_iter().flatten().collect())
            .unwrap_or_default();
        Ok(GraphState::Finished(finished))
    }

    async fn cancel_graph(&self, id: WorkflowJobId) -> Result<()> {
        if let Some(run) = Self::lock(&self.runs)?.get(&id) {
            run.cancel.cancel();
        }
        Ok(())
    }
}

/// Graphs of jobs whose results have not been collected yet.
type GraphMap = Arc<Mutex<HashMap<JobId, WorkflowJobId>>>;

/// Drives jobs through a [`WorkflowDriver`].
pub struct WorkflowBackend {
    driver: Arc<dyn WorkflowDriver>,
    graphs: GraphMap,
}

impl WorkflowBackend {
    pub fn new(driver: Arc<dyn WorkflowDriver>) -> Self {
        Self {
            driver,
            graphs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn graph_of(&self, job_id: JobId) -> Option<WorkflowJobId> {
        self.graphs.lock().ok()?.get(&job_id).copied()
    }

    /// Jobs with a graph still in flight.
    pub fn in_flight(&self) -> usize {
        self.graphs.lock().map(|graphs| graphs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TaskBackend for WorkflowBackend {
    fn name(&self) -> &'static str {
        "workflow"
    }

    async fn submit(&self, job_id: JobId, tasks: Vec<TaskParams>) -> Result<Box<dyn ResultHandle>> {
        let count = tasks.len();
        let graph_id = self.driver.submit_graph(JobGraph::flat(tasks)).await?;
        if let Ok(mut graphs) = self.graphs.lock() {
            graphs.insert(job_id, graph_id);
        }
        info!(job_id = %job_id, workflow = %graph_id, tasks = count, "Job graph submitted");
        Ok(Box::new(WorkflowResultHandle {
            driver: Arc::clone(&self.driver),
            graphs: Arc::clone(&self.graphs),
            job_id,
            graph_id,
        }))
    }

    async fn cancel(&self, job_id: JobId) -> Result<()> {
        match self.graph_of(job_id) {
            Some(graph_id) => self.driver.cancel_graph(graph_id).await,
            None => Ok(()),
        }
    }
}

struct WorkflowResultHandle {
    driver: Arc<dyn WorkflowDriver>,
    graphs: GraphMap,
    job_id: JobId,
    graph_id: WorkflowJobId,
}

impl WorkflowResultHandle {
    /// The driver forgets a graph once it reports it finished.
    fn forget(&self) {
        if let Ok(mut graphs) = self.graphs.lock() {
            if graphs.get(&self.job_id) == Some(&self.graph_id) {
                graphs.remove(&self.job_id);
            }
        }
    }
}

#[async_trait]
impl ResultHandle for WorkflowResultHandle {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Vec<TaskResult>>> {
        if let GraphState::Finished(results) = self.driver.poll_graph(self.graph_id).await? {
            self.forget();
            return Ok(Some(results));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        tokio::time::sleep(timeout).await;
        match self.driver.poll_graph(self.graph_id).await? {
            GraphState::Finished(results) => {
                self.forget();
                Ok(Some(results))
            }
            GraphState::Running { .. } => Ok(None),
        }
    }
}
