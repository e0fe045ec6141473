//! Tracked async task spawning with per-type statistics, cooperative
//! cancellation, and an LLM concurrency gate. Grounded on
//! `original_source/async_task_manager.py` (`AsyncTaskManager`/`TaskInfo`);
//! `tokio::task::JoinHandle`/`AbortHandle` stand in for `asyncio.Task`, and
//! a `tokio::sync::Semaphore` replaces the thread-pool-backed
//! `llm_semaphore`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    AutoSave,
    LlmRequest,
    ContentGeneration,
    IoOperation,
    Background,
    Other,
}

impl TaskType {
    const ALL: [TaskType; 6] = [
        TaskType::AutoSave,
        TaskType::LlmRequest,
        TaskType::ContentGeneration,
        TaskType::IoOperation,
        TaskType::Background,
        TaskType::Other,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            TaskType::AutoSave => "auto_save",
            TaskType::LlmRequest => "llm_request",
            TaskType::ContentGeneration => "content_generation",
            TaskType::IoOperation => "io_operation",
            TaskType::Background => "background",
            TaskType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskTypeStats {
    pub total_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub cancelled_count: u64,
    pub total_time: Duration,
}

impl TaskTypeStats {
    pub fn avg_time(&self) -> Duration {
        if self.success_count == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.success_count as u32
        }
    }
}

struct TaskEntry {
    task_type: TaskType,
    description: String,
    created_at: Instant,
    handle: JoinHandle<()>,
}

/// Tracks every spawned task by id, gates LLM-typed work behind a
/// semaphore sized off `GameConfig::max_concurrent_llm_requests`, and
/// accumulates per-type statistics the way the original's `task_stats`
/// dict does.
pub struct TaskManager {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    stats: Mutex<HashMap<TaskType, TaskTypeStats>>,
    llm_semaphore: Arc<Semaphore>,
    counter: AtomicU64,
}

impl TaskManager {
    pub fn new(max_concurrent_llm_requests: usize) -> Self {
        let mut stats = HashMap::new();
        for t in TaskType::ALL {
            stats.insert(t, TaskTypeStats::default());
        }
        Self {
            tasks: Mutex::new(HashMap::new()),
            stats: Mutex::new(stats),
            llm_semaphore: Arc::new(Semaphore::new(max_concurrent_llm_requests.max(1))),
            counter: AtomicU64::new(0),
        }
    }

    /// Spawns `fut`, tracking it under `task_type`. `LlmRequest` tasks
    /// additionally acquire a permit from `llm_semaphore` before running,
    /// bounding concurrent LLM calls the way the original's semaphore does.
    pub async fn spawn<F>(self: &Arc<Self>, task_type: TaskType, description: &str, fut: F) -> String
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let id = format!(
            "{}_{}_{}",
            task_type.as_str(),
            self.counter.fetch_add(1, Ordering::SeqCst),
            Instant::now().elapsed().as_nanos()
        );
        let manager = self.clone();
        let task_id = id.clone();
        let semaphore = self.llm_semaphore.clone();

        let handle = tokio::spawn(async move {
            let _permit = if task_type == TaskType::LlmRequest {
                semaphore.acquire_owned().await.ok()
            } else {
                None
            };

            let start = Instant::now();
            let result = fut.await;
            let elapsed = start.elapsed();

            let mut stats = manager.stats.lock().await;
            let entry = stats.entry(task_type).or_default();
            match result {
                Ok(()) => {
                    entry.success_count += 1;
                    entry.total_time += elapsed;
                    log::debug!("task {task_id} completed in {elapsed:?}");
                }
                Err(e) => {
                    entry.error_count += 1;
                    log::error!("task {task_id} failed after {elapsed:?}: {e}");
                }
            }
            drop(stats);

            manager.tasks.lock().await.remove(&task_id);
        });

        let mut tasks = self.tasks.lock().await;
        tasks.insert(
            id.clone(),
            TaskEntry { task_type, description: description.to_string(), created_at: Instant::now(), handle },
        );
        let mut stats = self.stats.lock().await;
        stats.entry(task_type).or_default().total_count += 1;
        drop(stats);
        drop(tasks);

        id
    }

    /// Aborts the task; `tokio::task::JoinHandle::abort` cancels at the next
    /// await point, the cooperative-cancellation equivalent of
    /// `asyncio.Task.cancel()`. When `wait` is true, awaits the handle so
    /// the cancellation has actually landed before returning.
    pub async fn cancel_task(&self, task_id: &str, wait: bool) -> bool {
        let mut tasks = self.tasks.lock().await;
        let Some(entry) = tasks.remove(task_id) else {
            log::warn!("task {task_id} not found");
            return false;
        };
        if entry.handle.is_finished() {
            log::debug!("task {task_id} already done");
            return false;
        }
        entry.handle.abort();
        let mut stats = self.stats.lock().await;
        stats.entry(entry.task_type).or_default().cancelled_count += 1;
        drop(stats);
        drop(tasks);

        if wait {
            let _ = entry.handle.await;
        }
        log::debug!("cancelled task: {task_id}");
        true
    }

    /// Cancels every tracked task, or only those of `task_type` when given.
    pub async fn cancel_all(&self, task_type: Option<TaskType>, wait: bool) {
        let ids: Vec<String> = {
            let tasks = self.tasks.lock().await;
            tasks
                .iter()
                .filter(|(_, e)| !e.handle.is_finished() && task_type.map(|t| t == e.task_type).unwrap_or(true))
                .map(|(id, _)| id.clone())
                .collect()
        };
        log::info!("cancelling {} tasks", ids.len());
        for id in &ids {
            self.cancel_task(id, wait).await;
        }
        log::info!("cancelled {} tasks", ids.len());
    }

    pub async fn active_task_count(&self, task_type: Option<TaskType>) -> usize {
        let tasks = self.tasks.lock().await;
        tasks
            .values()
            .filter(|e| !e.handle.is_finished() && task_type.map(|t| t == e.task_type).unwrap_or(true))
            .count()
    }

    pub async fn stats_snapshot(&self) -> HashMap<TaskType, TaskTypeStats> {
        self.stats.lock().await.clone()
    }

    pub async fn describe(&self, task_id: &str) -> Option<(TaskType, String, Duration)> {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).map(|e| (e.task_type, e.description.clone(), e.created_at.elapsed()))
    }
}
