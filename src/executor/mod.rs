//! Bounded executor pools for cache loading.
//!
//! Each pool owns a dedicated tokio runtime. Concurrency is bounded by worker
//! permits rather than OS threads, and admission is bounded by the queue
//! capacity, so a congested purpose (file listing under a wide partition scan)
//! never starves the others.

use crate::cache::MetaCacheError;
use crate::config::MetaCacheConfig;
use crate::metrics::{MetricRegistry, PoolMetrics};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Idle time after which a checkpoint pool reclaims blocking threads.
const CHECKPOINT_KEEP_ALIVE_SECS: u64 = 60;

pub const ROW_COUNT_REFRESH_POOL: &str = "RowCountRefreshExecutor";
pub const COMMON_REFRESH_POOL: &str = "CommonRefreshExecutor";
pub const FILE_LISTING_POOL: &str = "FileListingExecutor";
pub const SCHEDULE_POOL: &str = "scheduleExecutor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    /// Live catalogs: fixed worker count with a bounded queue.
    Primary,
    /// Checkpoint replay: direct hand-off, no queue, short-lived threads.
    Checkpoint,
}

impl PoolRole {
    pub fn from_checkpoint(is_checkpoint: bool) -> Self {
        if is_checkpoint {
            PoolRole::Checkpoint
        } else {
            PoolRole::Primary
        }
    }

    fn name_prefix(self) -> &'static str {
        match self {
            PoolRole::Checkpoint => "Checkpoint",
            PoolRole::Primary => "NotCheckpoint",
        }
    }
}

/// A named, bounded worker pool.
pub struct ExecutorPool {
    name: String,
    role: PoolRole,
    thread_count: usize,
    queue_capacity: usize,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    metrics: Arc<PoolMetrics>,
    shut_down: AtomicBool,
}

impl fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("thread_count", &self.thread_count)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Create a pool named `Checkpoint<pool_name>` or `NotCheckpoint<pool_name>`.
///
/// Checkpoint pools ignore `queue_capacity` and `idle_timeout_secs`: a submit
/// is accepted only while a worker is free.
pub fn new_thread_pool(
    is_checkpoint: bool,
    thread_count: usize,
    queue_capacity: usize,
    pool_name: &str,
    idle_timeout_secs: u64,
    metrics: Option<&MetricRegistry>,
) -> Result<ExecutorPool> {
    let role = PoolRole::from_checkpoint(is_checkpoint);
    let real_name = format!("{}{}", role.name_prefix(), pool_name);
    if thread_count == 0 {
        bail!("Executor pool {} requires at least one thread", real_name);
    }

    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.thread_name(real_name.clone()).enable_all();
    match role {
        PoolRole::Primary => {
            builder.worker_threads(thread_count.min(parallelism));
            if idle_timeout_secs > 0 {
                builder.thread_keep_alive(Duration::from_secs(idle_timeout_secs));
            }
        }
        PoolRole::Checkpoint => {
            builder
                .worker_threads(1)
                .thread_keep_alive(Duration::from_secs(CHECKPOINT_KEEP_ALIVE_SECS));
        }
    }
    let runtime = builder
        .build()
        .with_context(|| format!("Failed to start executor pool {}", real_name))?;

    let queue_capacity = match role {
        PoolRole::Primary => queue_capacity,
        PoolRole::Checkpoint => 0,
    };
    let pool_metrics = Arc::new(PoolMetrics::new());
    if let Some(registry) = metrics {
        registry.register_pool(&real_name, pool_metrics.clone());
    }

    tracing::info!(
        pool = %real_name,
        thread_count,
        queue_capacity,
        "Executor pool started"
    );

    Ok(ExecutorPool {
        handle: runtime.handle().clone(),
        runtime: Mutex::new(Some(runtime)),
        workers: Arc::new(Semaphore::new(thread_count)),
        admission: Arc::new(Semaphore::new(thread_count + queue_capacity)),
        name: real_name,
        role,
        thread_count,
        queue_capacity,
        metrics: pool_metrics,
        shut_down: AtomicBool::new(false),
    })
}

enum Admission {
    /// Holds a queue slot; a worker permit is acquired inside the task.
    Queued(OwnedSemaphorePermit),
    /// Holds a worker permit already (direct hand-off).
    Running(OwnedSemaphorePermit),
}

/// Keeps the pool gauges right whether the task runs, finishes, or is dropped.
struct TaskGuard {
    metrics: Arc<PoolMetrics>,
    started: bool,
}

impl TaskGuard {
    fn start(&mut self) {
        self.metrics.task_started();
        self.started = true;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.started {
            self.metrics.task_finished();
        } else {
            self.metrics.task_abandoned();
        }
    }
}

impl ExecutorPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Submit a task without blocking.
    ///
    /// Fails with [`MetaCacheError::ExecutorSaturated`] when every worker is
    /// busy and the queue is full, and with
    /// [`MetaCacheError::ExecutorShutdown`] once the pool has been shut down.
    pub fn try_spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, MetaCacheError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(MetaCacheError::ExecutorShutdown {
                pool: self.name.clone(),
            });
        }

        let admission = match self.role {
            PoolRole::Primary => self.admission.clone().try_acquire_owned().map(Admission::Queued),
            PoolRole::Checkpoint => self.workers.clone().try_acquire_owned().map(Admission::Running),
        };
        let admission = match admission {
            Ok(a) => a,
            Err(_) => {
                self.metrics.task_rejected();
                tracing::debug!(pool = %self.name, "Executor pool saturated, task rejected");
                return Err(MetaCacheError::ExecutorSaturated {
                    pool: self.name.clone(),
                });
            }
        };

        self.metrics.task_queued();
        let mut guard = TaskGuard {
            metrics: self.metrics.clone(),
            started: false,
        };
        let workers = self.workers.clone();

        Ok(self.handle.spawn(async move {
            let _permits = match admission {
                Admission::Queued(slot) => {
                    let worker = workers.acquire_owned().await.ok();
                    (Some(slot), worker)
                }
                Admission::Running(worker) => (None, Some(worker)),
            };
            guard.start();
            task.await
        }))
    }

    /// Stop the pool without waiting for queued or running tasks.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            tracing::info!(pool = %self.name, "Executor pool shut down");
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The four pools owned by the cache manager.
#[derive(Debug, Clone)]
pub struct ExecutorPools {
    /// Row-count cache loads; results may be ignored on miss or saturation.
    pub row_count_refresh: Arc<ExecutorPool>,
    /// Asynchronous refresh of every synchronously loading cache.
    pub common_refresh: Arc<ExecutorPool>,
    /// Directory listing, kept apart because it is slow and bursty.
    pub file_listing: Arc<ExecutorPool>,
    /// Split scheduling; may itself submit to `file_listing`.
    pub schedule: Arc<ExecutorPool>,
}

impl ExecutorPools {
    pub fn new(
        config: &MetaCacheConfig,
        is_checkpoint: bool,
        registry: &MetricRegistry,
    ) -> Result<Self> {
        let n = config.max_external_cache_loader_thread_pool_size;
        let pools = &config.pools;
        let pool = |name: &str, queue_factor: usize, idle_secs: u64| {
            new_thread_pool(
                is_checkpoint,
                n,
                n.saturating_mul(queue_factor),
                name,
                idle_secs,
                Some(registry),
            )
            .map(Arc::new)
        };

        Ok(Self {
            row_count_refresh: pool(
                ROW_COUNT_REFRESH_POOL,
                pools.row_count_queue_factor,
                pools.row_count_idle_timeout_secs,
            )?,
            common_refresh: pool(
                COMMON_REFRESH_POOL,
                pools.common_refresh_queue_factor,
                pools.idle_timeout_secs,
            )?,
            file_listing: pool(
                FILE_LISTING_POOL,
                pools.file_listing_queue_factor,
                pools.idle_timeout_secs,
            )?,
            schedule: pool(
                SCHEDULE_POOL,
                pools.schedule_queue_factor,
                pools.idle_timeout_secs,
            )?,
        })
    }

    pub fn shutdown(&self) {
        self.row_count_refresh.shutdown();
        self.common_refresh.shutdown();
        self.file_listing.shutdown();
        self.schedule.shutdown();
    }
}
