//! 任务链调度器
//!
//! 提交队列长度不设限，但排队链引用的实例总大小有界，超出时
//! 提交方被阻塞。取消标志在任务之间检查，不打断正在执行的任务。

use crate::job::{ChainStatus, JobChain, JobCommand};
use medvault_core::{ArchiveError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ChainState {
    status: ChainStatus,
    cancel: Arc<AtomicBool>,
}

/// 有界并行的链执行器
pub struct JobScheduler {
    semaphore: Arc<Semaphore>,
    states: Arc<Mutex<HashMap<String, ChainState>>>,
    queued_bytes: Arc<Mutex<u64>>,
    queue_released: Arc<Notify>,
    max_queued_bytes: u64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    /// `parallel_limit` 条链同时执行；`max_queued_bytes` 为排队链
    /// 引用实例大小的上限，0 表示不限制
    pub fn new(parallel_limit: usize, max_queued_bytes: u64) -> Self {
        JobScheduler {
            semaphore: Arc::new(Semaphore::new(parallel_limit.max(1))),
            states: Arc::new(Mutex::new(HashMap::new())),
            queued_bytes: Arc::new(Mutex::new(0)),
            queue_released: Arc::new(Notify::new()),
            max_queued_bytes,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 提交一条链；聚合大小超限时在此阻塞直到队列腾出空间
    pub async fn submit(&self, chain: JobChain) -> Result<String> {
        let (id, description, jobs, initial_inputs, payload_size) = chain.into_parts();

        if self.max_queued_bytes > 0 && payload_size > 0 {
            loop {
                // 先注册等待者再检查条件，避免错过释放通知
                let released = self.queue_released.notified();
                {
                    let mut queued = self.queued_bytes.lock().await;
                    // 空队列永远放行，避免单条超大链自锁
                    if *queued == 0 || *queued + payload_size <= self.max_queued_bytes {
                        *queued += payload_size;
                        break;
                    }
                }
                released.await;
            }
        }

        let cancel = Arc::new(AtomicBool::new(false));
        self.states.lock().await.insert(
            id.clone(),
            ChainState {
                status: ChainStatus::Pending,
                cancel: cancel.clone(),
            },
        );

        let semaphore = self.semaphore.clone();
        let states = self.states.clone();
        let queued_bytes = self.queued_bytes.clone();
        let queue_released = self.queue_released.clone();
        let chain_id = id.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                // 调度器已关闭
                set_status(&states, &chain_id, ChainStatus::Cancelled).await;
                return;
            };
            set_status(&states, &chain_id, ChainStatus::Running).await;
            debug!("chain {} ({}) started", chain_id, description);

            let final_status = run_chain(&chain_id, &jobs, initial_inputs, &cancel).await;
            set_status(&states, &chain_id, final_status).await;
            info!("chain {} finished with {:?}", chain_id, final_status);

            if payload_size > 0 {
                let mut queued = queued_bytes.lock().await;
                *queued = queued.saturating_sub(payload_size);
                queue_released.notify_waiters();
            }
        });
        self.handles.lock().await.push(handle);

        Ok(id)
    }

    /// 置取消标志；链在下一个任务边界停下并报告 Cancelled
    pub async fn cancel(&self, chain_id: &str) -> Result<()> {
        let states = self.states.lock().await;
        match states.get(chain_id) {
            Some(state) => {
                state.cancel.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ArchiveError::InexistentItem(chain_id.to_string())),
        }
    }

    pub async fn status(&self, chain_id: &str) -> Option<ChainStatus> {
        self.states.lock().await.get(chain_id).map(|s| s.status)
    }

    /// 等待所有已提交的链结束
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn set_status(states: &Mutex<HashMap<String, ChainState>>, id: &str, status: ChainStatus) {
    if let Some(state) = states.lock().await.get_mut(id) {
        state.status = status;
    }
}

async fn run_chain(
    chain_id: &str,
    jobs: &[Arc<dyn JobCommand>],
    initial_inputs: Vec<String>,
    cancel: &AtomicBool,
) -> ChainStatus {
    let mut inputs = initial_inputs;

    for job in jobs {
        if cancel.load(Ordering::SeqCst) {
            info!("chain {} cancelled before '{}'", chain_id, job.description());
            return ChainStatus::Cancelled;
        }

        match job.apply(inputs).await {
            Ok(outputs) => inputs = outputs,
            Err(e) if job.ignore_failures() => {
                warn!(
                    "chain {}: job '{}' failed but is tolerated: {}",
                    chain_id,
                    job.description(),
                    e
                );
                inputs = Vec::new();
            }
            Err(e) => {
                warn!("chain {}: job '{}' failed: {}", chain_id, job.description(), e);
                return ChainStatus::Failed;
            }
        }
    }

    ChainStatus::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Append {
        marker: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl JobCommand for Append {
        async fn apply(&self, inputs: Vec<String>) -> Result<Vec<String>> {
            self.log.lock().await.push(self.marker.clone());
            Ok(inputs
                .into_iter()
                .map(|i| format!("{i}>{}", self.marker))
                .collect())
        }

        fn description(&self) -> &str {
            &self.marker
        }
    }

    struct Failing {
        tolerated: bool,
    }

    #[async_trait]
    impl JobCommand for Failing {
        async fn apply(&self, _inputs: Vec<String>) -> Result<Vec<String>> {
            Err(ArchiveError::NetworkProtocol("peer refused".to_string()))
        }

        fn ignore_failures(&self) -> bool {
            self.tolerated
        }
    }

    struct Slow;

    #[async_trait]
    impl JobCommand for Slow {
        async fn apply(&self, inputs: Vec<String>) -> Result<Vec<String>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(inputs)
        }
    }

    #[tokio::test]
    async fn test_outputs_feed_next_job() {
        let scheduler = JobScheduler::new(2, 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = JobChain::new("two steps")
            .with_inputs(vec!["seed".to_string()])
            .add_command(Arc::new(Append {
                marker: "a".to_string(),
                log: log.clone(),
            }))
            .add_command(Arc::new(Append {
                marker: "b".to_string(),
                log: log.clone(),
            }));
        let id = scheduler.submit(chain).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Done));
        assert_eq!(*log.lock().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let scheduler = JobScheduler::new(2, 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = JobChain::new("failing")
            .add_command(Arc::new(Failing { tolerated: false }))
            .add_command(Arc::new(Append {
                marker: "never".to_string(),
                log: log.clone(),
            }));
        let id = scheduler.submit(chain).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Failed));
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_failure_continues() {
        let scheduler = JobScheduler::new(2, 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = JobChain::new("tolerant")
            .add_command(Arc::new(Failing { tolerated: true }))
            .add_command(Arc::new(Append {
                marker: "after".to_string(),
                log: log.clone(),
            }));
        let id = scheduler.submit(chain).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Done));
        assert_eq!(*log.lock().await, vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_between_jobs() {
        let scheduler = JobScheduler::new(1, 0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let chain = JobChain::new("cancel me")
            .add_command(Arc::new(Slow))
            .add_command(Arc::new(Append {
                marker: "skipped".to_string(),
                log: log.clone(),
            }));
        let id = scheduler.submit(chain).await.unwrap();
        scheduler.cancel(&id).await.unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Cancelled));
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_chain() {
        let scheduler = JobScheduler::new(1, 0);
        assert!(scheduler.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_independent_chains_run_in_parallel() {
        let scheduler = JobScheduler::new(4, 0);
        let mut ids = Vec::new();
        for i in 0..4 {
            let chain = JobChain::new(format!("chain {i}")).add_command(Arc::new(Slow));
            ids.push(scheduler.submit(chain).await.unwrap());
        }

        let started = std::time::Instant::now();
        scheduler.shutdown().await;
        // 四条链并行，总耗时远小于串行的 200ms
        assert!(started.elapsed() < Duration::from_millis(180));
        for id in ids {
            assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Done));
        }
    }

    #[tokio::test]
    async fn test_submission_backpressure_by_size() {
        let scheduler = Arc::new(JobScheduler::new(1, 10));

        let first = JobChain::new("big")
            .with_payload_size(8)
            .add_command(Arc::new(Slow));
        scheduler.submit(first).await.unwrap();

        // 第二条链超出聚合上限，提交会阻塞到第一条链完成
        let second = JobChain::new("blocked")
            .with_payload_size(8)
            .add_command(Arc::new(Slow));
        let started = std::time::Instant::now();
        let scheduler_clone = scheduler.clone();
        let id = tokio::time::timeout(Duration::from_secs(5), async move {
            scheduler_clone.submit(second).await.unwrap()
        })
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));

        scheduler.shutdown().await;
        assert_eq!(scheduler.status(&id).await, Some(ChainStatus::Done));
    }
}
