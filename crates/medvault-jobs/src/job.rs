//! 任务与任务链模型

use async_trait::async_trait;
use medvault_core::Result;
use std::sync::Arc;
use uuid::Uuid;

/// 链中的一个任务
///
/// 任务 N 的输出是任务 N+1 的输入。`ignore_failures` 为真的任务
/// 失败时不打断链（转发类任务用它容忍单个实例的失败）。
#[async_trait]
pub trait JobCommand: Send + Sync {
    async fn apply(&self, inputs: Vec<String>) -> Result<Vec<String>>;

    fn ignore_failures(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "job"
    }
}

/// 任务链的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// 一条顺序执行的任务链
pub struct JobChain {
    id: String,
    description: String,
    jobs: Vec<Arc<dyn JobCommand>>,
    initial_inputs: Vec<String>,
    payload_size: u64,
}

impl JobChain {
    pub fn new(description: impl Into<String>) -> Self {
        JobChain {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            jobs: Vec::new(),
            initial_inputs: Vec::new(),
            payload_size: 0,
        }
    }

    /// 追加一个任务，调用顺序即执行顺序
    pub fn add_command(mut self, job: Arc<dyn JobCommand>) -> Self {
        self.jobs.push(job);
        self
    }

    /// 第一个任务的输入
    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.initial_inputs = inputs;
        self
    }

    /// 链引用的实例总大小，参与提交队列的背压计算
    pub fn with_payload_size(mut self, bytes: u64) -> Self {
        self.payload_size = bytes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub(crate) fn into_parts(self) -> (String, String, Vec<Arc<dyn JobCommand>>, Vec<String>, u64) {
        (
            self.id,
            self.description,
            self.jobs,
            self.initial_inputs,
            self.payload_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl JobCommand for Echo {
        async fn apply(&self, inputs: Vec<String>) -> Result<Vec<String>> {
            Ok(inputs)
        }
    }

    #[test]
    fn test_chain_builder() {
        let chain = JobChain::new("forward study")
            .add_command(Arc::new(Echo))
            .with_inputs(vec!["a".to_string()])
            .with_payload_size(42);
        assert_eq!(chain.description(), "forward study");
        assert_eq!(chain.payload_size(), 42);
        assert_eq!(chain.id().len(), 36);
    }
}
