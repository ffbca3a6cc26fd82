//! 可复用的远端DICOM连接池与转发任务
//!
//! 连接按 `(aet, host, port)` 入池，惰性建立，空闲超过 `close_delay`
//! 后由清理任务关闭。每个池项一把互斥锁串行使用；协议错误时丢弃
//! 连接，下次使用时重建。

use async_trait::async_trait;
use medvault_core::{ArchiveError, ContentType, ResourceLevel, Result};
use medvault_dicom::tags;
use medvault_index::IndexStore;
use medvault_jobs::JobCommand;
use medvault_storage::StorageAccessor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 远端节点标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerConfig {
    pub aet: String,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.aet, self.host, self.port)
    }
}

/// 一条已建立的出站关联（DICOM线协议由协作方实现）
#[async_trait]
pub trait PeerTransport: Send {
    /// 通过该关联发送一个DICOM实例
    async fn store(&mut self, instance: &[u8]) -> Result<()>;
}

/// 出站关联的工厂，由协议栈协作方注入
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn connect(&self, local_aet: &str, peer: &PeerConfig) -> Result<Box<dyn PeerTransport>>;
}

struct PoolEntry {
    connection: Mutex<Option<Box<dyn PeerTransport>>>,
    last_use: StdMutex<Instant>,
}

/// 进程级连接池
pub struct PeerPool {
    local_aet: String,
    factory: Arc<dyn PeerTransportFactory>,
    entries: StdMutex<HashMap<PeerConfig, Arc<PoolEntry>>>,
    close_delay: Duration,
    shutdown: watch::Sender<bool>,
    janitor: StdMutex<Option<JoinHandle<()>>>,
}

impl PeerPool {
    pub fn new(
        local_aet: impl Into<String>,
        factory: Arc<dyn PeerTransportFactory>,
        close_delay: Duration,
    ) -> Arc<Self> {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let pool = Arc::new(PeerPool {
            local_aet: local_aet.into(),
            factory,
            entries: StdMutex::new(HashMap::new()),
            close_delay,
            shutdown,
            janitor: StdMutex::new(None),
        });

        // 清理任务：周期性关闭空闲连接
        let weak = Arc::downgrade(&pool);
        let tick = close_delay.min(Duration::from_millis(500)).max(Duration::from_millis(20));
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown_rx.changed() => break,
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.close_idle();
            }
        });
        *pool.janitor.lock().unwrap() = Some(handle);

        pool
    }

    fn entry(&self, peer: &PeerConfig) -> Arc<PoolEntry> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(peer.clone())
            .or_insert_with(|| {
                Arc::new(PoolEntry {
                    connection: Mutex::new(None),
                    last_use: StdMutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// 经池中的关联发送一个实例，必要时惰性建连
    pub async fn store_instance(&self, peer: &PeerConfig, instance: &[u8]) -> Result<()> {
        let entry = self.entry(peer);
        let mut connection = entry.connection.lock().await;

        if connection.is_none() {
            info!("opening association to {}", peer);
            *connection = Some(self.factory.connect(&self.local_aet, peer).await?);
        } else {
            debug!("reusing association to {}", peer);
        }
        *entry.last_use.lock().unwrap() = Instant::now();

        match connection.as_mut().expect("connection just ensured").store(instance).await {
            Ok(()) => {
                *entry.last_use.lock().unwrap() = Instant::now();
                Ok(())
            }
            Err(e) => {
                // 协议错误：丢弃连接，下次重建
                warn!("association to {} failed, discarding: {}", peer, e);
                *connection = None;
                Err(e)
            }
        }
    }

    /// 关闭空闲超时的连接；忙碌的池项跳过
    fn close_idle(&self) {
        let entries: Vec<(PeerConfig, Arc<PoolEntry>)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (peer, entry) in entries {
            let idle = entry.last_use.lock().unwrap().elapsed();
            if idle < self.close_delay {
                continue;
            }
            if let Ok(mut connection) = entry.connection.try_lock() {
                if connection.take().is_some() {
                    info!("closing idle association to {}", peer);
                }
            }
        }
    }

    /// 当前持有活动连接的池项数，主要供测试观察
    pub async fn open_connections(&self) -> usize {
        let entries: Vec<Arc<PoolEntry>> =
            self.entries.lock().unwrap().values().cloned().collect();
        let mut open = 0;
        for entry in entries {
            if entry.connection.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }

    /// 停止清理任务并断开所有连接
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.janitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let entries: Vec<Arc<PoolEntry>> =
            self.entries.lock().unwrap().values().cloned().collect();
        for entry in entries {
            entry.connection.lock().await.take();
        }
    }
}

/// 实例转发任务：输入是实例公开ID，输出是成功转发的那部分
///
/// 单个实例的失败被容忍（记录后跳过），符合批量转发的预期。
pub struct StorePeerCommand {
    index: Arc<IndexStore>,
    storage: Arc<StorageAccessor>,
    pool: Arc<PeerPool>,
    peer: PeerConfig,
}

impl StorePeerCommand {
    pub fn new(
        index: Arc<IndexStore>,
        storage: Arc<StorageAccessor>,
        pool: Arc<PeerPool>,
        peer: PeerConfig,
    ) -> Self {
        StorePeerCommand {
            index,
            storage,
            pool,
            peer,
        }
    }

    async fn forward_one(&self, public_id: &str) -> Result<()> {
        let Some((instance_id, ResourceLevel::Instance)) =
            self.index.lookup_resource(public_id).await?
        else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        let Some(attachment) = self
            .index
            .lookup_attachment(instance_id, ContentType::Dicom)
            .await?
        else {
            return Err(ArchiveError::InexistentFile(public_id.to_string()));
        };

        let bytes = self.storage.read(&attachment, true).await?;
        self.pool.store_instance(&self.peer, &bytes).await?;

        // 导出审计：沿父链收齐四个标识符
        let mut patient_id = String::new();
        let mut study_uid = String::new();
        let mut series_uid = String::new();
        let mut sop_uid = String::new();
        let mut current = Some(instance_id);
        while let Some(id) = current {
            let map = self.index.get_main_tags(id).await?;
            if let Some(v) = map.value_str(tags::PATIENT_ID) {
                patient_id = v.to_string();
            }
            if let Some(v) = map.value_str(tags::STUDY_INSTANCE_UID) {
                study_uid = v.to_string();
            }
            if let Some(v) = map.value_str(tags::SERIES_INSTANCE_UID) {
                series_uid = v.to_string();
            }
            if let Some(v) = map.value_str(tags::SOP_INSTANCE_UID) {
                sop_uid = v.to_string();
            }
            current = self.index.lookup_parent(id).await?;
        }
        self.index
            .log_exported(
                ResourceLevel::Instance,
                public_id,
                &self.peer.aet,
                &patient_id,
                &study_uid,
                &series_uid,
                &sop_uid,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobCommand for StorePeerCommand {
    async fn apply(&self, inputs: Vec<String>) -> Result<Vec<String>> {
        let mut forwarded = Vec::with_capacity(inputs.len());
        for public_id in inputs {
            match self.forward_one(&public_id).await {
                Ok(()) => forwarded.push(public_id),
                Err(e) => {
                    warn!("forwarding {} to {} failed: {}", public_id, self.peer, e);
                }
            }
        }
        Ok(forwarded)
    }

    fn ignore_failures(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "store-peer"
    }
}
