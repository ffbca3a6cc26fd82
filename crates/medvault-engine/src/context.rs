//! 归档上下文
//!
//! 所有进程级状态（索引、存储、总线、缓存、调度器、连接池）都由
//! 显式的上下文句柄持有，经 `initialize` 建立、`finalize` 拆除，
//! 没有隐藏的单例。

use crate::cache::{DatasetGuard, DatasetProvider, DicomCache};
use crate::listener::{ArchiveListener, ChangeDispatcher, ListenerBus};
use crate::lookup::{LookupEngine, Query};
use crate::peers::{PeerConfig, PeerPool, PeerTransportFactory, StorePeerCommand};
use async_trait::async_trait;
use medvault_core::{
    ArchiveConfig, ArchiveError, AttachmentInfo, ChangeRecord, ContentType, DeletionReport,
    ExportedResource, GlobalCounters, MetadataKind, ResourceLevel, Result,
};
use medvault_dicom::json::display_name;
use medvault_dicom::parser::{self, Dataset};
use medvault_index::{IndexStore, RecyclingQuotas};
use medvault_jobs::{JobChain, JobScheduler};
use medvault_storage::{FilesystemBlobStore, StorageAccessor};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 缓存未命中时读取Dicom附件并解析
struct ContextDatasetProvider {
    index: Arc<IndexStore>,
    storage: Arc<StorageAccessor>,
}

#[async_trait]
impl DatasetProvider for ContextDatasetProvider {
    async fn load(&self, public_id: &str) -> Result<Dataset> {
        let Some((id, ResourceLevel::Instance)) = self.index.lookup_resource(public_id).await?
        else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        let Some(attachment) = self.index.lookup_attachment(id, ContentType::Dicom).await? else {
            return Err(ArchiveError::InexistentFile(public_id.to_string()));
        };
        let bytes = self.storage.read(&attachment, true).await?;
        parser::parse(&bytes)
    }
}

/// 归档核心的上下文句柄
pub struct ArchiveContext {
    config: ArchiveConfig,
    index: Arc<IndexStore>,
    storage: Arc<StorageAccessor>,
    bus: Arc<ListenerBus>,
    dispatcher: ChangeDispatcher,
    cache: Arc<DicomCache>,
    scheduler: Arc<JobScheduler>,
    peers: Arc<PeerPool>,
}

impl ArchiveContext {
    /// 建立上下文：打开索引与存储、启动分发任务，并做一次独立
    /// 回收，使收紧的配额在第一次入库前生效
    pub async fn initialize(
        config: ArchiveConfig,
        transports: Arc<dyn PeerTransportFactory>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root).await?;

        let index = Arc::new(IndexStore::open(config.index_path.as_deref()).await?);
        let blob_store = Arc::new(FilesystemBlobStore::new(&config.storage_root));
        let compression = if config.compression {
            medvault_core::CompressionKind::Zlib
        } else {
            medvault_core::CompressionKind::None
        };
        let storage = Arc::new(StorageAccessor::new(blob_store, compression, config.store_md5));

        let bus = Arc::new(ListenerBus::new());
        let dispatcher = ChangeDispatcher::start(bus.clone());
        let cache = Arc::new(DicomCache::new(
            config.dicom_cache_capacity,
            Arc::new(ContextDatasetProvider {
                index: index.clone(),
                storage: storage.clone(),
            }),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            config.job_limit,
            config.job_queue_size_limit,
        ));
        let peers = PeerPool::new(
            config.local_aet.clone(),
            transports,
            Duration::from_secs(config.peer_close_delay_secs),
        );

        let context = ArchiveContext {
            config,
            index,
            storage,
            bus,
            dispatcher,
            cache,
            scheduler,
            peers,
        };

        // 启动回收：存量超出配额时先清到界内
        let report = context
            .index
            .standalone_recycling(&context.quotas())
            .await?;
        for attachment in &report.recycled_attachments {
            let _ = context.storage.remove(&attachment.uuid).await;
        }
        for public_id in &report.recycled_instances {
            context.cache.invalidate(public_id).await;
        }
        for change in report.changes {
            context.dispatcher.publish(change).await;
        }

        info!(
            "archive context ready (aet '{}', compression {})",
            context.config.local_aet,
            if context.config.compression { "zlib" } else { "none" }
        );
        Ok(context)
    }

    /// 拆除上下文：等待任务链结束、排空变更队列、断开远端连接
    pub async fn finalize(self) {
        let ArchiveContext {
            dispatcher,
            scheduler,
            peers,
            ..
        } = self;
        scheduler.shutdown().await;
        dispatcher.stop().await;
        peers.shutdown().await;
        info!("archive context finalized");
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    pub fn storage(&self) -> &Arc<StorageAccessor> {
        &self.storage
    }

    pub fn bus(&self) -> &Arc<ListenerBus> {
        &self.bus
    }

    pub(crate) fn dispatcher(&self) -> &ChangeDispatcher {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<DicomCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn peers(&self) -> &Arc<PeerPool> {
        &self.peers
    }

    pub(crate) fn quotas(&self) -> RecyclingQuotas {
        RecyclingQuotas {
            max_patient_count: self.config.max_patient_count,
            max_storage_size: self.config.max_storage_size,
        }
    }

    /// 以名字注册监听者
    pub fn register_listener(&self, name: &str, listener: Arc<dyn ArchiveListener>) {
        self.bus.register(name, listener);
    }

    pub fn unregister_listener(&self, name: &str) -> bool {
        self.bus.unregister(name)
    }

    /// 级联删除一个资源
    ///
    /// 提交后移除对应Blob、同步缓存失效并分发 `Deleted` 变更。
    pub async fn delete_resource(
        &self,
        public_id: &str,
        expected_level: Option<ResourceLevel>,
    ) -> Result<Option<DeletionReport>> {
        let Some(report) = self.index.delete_resource(public_id, expected_level).await? else {
            return Ok(None);
        };

        for attachment in &report.deleted_attachments {
            let _ = self.storage.remove(&attachment.uuid).await;
        }
        for instance in &report.deleted_instances {
            self.cache.invalidate(instance).await;
        }
        self.dispatcher.publish(report.change.clone()).await;
        Ok(Some(report))
    }

    /// 资源的JSON视图：类型、父子关系、主标签与层级附加信息
    pub async fn get_resource(&self, public_id: &str) -> Result<Option<Value>> {
        let Some((id, level)) = self.index.lookup_resource(public_id).await? else {
            return Ok(None);
        };

        let mut result = Map::new();
        result.insert("ID".to_string(), json!(public_id));
        result.insert("Type".to_string(), json!(level.as_str()));

        if level != ResourceLevel::Patient {
            if let Some(parent) = self.index.lookup_parent(id).await? {
                let parent_public = self.index.get_public_id(parent).await?;
                let key = match level {
                    ResourceLevel::Study => "ParentPatient",
                    ResourceLevel::Series => "ParentStudy",
                    _ => "ParentSeries",
                };
                result.insert(key.to_string(), json!(parent_public));
            }
        }

        if level != ResourceLevel::Instance {
            let children = self.index.get_children_public_ids(id).await?;
            let key = match level {
                ResourceLevel::Patient => "Studies",
                ResourceLevel::Study => "Series",
                _ => "Instances",
            };
            result.insert(key.to_string(), json!(children));
        }

        let mut main_tags = Map::new();
        for (tag, value) in self.index.get_main_tags(id).await?.iter() {
            main_tags.insert(
                display_name(*tag),
                value.as_str().map(|s| json!(s)).unwrap_or(Value::Null),
            );
        }
        result.insert("MainDicomTags".to_string(), Value::Object(main_tags));

        match level {
            ResourceLevel::Series => {
                let status = self.index.series_status(id).await?;
                result.insert("Status".to_string(), json!(status.as_str()));
                let expected = self
                    .index
                    .get_metadata(id, MetadataKind::ExpectedInstanceCount)
                    .await?
                    .and_then(|s| s.parse::<i64>().ok());
                result.insert(
                    "ExpectedNumberOfInstances".to_string(),
                    expected.map(|v| json!(v)).unwrap_or(Value::Null),
                );
            }
            ResourceLevel::Instance => {
                let Some(attachment) = self.index.lookup_attachment(id, ContentType::Dicom).await?
                else {
                    return Err(ArchiveError::internal(format!(
                        "instance {public_id} has no DICOM attachment"
                    )));
                };
                result.insert("FileSize".to_string(), json!(attachment.uncompressed_size));
                result.insert("FileUuid".to_string(), json!(attachment.uuid));
                let index_in_series = self
                    .index
                    .get_metadata(id, MetadataKind::IndexInSeries)
                    .await?
                    .and_then(|s| s.parse::<i64>().ok());
                result.insert(
                    "IndexInSeries".to_string(),
                    index_in_series.map(|v| json!(v)).unwrap_or(Value::Null),
                );
            }
            _ => {}
        }

        for (kind, key) in [
            (MetadataKind::AnonymizedFrom, "AnonymizedFrom"),
            (MetadataKind::ModifiedFrom, "ModifiedFrom"),
        ] {
            if let Some(value) = self.index.get_metadata(id, kind).await? {
                result.insert(key.to_string(), json!(value));
            }
        }

        Ok(Some(Value::Object(result)))
    }

    /// 结构化检索
    pub async fn find(&self, query: &Query) -> Result<Vec<String>> {
        LookupEngine::new(&self.index, &self.storage).find(query).await
    }

    pub async fn read_changes(&self, since: u64, limit: usize) -> Result<(Vec<ChangeRecord>, bool)> {
        self.index.read_changes(since, limit).await
    }

    pub async fn read_exported(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<(Vec<ExportedResource>, bool)> {
        self.index.read_exported(since, limit).await
    }

    pub async fn global_counters(&self) -> Result<GlobalCounters> {
        self.index.global_counters().await
    }

    pub async fn list_resources(&self, level: ResourceLevel) -> Result<Vec<String>> {
        self.index.list_resources(level).await
    }

    pub async fn get_child_instances(&self, public_id: &str) -> Result<Vec<String>> {
        self.index.get_child_instances(public_id).await
    }

    /// 父资源的公开ID；患者层返回None
    pub async fn lookup_parent(&self, public_id: &str) -> Result<Option<String>> {
        let Some((id, _)) = self.index.lookup_resource(public_id).await? else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        match self.index.lookup_parent(id).await? {
            Some(parent) => Ok(Some(self.index.get_public_id(parent).await?)),
            None => Ok(None),
        }
    }

    pub async fn set_protected(&self, patient_public_id: &str, protected: bool) -> Result<()> {
        self.index.set_protected(patient_public_id, protected).await
    }

    pub async fn is_protected(&self, patient_public_id: &str) -> Result<bool> {
        self.index.is_protected(patient_public_id).await
    }

    /// 读取资源的某个附件
    pub async fn read_attachment(
        &self,
        public_id: &str,
        content_type: ContentType,
        decompress: bool,
    ) -> Result<Vec<u8>> {
        let Some((id, _)) = self.index.lookup_resource(public_id).await? else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        let Some(attachment) = self.index.lookup_attachment(id, content_type).await? else {
            return Err(ArchiveError::InexistentFile(public_id.to_string()));
        };
        self.storage.read(&attachment, decompress).await
    }

    /// 实例的完整JSON投影（入库时写下的 DicomAsJson 附件）
    pub async fn get_instance_json(&self, public_id: &str) -> Result<Value> {
        let bytes = self
            .read_attachment(public_id, ContentType::DicomAsJson, true)
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| ArchiveError::CorruptedFile(e.to_string()))
    }

    /// 给已有资源挂载一个附件，登记失败时不留孤儿Blob
    pub async fn add_attachment(
        &self,
        public_id: &str,
        content_type: ContentType,
        data: &[u8],
    ) -> Result<AttachmentInfo> {
        let Some((id, _)) = self.index.lookup_resource(public_id).await? else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        if self.index.lookup_attachment(id, content_type).await?.is_some() {
            return Err(ArchiveError::BadRequest(format!(
                "resource {public_id} already has an attachment of this type"
            )));
        }

        let info = self.storage.write(data, content_type).await?;
        if let Err(e) = self.index.add_attachment(id, &info).await {
            let _ = self.storage.remove(&info.uuid).await;
            return Err(e);
        }
        Ok(info)
    }

    /// 经缓存访问已解析的实例数据集；凭据存续期间独占缓存
    pub async fn access_instance(&self, public_id: &str) -> Result<DatasetGuard<'_>> {
        self.cache.access(public_id).await
    }

    /// 提交一条向远端节点转发实例的任务链
    pub async fn submit_forward(
        &self,
        peer: PeerConfig,
        instance_ids: Vec<String>,
    ) -> Result<String> {
        let mut payload_size = 0u64;
        for public_id in &instance_ids {
            if let Some((id, _)) = self.index.lookup_resource(public_id).await? {
                if let Some(attachment) =
                    self.index.lookup_attachment(id, ContentType::Dicom).await?
                {
                    payload_size += attachment.compressed_size;
                }
            }
        }

        let command = StorePeerCommand::new(
            self.index.clone(),
            self.storage.clone(),
            self.peers.clone(),
            peer.clone(),
        );
        let chain = JobChain::new(format!("forward {} instances to {}", instance_ids.len(), peer))
            .with_inputs(instance_ids)
            .with_payload_size(payload_size)
            .add_command(Arc::new(command));
        self.scheduler.submit(chain).await
    }
}
