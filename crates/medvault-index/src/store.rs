//! 层级索引的事务性操作
//!
//! 所有写操作在进程级写锁下以单个SQLite事务执行。入库、级联删除
//! 与配额回收共用同一事务，保证索引与计数在任何提交点都一致。

use chrono::Utc;
use medvault_core::utils::{generate_uuid, now_iso8601};
use medvault_core::{
    ArchiveError, AttachmentInfo, ChangeKind, ChangeRecord, CompressionKind, ContentType,
    DeletionReport, GlobalCounters, MetadataKind, ResourceLevel, Result, SeriesStatus,
    StoreStatus,
};
use medvault_dicom::hasher::InstanceIdentity;
use medvault_dicom::map::{DicomMap, DicomValue};
use medvault_dicom::tags::{self, DicomTag};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::IndexConnection;

type Tx = Transaction<'static, Sqlite>;

fn db_err(e: sqlx::Error) -> ArchiveError {
    ArchiveError::Database(e.to_string())
}

/// 回收配额，0 表示不限制
#[derive(Debug, Clone, Copy, Default)]
pub struct RecyclingQuotas {
    pub max_patient_count: u64,
    pub max_storage_size: u64,
}

impl RecyclingQuotas {
    fn violated(&self, counters: &GlobalCounters) -> bool {
        (self.max_patient_count > 0 && counters.patient_count > self.max_patient_count)
            || (self.max_storage_size > 0 && counters.compressed_total > self.max_storage_size)
    }
}

/// 待入库实例的索引视图
#[derive(Debug, Clone)]
pub struct InstanceToIndex {
    pub identity: InstanceIdentity,
    pub summary: DicomMap,
    pub attachments: Vec<AttachmentInfo>,
    pub remote_aet: String,
}

/// 入库事务的结果
#[derive(Debug, Clone)]
pub struct StoreReport {
    pub status: StoreStatus,
    pub instance_public_id: String,
    /// 本事务写入的变更记录（按提交顺序）
    pub changes: Vec<ChangeRecord>,
    /// 因回收而待删除的Blob
    pub recycled_attachments: Vec<AttachmentInfo>,
    /// 因回收而消失的实例公开ID
    pub recycled_instances: Vec<String>,
}

/// 子树删除在事务内收集到的内容
struct SubtreeDeletion {
    attachments: Vec<AttachmentInfo>,
    instance_public_ids: Vec<String>,
}

/// 层级索引存储
pub struct IndexStore {
    connection: IndexConnection,
    write_lock: Mutex<()>,
}

impl IndexStore {
    pub fn new(connection: IndexConnection) -> Self {
        IndexStore {
            connection,
            write_lock: Mutex::new(()),
        }
    }

    /// 打开文件数据库（None 表示内存库）
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let connection = match path {
            Some(p) => IndexConnection::open(p).await?,
            None => IndexConnection::open_in_memory().await?,
        };
        Ok(IndexStore::new(connection))
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.connection.pool()
    }

    pub(crate) fn raw_pool(&self) -> &sqlx::SqlitePool {
        self.connection.pool()
    }

    // ========== 入库 ==========

    /// 将一个实例连同其祖先物化进索引
    ///
    /// 幂等：实例已存在时仅刷新 LastUpdate 并返回 AlreadyStored。
    /// 配额超限时在同一事务内回收最久未访问的非保护患者；无候选
    /// 时整个事务回滚并返回 `FullStorage`。
    pub async fn store_instance(
        &self,
        instance: &InstanceToIndex,
        quotas: &RecyclingQuotas,
    ) -> Result<StoreReport> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        let identity = &instance.identity;

        // 已入库的实例：刷新时间戳即可
        if let Some((existing, level)) = lookup_resource_tx(&mut tx, &identity.sop_uid).await? {
            if level != ResourceLevel::Instance {
                return Err(ArchiveError::internal(format!(
                    "public id {} already used at level {}",
                    identity.sop_uid, level
                )));
            }
            touch_last_update_tx(&mut tx, existing).await?;
            tx.commit().await.map_err(db_err)?;
            return Ok(StoreReport {
                status: StoreStatus::AlreadyStored,
                instance_public_id: identity.sop_uid.clone(),
                changes: Vec::new(),
                recycled_attachments: Vec::new(),
                recycled_instances: Vec::new(),
            });
        }

        let mut changes = Vec::new();

        // 自顶向下物化祖先，保证变更顺序为 患者→检查→系列→实例
        let patient = match lookup_identifier_tx(
            &mut tx,
            tags::PATIENT_ID,
            &identity.patient_id,
            ResourceLevel::Patient,
        )
        .await?
        .into_iter()
        .next()
        {
            Some(id) => id,
            None => {
                let public_id = generate_uuid();
                let id = create_resource_tx(&mut tx, &public_id, ResourceLevel::Patient, None)
                    .await?;
                set_main_tags_tx(
                    &mut tx,
                    id,
                    &instance.summary.extract(ResourceLevel::Patient),
                )
                .await?;
                set_identifiers_tx(&mut tx, id, ResourceLevel::Patient, identity, &instance.summary).await?;
                enroll_recycling_tx(&mut tx, id).await?;
                changes
                    .push(log_change_tx(&mut tx, ChangeKind::NewPatient, ResourceLevel::Patient, &public_id).await?);
                id
            }
        };

        let study = match lookup_resource_tx(&mut tx, &identity.study_uid).await? {
            Some((id, ResourceLevel::Study)) => id,
            Some((_, level)) => {
                return Err(ArchiveError::internal(format!(
                    "study uid {} already used at level {}",
                    identity.study_uid, level
                )))
            }
            None => {
                let id = create_resource_tx(
                    &mut tx,
                    &identity.study_uid,
                    ResourceLevel::Study,
                    Some(patient),
                )
                .await?;
                set_main_tags_tx(&mut tx, id, &instance.summary.extract(ResourceLevel::Study))
                    .await?;
                set_identifiers_tx(&mut tx, id, ResourceLevel::Study, identity, &instance.summary).await?;
                changes.push(
                    log_change_tx(&mut tx, ChangeKind::NewStudy, ResourceLevel::Study, &identity.study_uid)
                        .await?,
                );
                id
            }
        };

        let (series, series_created) = match lookup_resource_tx(&mut tx, &identity.series_uid)
            .await?
        {
            Some((id, ResourceLevel::Series)) => (id, false),
            Some((_, level)) => {
                return Err(ArchiveError::internal(format!(
                    "series uid {} already used at level {}",
                    identity.series_uid, level
                )))
            }
            None => {
                let id = create_resource_tx(
                    &mut tx,
                    &identity.series_uid,
                    ResourceLevel::Series,
                    Some(study),
                )
                .await?;
                set_main_tags_tx(&mut tx, id, &instance.summary.extract(ResourceLevel::Series))
                    .await?;
                set_identifiers_tx(&mut tx, id, ResourceLevel::Series, identity, &instance.summary).await?;
                changes.push(
                    log_change_tx(&mut tx, ChangeKind::NewSeries, ResourceLevel::Series, &identity.series_uid)
                        .await?,
                );
                (id, true)
            }
        };

        let instance_id = create_resource_tx(
            &mut tx,
            &identity.sop_uid,
            ResourceLevel::Instance,
            Some(series),
        )
        .await?;
        set_main_tags_tx(
            &mut tx,
            instance_id,
            &instance.summary.extract(ResourceLevel::Instance),
        )
        .await?;
        set_identifiers_tx(&mut tx, instance_id, ResourceLevel::Instance, identity, &instance.summary).await?;

        for attachment in &instance.attachments {
            add_attachment_tx(&mut tx, instance_id, attachment).await?;
        }

        // 实例级元数据
        let now = now_iso8601();
        set_metadata_tx(&mut tx, instance_id, MetadataKind::ReceptionDate, &now).await?;
        if !instance.remote_aet.is_empty() {
            set_metadata_tx(&mut tx, instance_id, MetadataKind::RemoteAet, &instance.remote_aet)
                .await?;
        }
        let sibling_count = count_children_tx(&mut tx, series).await?;
        set_metadata_tx(
            &mut tx,
            instance_id,
            MetadataKind::IndexInSeries,
            &sibling_count.to_string(),
        )
        .await?;
        touch_last_update_tx(&mut tx, instance_id).await?;

        changes.push(
            log_change_tx(&mut tx, ChangeKind::NewInstance, ResourceLevel::Instance, &identity.sop_uid)
                .await?,
        );
        if !series_created {
            changes.push(
                log_change_tx(
                    &mut tx,
                    ChangeKind::NewChildInstance,
                    ResourceLevel::Series,
                    &identity.series_uid,
                )
                .await?,
            );
        }

        // 系列期望实例数与完整性
        if series_created {
            if let Some(expected) = expected_instance_count(&instance.summary) {
                set_metadata_tx(&mut tx, series, MetadataKind::ExpectedInstanceCount, &expected)
                    .await?;
            }
        }
        if series_status_tx(&mut tx, series).await? == SeriesStatus::Complete {
            changes.push(
                log_change_tx(
                    &mut tx,
                    ChangeKind::CompletedSeries,
                    ResourceLevel::Series,
                    &identity.series_uid,
                )
                .await?,
            );
        }

        // 配额回收：以事务内的投影总量为准
        let mut recycled_attachments = Vec::new();
        let mut recycled_instances = Vec::new();
        loop {
            let counters = counters_tx(&mut tx).await?;
            if !quotas.violated(&counters) {
                break;
            }
            let Some(candidate) = select_recycling_candidate_tx(&mut tx, Some(patient)).await?
            else {
                // 回滚整个入库
                return Err(ArchiveError::FullStorage);
            };

            let candidate_public_id = get_public_id_tx(&mut tx, candidate).await?;
            info!("recycling patient {}", candidate_public_id);
            let deletion = delete_subtree_tx(&mut tx, candidate).await?;
            recycled_attachments.extend(deletion.attachments);
            recycled_instances.extend(deletion.instance_public_ids);
            changes.push(
                log_change_tx(&mut tx, ChangeKind::Deleted, ResourceLevel::Patient, &candidate_public_id)
                    .await?,
            );
        }

        // 成功入库算作一次访问，刷新回收顺序
        bump_recycling_tx(&mut tx, patient).await?;

        tx.commit().await.map_err(db_err)?;
        debug!("indexed instance {}", identity.sop_uid);

        Ok(StoreReport {
            status: StoreStatus::Success,
            instance_public_id: identity.sop_uid.clone(),
            changes,
            recycled_attachments,
            recycled_instances,
        })
    }

    // ========== 删除 ==========

    /// 级联删除资源及其子孙，必要时继续删除成为空壳的祖先
    ///
    /// 返回 None 表示资源不存在或层级不符。
    pub async fn delete_resource(
        &self,
        public_id: &str,
        expected_level: Option<ResourceLevel>,
    ) -> Result<Option<DeletionReport>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        let Some((id, level)) = lookup_resource_tx(&mut tx, public_id).await? else {
            return Ok(None);
        };
        if let Some(expected) = expected_level {
            if expected != level {
                return Ok(None);
            }
        }

        let parent = lookup_parent_tx(&mut tx, id).await?;
        let deletion = delete_subtree_tx(&mut tx, id).await?;

        // 自下而上清理成为空壳的祖先，最高的存活者进入报告
        let mut remaining_ancestor = None;
        let mut current = parent;
        let mut all_attachments = deletion.attachments;
        let mut all_instances = deletion.instance_public_ids;
        while let Some(ancestor) = current {
            if count_children_tx(&mut tx, ancestor).await? > 0 {
                let ancestor_level = get_level_tx(&mut tx, ancestor).await?;
                let ancestor_public_id = get_public_id_tx(&mut tx, ancestor).await?;
                remaining_ancestor = Some((ancestor_level, ancestor_public_id));
                break;
            }
            let next = lookup_parent_tx(&mut tx, ancestor).await?;
            let ancestor_deletion = delete_subtree_tx(&mut tx, ancestor).await?;
            all_attachments.extend(ancestor_deletion.attachments);
            all_instances.extend(ancestor_deletion.instance_public_ids);
            current = next;
        }

        let change = log_change_tx(&mut tx, ChangeKind::Deleted, level, public_id).await?;
        tx.commit().await.map_err(db_err)?;
        info!("deleted {} {}", level, public_id);

        Ok(Some(DeletionReport {
            remaining_ancestor,
            deleted_attachments: all_attachments,
            deleted_instances: all_instances,
            change,
        }))
    }

    // ========== 回收保护 ==========

    /// 受保护的患者从回收顺序中摘除，永不被配额回收
    pub async fn set_protected(&self, patient_public_id: &str, protected: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        let Some((id, ResourceLevel::Patient)) =
            lookup_resource_tx(&mut tx, patient_public_id).await?
        else {
            return Err(ArchiveError::InexistentItem(patient_public_id.to_string()));
        };

        if protected {
            sqlx::query("DELETE FROM PatientRecyclingOrder WHERE patientId = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        } else {
            sqlx::query("INSERT OR IGNORE INTO PatientRecyclingOrder(patientId) VALUES(?)")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        info!(
            "patient {} is now {}",
            patient_public_id,
            if protected { "protected" } else { "unprotected" }
        );
        Ok(())
    }

    pub async fn is_protected(&self, patient_public_id: &str) -> Result<bool> {
        let Some((id, ResourceLevel::Patient)) = self.lookup_resource(patient_public_id).await?
        else {
            return Err(ArchiveError::InexistentItem(patient_public_id.to_string()));
        };
        let present: Option<i64> =
            sqlx::query_scalar("SELECT patientId FROM PatientRecyclingOrder WHERE patientId = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err)?;
        Ok(present.is_none())
    }

    /// 最久未访问的非保护患者；`avoid` 为正在写入的患者
    pub async fn select_patient_to_recycle(&self, avoid: Option<i64>) -> Result<Option<i64>> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let candidate = select_recycling_candidate_tx(&mut tx, avoid).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(candidate)
    }

    /// 启动时的独立回收：配额收紧后先把存量清到界内
    pub async fn standalone_recycling(&self, quotas: &RecyclingQuotas) -> Result<StoreReport> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;

        let mut changes = Vec::new();
        let mut recycled_attachments = Vec::new();
        let mut recycled_instances = Vec::new();
        loop {
            let counters = counters_tx(&mut tx).await?;
            if !quotas.violated(&counters) {
                break;
            }
            let Some(candidate) = select_recycling_candidate_tx(&mut tx, None).await? else {
                return Err(ArchiveError::FullStorage);
            };
            let public_id = get_public_id_tx(&mut tx, candidate).await?;
            info!("standalone recycling of patient {}", public_id);
            let deletion = delete_subtree_tx(&mut tx, candidate).await?;
            recycled_attachments.extend(deletion.attachments);
            recycled_instances.extend(deletion.instance_public_ids);
            changes
                .push(log_change_tx(&mut tx, ChangeKind::Deleted, ResourceLevel::Patient, &public_id).await?);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(StoreReport {
            status: StoreStatus::Success,
            instance_public_id: String::new(),
            changes,
            recycled_attachments,
            recycled_instances,
        })
    }

    // ========== 读取 ==========

    pub async fn lookup_resource(&self, public_id: &str) -> Result<Option<(i64, ResourceLevel)>> {
        let row = sqlx::query("SELECT internalId, resourceType FROM Resources WHERE publicId = ?")
            .bind(public_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(decode_resource_row).transpose()
    }

    pub async fn get_public_id(&self, internal_id: i64) -> Result<String> {
        sqlx::query_scalar("SELECT publicId FROM Resources WHERE internalId = ?")
            .bind(internal_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| ArchiveError::InexistentItem(internal_id.to_string()))
    }

    pub async fn get_level(&self, internal_id: i64) -> Result<ResourceLevel> {
        let code: Option<i64> =
            sqlx::query_scalar("SELECT resourceType FROM Resources WHERE internalId = ?")
                .bind(internal_id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err)?;
        code.and_then(ResourceLevel::from_code)
            .ok_or_else(|| ArchiveError::InexistentItem(internal_id.to_string()))
    }

    pub async fn lookup_parent(&self, internal_id: i64) -> Result<Option<i64>> {
        let parent: Option<Option<i64>> =
            sqlx::query_scalar("SELECT parentId FROM Resources WHERE internalId = ?")
                .bind(internal_id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err)?;
        Ok(parent.flatten())
    }

    pub async fn get_children(&self, internal_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT internalId FROM Resources WHERE parentId = ? ORDER BY internalId")
            .bind(internal_id)
            .fetch_all(self.pool())
            .await
            .map_err(db_err)
    }

    pub async fn get_children_public_ids(&self, internal_id: i64) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT publicId FROM Resources WHERE parentId = ? ORDER BY internalId")
            .bind(internal_id)
            .fetch_all(self.pool())
            .await
            .map_err(db_err)
    }

    /// 枚举某层级全部资源的公开ID
    pub async fn list_resources(&self, level: ResourceLevel) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT publicId FROM Resources WHERE resourceType = ? ORDER BY internalId",
        )
        .bind(level.code())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn all_at_level(&self, level: ResourceLevel) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT internalId FROM Resources WHERE resourceType = ? ORDER BY internalId",
        )
        .bind(level.code())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn get_main_tags(&self, internal_id: i64) -> Result<DicomMap> {
        let rows = sqlx::query(
            "SELECT tagGroup, tagElement, value FROM MainDicomTags WHERE id = ?",
        )
        .bind(internal_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let mut map = DicomMap::new();
        for row in rows {
            let group: i64 = row.get(0);
            let element: i64 = row.get(1);
            let value: Option<String> = row.get(2);
            let tag = DicomTag::new(group as u16, element as u16);
            match value {
                Some(s) => map.set(tag, DicomValue::String(s)),
                None => map.set(tag, DicomValue::Null),
            }
        }
        Ok(map)
    }

    /// 标识符等值检索
    pub async fn lookup_identifier(
        &self,
        tag: DicomTag,
        value: &str,
        level: ResourceLevel,
    ) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT d.id FROM DicomIdentifiers d, Resources r \
             WHERE r.internalId = d.id AND r.resourceType = ? \
             AND d.tagGroup = ? AND d.tagElement = ? AND d.value = ? \
             ORDER BY d.id",
        )
        .bind(level.code())
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(value)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    /// 标识符通配检索，`pattern` 为SQL LIKE模式（! 为转义符）
    pub async fn lookup_identifier_wildcard(
        &self,
        tag: DicomTag,
        pattern: &str,
        level: ResourceLevel,
    ) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT d.id FROM DicomIdentifiers d, Resources r \
             WHERE r.internalId = d.id AND r.resourceType = ? \
             AND d.tagGroup = ? AND d.tagElement = ? AND d.value LIKE ? ESCAPE '!' \
             ORDER BY d.id",
        )
        .bind(level.code())
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(pattern)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn lookup_attachment(
        &self,
        internal_id: i64,
        content_type: ContentType,
    ) -> Result<Option<AttachmentInfo>> {
        let row = sqlx::query(
            "SELECT uuid, compressedSize, uncompressedSize, compressionType, \
             uncompressedMD5, compressedMD5 \
             FROM AttachedFiles WHERE id = ? AND fileType = ?",
        )
        .bind(internal_id)
        .bind(content_type.code())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| decode_attachment_row(&row, content_type)))
    }

    /// 事务外的附件登记，供外部内容挂载使用
    pub async fn add_attachment(&self, internal_id: i64, info: &AttachmentInfo) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        if sqlx::query_scalar::<_, i64>("SELECT internalId FROM Resources WHERE internalId = ?")
            .bind(internal_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_none()
        {
            return Err(ArchiveError::InexistentItem(internal_id.to_string()));
        }
        add_attachment_tx(&mut tx, internal_id, info).await?;
        tx.commit().await.map_err(db_err)
    }

    pub async fn set_metadata(
        &self,
        internal_id: i64,
        kind: MetadataKind,
        value: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        set_metadata_tx(&mut tx, internal_id, kind, value).await?;
        tx.commit().await.map_err(db_err)
    }

    pub async fn get_metadata(
        &self,
        internal_id: i64,
        kind: MetadataKind,
    ) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM Metadata WHERE id = ? AND type = ?")
            .bind(internal_id)
            .bind(kind.code())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    /// 全局计数，直接来自索引行的聚合
    pub async fn global_counters(&self) -> Result<GlobalCounters> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let counters = counters_tx(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(counters)
    }

    /// 系列完整性：与期望实例数和子实例的序号比对
    pub async fn series_status(&self, series_internal_id: i64) -> Result<SeriesStatus> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let status = series_status_tx(&mut tx, series_internal_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(status)
    }

    /// 自上而下贪婪取第一个可达的子实例
    pub async fn find_child_instance(&self, internal_id: i64) -> Result<Option<i64>> {
        let mut current = internal_id;
        loop {
            let level = self.get_level(current).await?;
            if level == ResourceLevel::Instance {
                return Ok(Some(current));
            }
            let children = self.get_children(current).await?;
            match children.into_iter().next() {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
    }

    /// 某资源之下的全部实例公开ID
    pub async fn get_child_instances(&self, public_id: &str) -> Result<Vec<String>> {
        let Some((id, level)) = self.lookup_resource(public_id).await? else {
            return Err(ArchiveError::InexistentItem(public_id.to_string()));
        };
        if level == ResourceLevel::Instance {
            return Ok(vec![public_id.to_string()]);
        }

        let mut result = Vec::new();
        let mut to_explore = vec![id];
        while let Some(current) = to_explore.pop() {
            if self.get_level(current).await? == ResourceLevel::Instance {
                result.push(self.get_public_id(current).await?);
            } else {
                to_explore.extend(self.get_children(current).await?);
            }
        }
        Ok(result)
    }
}

// ========== 事务内原语 ==========

fn decode_resource_row(row: SqliteRow) -> Result<(i64, ResourceLevel)> {
    let id: i64 = row.get(0);
    let code: i64 = row.get(1);
    let level = ResourceLevel::from_code(code)
        .ok_or_else(|| ArchiveError::Database(format!("unknown resource type {code}")))?;
    Ok((id, level))
}

fn decode_attachment_row(row: &SqliteRow, content_type: ContentType) -> AttachmentInfo {
    AttachmentInfo {
        uuid: row.get(0),
        content_type,
        compressed_size: row.get::<i64, _>(1) as u64,
        uncompressed_size: row.get::<i64, _>(2) as u64,
        compression: CompressionKind::from_code(row.get(3)).unwrap_or(CompressionKind::None),
        uncompressed_md5: row.get(4),
        compressed_md5: row.get(5),
    }
}

async fn lookup_resource_tx(tx: &mut Tx, public_id: &str) -> Result<Option<(i64, ResourceLevel)>> {
    let row = sqlx::query("SELECT internalId, resourceType FROM Resources WHERE publicId = ?")
        .bind(public_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
    row.map(decode_resource_row).transpose()
}

async fn create_resource_tx(
    tx: &mut Tx,
    public_id: &str,
    level: ResourceLevel,
    parent: Option<i64>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO Resources(resourceType, publicId, parentId) VALUES(?, ?, ?)",
    )
    .bind(level.code())
    .bind(public_id)
    .bind(parent)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(result.last_insert_rowid())
}

async fn lookup_parent_tx(tx: &mut Tx, internal_id: i64) -> Result<Option<i64>> {
    let parent: Option<Option<i64>> =
        sqlx::query_scalar("SELECT parentId FROM Resources WHERE internalId = ?")
            .bind(internal_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
    Ok(parent.flatten())
}

async fn get_public_id_tx(tx: &mut Tx, internal_id: i64) -> Result<String> {
    sqlx::query_scalar("SELECT publicId FROM Resources WHERE internalId = ?")
        .bind(internal_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ArchiveError::InexistentItem(internal_id.to_string()))
}

async fn get_level_tx(tx: &mut Tx, internal_id: i64) -> Result<ResourceLevel> {
    let code: Option<i64> =
        sqlx::query_scalar("SELECT resourceType FROM Resources WHERE internalId = ?")
            .bind(internal_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
    code.and_then(ResourceLevel::from_code)
        .ok_or_else(|| ArchiveError::InexistentItem(internal_id.to_string()))
}

async fn count_children_tx(tx: &mut Tx, internal_id: i64) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM Resources WHERE parentId = ?")
        .bind(internal_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
}

async fn set_main_tags_tx(tx: &mut Tx, internal_id: i64, map: &DicomMap) -> Result<()> {
    for (tag, value) in map.iter() {
        sqlx::query(
            "INSERT OR REPLACE INTO MainDicomTags(id, tagGroup, tagElement, value) \
             VALUES(?, ?, ?, ?)",
        )
        .bind(internal_id)
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(value.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

/// 写入该层级可检索的标识符行
async fn set_identifiers_tx(
    tx: &mut Tx,
    internal_id: i64,
    level: ResourceLevel,
    identity: &InstanceIdentity,
    summary: &DicomMap,
) -> Result<()> {
    for tag in tags::lookup_identifier_tags(level) {
        let value = match *tag {
            t if t == tags::PATIENT_ID => Some(identity.patient_id.as_str()),
            t if t == tags::STUDY_INSTANCE_UID => Some(identity.study_uid.as_str()),
            t if t == tags::SERIES_INSTANCE_UID => Some(identity.series_uid.as_str()),
            t if t == tags::SOP_INSTANCE_UID => Some(identity.sop_uid.as_str()),
            t => summary.value_str(t),
        };
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        sqlx::query(
            "INSERT OR REPLACE INTO DicomIdentifiers(id, tagGroup, tagElement, value) \
             VALUES(?, ?, ?, ?)",
        )
        .bind(internal_id)
        .bind(tag.group as i64)
        .bind(tag.element as i64)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn add_attachment_tx(tx: &mut Tx, internal_id: i64, info: &AttachmentInfo) -> Result<()> {
    sqlx::query(
        "INSERT INTO AttachedFiles(id, fileType, uuid, compressedSize, uncompressedSize, \
         compressionType, uncompressedMD5, compressedMD5) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(internal_id)
    .bind(info.content_type.code())
    .bind(&info.uuid)
    .bind(info.compressed_size as i64)
    .bind(info.uncompressed_size as i64)
    .bind(info.compression.code())
    .bind(&info.uncompressed_md5)
    .bind(&info.compressed_md5)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn set_metadata_tx(
    tx: &mut Tx,
    internal_id: i64,
    kind: MetadataKind,
    value: &str,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO Metadata(id, type, value) VALUES(?, ?, ?)")
        .bind(internal_id)
        .bind(kind.code())
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn get_metadata_tx(
    tx: &mut Tx,
    internal_id: i64,
    kind: MetadataKind,
) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT value FROM Metadata WHERE id = ? AND type = ?")
        .bind(internal_id)
        .bind(kind.code())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)
}

/// 刷新资源及其全部祖先的 LastUpdate
async fn touch_last_update_tx(tx: &mut Tx, internal_id: i64) -> Result<()> {
    let now = now_iso8601();
    let mut current = Some(internal_id);
    while let Some(id) = current {
        set_metadata_tx(tx, id, MetadataKind::LastUpdate, &now).await?;
        current = lookup_parent_tx(tx, id).await?;
    }
    Ok(())
}

async fn enroll_recycling_tx(tx: &mut Tx, patient_internal_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO PatientRecyclingOrder(patientId) VALUES(?)")
        .bind(patient_internal_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// 访问后把患者挪到回收顺序末尾；受保护的患者没有顺序行，保持原状
async fn bump_recycling_tx(tx: &mut Tx, patient_internal_id: i64) -> Result<()> {
    let removed = sqlx::query("DELETE FROM PatientRecyclingOrder WHERE patientId = ?")
        .bind(patient_internal_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    if removed.rows_affected() > 0 {
        enroll_recycling_tx(tx, patient_internal_id).await?;
    }
    Ok(())
}

async fn select_recycling_candidate_tx(tx: &mut Tx, avoid: Option<i64>) -> Result<Option<i64>> {
    let candidate: Option<i64> = match avoid {
        Some(avoid_id) => {
            sqlx::query_scalar(
                "SELECT patientId FROM PatientRecyclingOrder WHERE patientId != ? \
                 ORDER BY seq ASC, patientId ASC LIMIT 1",
            )
            .bind(avoid_id)
            .fetch_optional(&mut **tx)
            .await
        }
        None => {
            sqlx::query_scalar(
                "SELECT patientId FROM PatientRecyclingOrder ORDER BY seq ASC, patientId ASC LIMIT 1",
            )
            .fetch_optional(&mut **tx)
            .await
        }
    }
    .map_err(db_err)?;
    Ok(candidate)
}

async fn counters_tx(tx: &mut Tx) -> Result<GlobalCounters> {
    let compressed: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(compressedSize), 0) FROM AttachedFiles")
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
    let uncompressed: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(uncompressedSize), 0) FROM AttachedFiles")
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;

    let mut counters = GlobalCounters {
        compressed_total: compressed as u64,
        uncompressed_total: uncompressed as u64,
        ..Default::default()
    };
    for level in [
        ResourceLevel::Patient,
        ResourceLevel::Study,
        ResourceLevel::Series,
        ResourceLevel::Instance,
    ] {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM Resources WHERE resourceType = ?")
                .bind(level.code())
                .fetch_one(&mut **tx)
                .await
                .map_err(db_err)?;
        match level {
            ResourceLevel::Patient => counters.patient_count = count as u64,
            ResourceLevel::Study => counters.study_count = count as u64,
            ResourceLevel::Series => counters.series_count = count as u64,
            ResourceLevel::Instance => counters.instance_count = count as u64,
        }
    }
    Ok(counters)
}

async fn series_status_tx(tx: &mut Tx, series_internal_id: i64) -> Result<SeriesStatus> {
    let Some(expected_raw) =
        get_metadata_tx(tx, series_internal_id, MetadataKind::ExpectedInstanceCount).await?
    else {
        return Ok(SeriesStatus::Unknown);
    };
    let Ok(expected) = expected_raw.trim().parse::<u64>() else {
        return Ok(SeriesStatus::Unknown);
    };
    if expected == 0 {
        return Ok(SeriesStatus::Unknown);
    }

    let children: Vec<i64> =
        sqlx::query_scalar("SELECT internalId FROM Resources WHERE parentId = ?")
            .bind(series_internal_id)
            .fetch_all(&mut **tx)
            .await
            .map_err(db_err)?;

    let mut seen = std::collections::HashSet::new();
    for child in children {
        let Some(index_raw) = get_metadata_tx(tx, child, MetadataKind::IndexInSeries).await?
        else {
            return Ok(SeriesStatus::Unknown);
        };
        let Ok(index) = index_raw.trim().parse::<u64>() else {
            return Ok(SeriesStatus::Unknown);
        };
        if index == 0 || index > expected {
            return Ok(SeriesStatus::Inconsistent);
        }
        if !seen.insert(index) {
            return Ok(SeriesStatus::Inconsistent);
        }
    }

    if seen.len() as u64 == expected {
        Ok(SeriesStatus::Complete)
    } else {
        Ok(SeriesStatus::Missing)
    }
}

/// 删除一棵子树，收集其附件与实例ID
async fn delete_subtree_tx(tx: &mut Tx, root: i64) -> Result<SubtreeDeletion> {
    // 先用栈收齐整棵子树
    let mut subtree = Vec::new();
    let mut to_explore = vec![root];
    while let Some(current) = to_explore.pop() {
        subtree.push(current);
        let children: Vec<i64> =
            sqlx::query_scalar("SELECT internalId FROM Resources WHERE parentId = ?")
                .bind(current)
                .fetch_all(&mut **tx)
                .await
                .map_err(db_err)?;
        to_explore.extend(children);
    }

    let mut attachments = Vec::new();
    let mut instance_public_ids = Vec::new();

    for id in &subtree {
        let rows = sqlx::query(
            "SELECT uuid, compressedSize, uncompressedSize, compressionType, \
             uncompressedMD5, compressedMD5, fileType \
             FROM AttachedFiles WHERE id = ?",
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        for row in rows {
            let content_type =
                ContentType::from_code(row.get(6)).unwrap_or(ContentType::Dicom);
            attachments.push(decode_attachment_row(&row, content_type));
        }

        let level = get_level_tx(tx, *id).await?;
        if level == ResourceLevel::Instance {
            instance_public_ids.push(get_public_id_tx(tx, *id).await?);
        }
    }

    for id in &subtree {
        for statement in [
            "DELETE FROM MainDicomTags WHERE id = ?",
            "DELETE FROM DicomIdentifiers WHERE id = ?",
            "DELETE FROM Metadata WHERE id = ?",
            "DELETE FROM AttachedFiles WHERE id = ?",
            "DELETE FROM PatientRecyclingOrder WHERE patientId = ?",
            "DELETE FROM Resources WHERE internalId = ?",
        ] {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        }
    }

    Ok(SubtreeDeletion {
        attachments,
        instance_public_ids,
    })
}

async fn log_change_tx(
    tx: &mut Tx,
    kind: ChangeKind,
    level: ResourceLevel,
    public_id: &str,
) -> Result<ChangeRecord> {
    let timestamp = Utc::now();
    let result = sqlx::query(
        "INSERT INTO Changes(changeType, resourceType, publicId, date) VALUES(?, ?, ?, ?)",
    )
    .bind(kind.code())
    .bind(level.code())
    .bind(public_id)
    .bind(medvault_core::utils::to_iso8601(&timestamp))
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(ChangeRecord {
        seq: result.last_insert_rowid() as u64,
        kind,
        level,
        public_id: public_id.to_string(),
        timestamp,
    })
}

/// 从摘要取系列的期望实例数
fn expected_instance_count(summary: &DicomMap) -> Option<String> {
    for tag in [
        tags::NUMBER_OF_SLICES,
        tags::IMAGES_IN_ACQUISITION,
        tags::CARDIAC_NUMBER_OF_IMAGES,
    ] {
        if let Some(value) = summary.value_str(tag) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn lookup_identifier_tx(
    tx: &mut Tx,
    tag: DicomTag,
    value: &str,
    level: ResourceLevel,
) -> Result<Vec<i64>> {
    sqlx::query_scalar(
        "SELECT d.id FROM DicomIdentifiers d, Resources r \
         WHERE r.internalId = d.id AND r.resourceType = ? \
         AND d.tagGroup = ? AND d.tagElement = ? AND d.value = ? \
         ORDER BY d.id",
    )
    .bind(level.code())
    .bind(tag.group as i64)
    .bind(tag.element as i64)
    .bind(value)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(size: u64) -> AttachmentInfo {
        AttachmentInfo {
            uuid: generate_uuid(),
            content_type: ContentType::Dicom,
            compressed_size: size,
            uncompressed_size: size,
            compression: CompressionKind::None,
            uncompressed_md5: None,
            compressed_md5: None,
        }
    }

    fn instance(patient: &str, study: &str, series: &str, sop: &str, size: u64) -> InstanceToIndex {
        let mut summary = DicomMap::new();
        summary.set_string(tags::PATIENT_ID, patient);
        summary.set_string(tags::PATIENT_NAME, format!("NAME^{patient}"));
        summary.set_string(tags::STUDY_INSTANCE_UID, study);
        summary.set_string(tags::ACCESSION_NUMBER, format!("ACC-{study}"));
        summary.set_string(tags::SERIES_INSTANCE_UID, series);
        summary.set_string(tags::SOP_INSTANCE_UID, sop);
        summary.set_string(tags::MODALITY, "CT");
        let identity = InstanceIdentity::from_map(&summary).unwrap();
        InstanceToIndex {
            identity,
            summary,
            attachments: vec![attachment(size)],
            remote_aet: "TEST_SCU".to_string(),
        }
    }

    async fn store() -> IndexStore {
        IndexStore::open(None).await.unwrap()
    }

    const NO_QUOTA: RecyclingQuotas = RecyclingQuotas {
        max_patient_count: 0,
        max_storage_size: 0,
    };

    #[tokio::test]
    async fn test_store_creates_hierarchy() {
        let index = store().await;
        let report = index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 2048), &NO_QUOTA)
            .await
            .unwrap();

        assert_eq!(report.status, StoreStatus::Success);
        assert_eq!(report.instance_public_id, "1.2.3.4.5");

        let counters = index.global_counters().await.unwrap();
        assert_eq!(counters.patient_count, 1);
        assert_eq!(counters.study_count, 1);
        assert_eq!(counters.series_count, 1);
        assert_eq!(counters.instance_count, 1);
        assert_eq!(counters.compressed_total, 2048);

        // 变更顺序：患者 → 检查 → 系列 → 实例
        let kinds: Vec<ChangeKind> = report.changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::NewPatient,
                ChangeKind::NewStudy,
                ChangeKind::NewSeries,
                ChangeKind::NewInstance,
            ]
        );

        // 检查/系列/实例的公开ID就是对应的UID，患者为36字符随机ID
        assert!(index.lookup_resource("1.2.3").await.unwrap().is_some());
        assert!(index.lookup_resource("1.2.3.4").await.unwrap().is_some());
        let (instance_id, level) = index.lookup_resource("1.2.3.4.5").await.unwrap().unwrap();
        assert_eq!(level, ResourceLevel::Instance);
        let patient_public = report.changes[0].public_id.clone();
        assert_eq!(patient_public.len(), 36);

        // 父链闭合
        let series_id = index.lookup_parent(instance_id).await.unwrap().unwrap();
        assert_eq!(index.get_level(series_id).await.unwrap(), ResourceLevel::Series);
        let study_id = index.lookup_parent(series_id).await.unwrap().unwrap();
        assert_eq!(index.get_level(study_id).await.unwrap(), ResourceLevel::Study);
        let patient_id = index.lookup_parent(study_id).await.unwrap().unwrap();
        assert_eq!(index.get_level(patient_id).await.unwrap(), ResourceLevel::Patient);
        assert!(index.lookup_parent(patient_id).await.unwrap().is_none());
        assert_eq!(index.get_public_id(patient_id).await.unwrap(), patient_public);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let index = store().await;
        let first = instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 100);
        index.store_instance(&first, &NO_QUOTA).await.unwrap();

        let report = index.store_instance(&first, &NO_QUOTA).await.unwrap();
        assert_eq!(report.status, StoreStatus::AlreadyStored);
        assert!(report.changes.is_empty());

        let counters = index.global_counters().await.unwrap();
        assert_eq!(counters.instance_count, 1);
        assert_eq!(counters.compressed_total, 100);

        // 重复入库不产生新的变更记录
        let (records, done) = index.read_changes(0, 100).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(done);
    }

    #[tokio::test]
    async fn test_second_instance_in_existing_series() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 10), &NO_QUOTA)
            .await
            .unwrap();
        let report = index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.6", 10), &NO_QUOTA)
            .await
            .unwrap();

        let kinds: Vec<ChangeKind> = report.changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::NewInstance, ChangeKind::NewChildInstance]);

        let (second, _) = index.lookup_resource("1.2.3.4.6").await.unwrap().unwrap();
        assert_eq!(
            index
                .get_metadata(second, MetadataKind::IndexInSeries)
                .await
                .unwrap()
                .as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_recycling_under_patient_quota() {
        let index = store().await;
        let quotas = RecyclingQuotas {
            max_patient_count: 2,
            max_storage_size: 0,
        };

        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 10), &quotas)
            .await
            .unwrap();
        index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 10), &quotas)
            .await
            .unwrap();
        let report = index
            .store_instance(&instance("P3", "3.1", "3.1.1", "3.1.1.1", 10), &quotas)
            .await
            .unwrap();

        // P1 最久未访问，被事务内回收
        assert_eq!(report.status, StoreStatus::Success);
        assert_eq!(report.recycled_attachments.len(), 1);
        assert_eq!(report.recycled_instances, vec!["1.1.1.1".to_string()]);
        assert!(report.changes.iter().any(|c| c.kind == ChangeKind::Deleted));

        let counters = index.global_counters().await.unwrap();
        assert_eq!(counters.patient_count, 2);
        assert!(index.lookup_resource("1.1.1.1").await.unwrap().is_none());
        assert!(index.lookup_resource("2.1.1.1").await.unwrap().is_some());
        assert!(index.lookup_resource("3.1.1.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lru_order_follows_access() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 10), &NO_QUOTA)
            .await
            .unwrap();
        index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 10), &NO_QUOTA)
            .await
            .unwrap();
        // 再次触达P1，P2成为最久未访问者
        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.2", 10), &NO_QUOTA)
            .await
            .unwrap();

        let (p2, _) = index.lookup_resource("2.1.1.1").await.unwrap().unwrap();
        let p2_patient = {
            let series = index.lookup_parent(p2).await.unwrap().unwrap();
            let study = index.lookup_parent(series).await.unwrap().unwrap();
            index.lookup_parent(study).await.unwrap().unwrap()
        };
        assert_eq!(
            index.select_patient_to_recycle(None).await.unwrap(),
            Some(p2_patient)
        );
    }

    #[tokio::test]
    async fn test_protected_patients_block_recycling() {
        let index = store().await;
        let quotas = RecyclingQuotas {
            max_patient_count: 2,
            max_storage_size: 0,
        };

        let first = index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 10), &quotas)
            .await
            .unwrap();
        let second = index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 10), &quotas)
            .await
            .unwrap();
        let p1_public = first.changes[0].public_id.clone();
        let p2_public = second.changes[0].public_id.clone();
        index.set_protected(&p1_public, true).await.unwrap();
        index.set_protected(&p2_public, true).await.unwrap();
        assert!(index.is_protected(&p1_public).await.unwrap());

        let err = index
            .store_instance(&instance("P3", "3.1", "3.1.1", "3.1.1.1", 10), &quotas)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::FullStorage));

        // 整个事务回滚，不留部分状态
        let counters = index.global_counters().await.unwrap();
        assert_eq!(counters.patient_count, 2);
        assert_eq!(counters.instance_count, 2);
        assert!(index.lookup_resource("3.1.1.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recycling_never_evicts_current_patient() {
        let index = store().await;
        let quotas = RecyclingQuotas {
            max_patient_count: 0,
            max_storage_size: 10,
        };

        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 8), &quotas)
            .await
            .unwrap();

        // 新实例自身就超过配额：清空他人之后唯一候选是自己，入库失败
        let err = index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 20), &quotas)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::FullStorage));

        // 回滚后P1完好
        assert!(index.lookup_resource("1.1.1.1").await.unwrap().is_some());
        assert_eq!(index.global_counters().await.unwrap().compressed_total, 8);
    }

    #[tokio::test]
    async fn test_store_succeeds_when_quota_exactly_reached() {
        let index = store().await;
        let quotas = RecyclingQuotas {
            max_patient_count: 0,
            max_storage_size: 10,
        };

        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 6), &quotas)
            .await
            .unwrap();
        index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 4), &quotas)
            .await
            .unwrap();

        // 驱逐P1后恰好回到配额线上
        let report = index
            .store_instance(&instance("P3", "3.1", "3.1.1", "3.1.1.1", 6), &quotas)
            .await
            .unwrap();
        assert_eq!(report.status, StoreStatus::Success);
        assert_eq!(index.global_counters().await.unwrap().compressed_total, 10);
        assert!(index.lookup_resource("1.1.1.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_both_ways() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 64), &NO_QUOTA)
            .await
            .unwrap();

        let report = index
            .delete_resource("1.2.3.4.5", Some(ResourceLevel::Instance))
            .await
            .unwrap()
            .unwrap();

        // 最后一个实例删除后，空壳祖先全部消失
        assert!(report.remaining_ancestor.is_none());
        assert_eq!(report.deleted_attachments.len(), 1);
        assert_eq!(report.deleted_instances, vec!["1.2.3.4.5".to_string()]);
        assert_eq!(report.change.kind, ChangeKind::Deleted);

        let counters = index.global_counters().await.unwrap();
        assert_eq!(counters.patient_count, 0);
        assert_eq!(counters.instance_count, 0);
        assert_eq!(counters.compressed_total, 0);
    }

    #[tokio::test]
    async fn test_delete_reports_remaining_ancestor() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 10), &NO_QUOTA)
            .await
            .unwrap();
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.9", "1.2.3.9.1", 10), &NO_QUOTA)
            .await
            .unwrap();

        let report = index
            .delete_resource("1.2.3.4.5", None)
            .await
            .unwrap()
            .unwrap();

        // 系列1.2.3.4随之消失，最高存活祖先是检查
        assert_eq!(
            report.remaining_ancestor,
            Some((ResourceLevel::Study, "1.2.3".to_string()))
        );
        assert!(index.lookup_resource("1.2.3.4").await.unwrap().is_none());
        assert!(index.lookup_resource("1.2.3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_or_wrong_level() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 10), &NO_QUOTA)
            .await
            .unwrap();

        assert!(index.delete_resource("no-such-id", None).await.unwrap().is_none());
        assert!(index
            .delete_resource("1.2.3.4.5", Some(ResourceLevel::Study))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_change_log_pagination() {
        let index = store().await;
        for i in 0..10 {
            index
                .store_instance(
                    &instance("P1", "1.2.3", "1.2.3.4", &format!("1.2.3.4.{i}"), 1),
                    &NO_QUOTA,
                )
                .await
                .unwrap();
        }

        let (first_page, done) = index.read_changes(0, 3).await.unwrap();
        assert_eq!(first_page.len(), 3);
        assert!(!done);

        // seq 严格递增
        assert!(first_page.windows(2).all(|w| w[0].seq < w[1].seq));

        let (rest, done) = index
            .read_changes(first_page.last().unwrap().seq, 1000)
            .await
            .unwrap();
        assert!(done);
        let total = first_page.len() + rest.len();

        // 末尾之后的窗口为空且 done = true
        let tail = rest.last().unwrap().seq;
        let (empty, done) = index.read_changes(tail, 10).await.unwrap();
        assert!(empty.is_empty());
        assert!(done);

        let (all, _) = index.read_changes(0, 1000).await.unwrap();
        assert_eq!(all.len(), total);
    }

    #[tokio::test]
    async fn test_series_completeness_emits_change() {
        let index = store().await;

        let mut first = instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.1", 10);
        first.summary.set_string(tags::NUMBER_OF_SLICES, "2");
        first.identity = InstanceIdentity::from_map(&first.summary).unwrap();
        index.store_instance(&first, &NO_QUOTA).await.unwrap();

        let (series_id, _) = index.lookup_resource("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(
            index.series_status(series_id).await.unwrap(),
            SeriesStatus::Missing
        );

        let second = instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.2", 10);
        let report = index.store_instance(&second, &NO_QUOTA).await.unwrap();
        assert_eq!(
            index.series_status(series_id).await.unwrap(),
            SeriesStatus::Complete
        );
        assert!(report
            .changes
            .iter()
            .any(|c| c.kind == ChangeKind::CompletedSeries));
    }

    #[tokio::test]
    async fn test_instance_metadata_and_attachment() {
        let index = store().await;
        let stored = instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 321);
        let uuid = stored.attachments[0].uuid.clone();
        index.store_instance(&stored, &NO_QUOTA).await.unwrap();

        let (id, _) = index.lookup_resource("1.2.3.4.5").await.unwrap().unwrap();
        let info = index
            .lookup_attachment(id, ContentType::Dicom)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.uuid, uuid);
        assert_eq!(info.compressed_size, 321);
        assert!(index
            .lookup_attachment(id, ContentType::DicomAsJson)
            .await
            .unwrap()
            .is_none());

        assert!(index
            .get_metadata(id, MetadataKind::ReceptionDate)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            index.get_metadata(id, MetadataKind::RemoteAet).await.unwrap().as_deref(),
            Some("TEST_SCU")
        );
        assert_eq!(
            index
                .get_metadata(id, MetadataKind::IndexInSeries)
                .await
                .unwrap()
                .as_deref(),
            Some("1")
        );
        assert!(index
            .get_metadata(id, MetadataKind::LastUpdate)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_identifier_lookup() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 1), &NO_QUOTA)
            .await
            .unwrap();

        let patients = index
            .lookup_identifier(tags::PATIENT_ID, "P1", ResourceLevel::Patient)
            .await
            .unwrap();
        assert_eq!(patients.len(), 1);

        // 检查层也能按患者身份检索
        let studies = index
            .lookup_identifier(tags::PATIENT_ID, "P1", ResourceLevel::Study)
            .await
            .unwrap();
        assert_eq!(studies.len(), 1);

        let by_accession = index
            .lookup_identifier(tags::ACCESSION_NUMBER, "ACC-1.2.3", ResourceLevel::Study)
            .await
            .unwrap();
        assert_eq!(by_accession, studies);

        let wildcard = index
            .lookup_identifier_wildcard(tags::SOP_INSTANCE_UID, "1.2.3.4.%", ResourceLevel::Instance)
            .await
            .unwrap();
        assert_eq!(wildcard.len(), 1);

        assert!(index
            .lookup_identifier(tags::PATIENT_ID, "P2", ResourceLevel::Patient)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_standalone_recycling() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.1", "1.1.1", "1.1.1.1", 10), &NO_QUOTA)
            .await
            .unwrap();
        index
            .store_instance(&instance("P2", "2.1", "2.1.1", "2.1.1.1", 10), &NO_QUOTA)
            .await
            .unwrap();

        // 配额收紧后，启动回收将存量清到界内
        let quotas = RecyclingQuotas {
            max_patient_count: 1,
            max_storage_size: 0,
        };
        let report = index.standalone_recycling(&quotas).await.unwrap();
        assert_eq!(report.recycled_instances, vec!["1.1.1.1".to_string()]);
        assert_eq!(index.global_counters().await.unwrap().patient_count, 1);
    }

    #[tokio::test]
    async fn test_exported_resources_window() {
        let index = store().await;
        for i in 0..3 {
            index
                .log_exported(
                    ResourceLevel::Instance,
                    &format!("1.2.3.4.{i}"),
                    "REMOTE",
                    "P1",
                    "1.2.3",
                    "1.2.3.4",
                    &format!("1.2.3.4.{i}"),
                )
                .await
                .unwrap();
        }

        let (first, done) = index.read_exported(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(!done);
        let (rest, done) = index.read_exported(first.last().unwrap().seq, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(done);
        assert_eq!(rest[0].remote_aet, "REMOTE");
    }

    #[tokio::test]
    async fn test_child_instance_walk() {
        let index = store().await;
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.4", "1.2.3.4.5", 1), &NO_QUOTA)
            .await
            .unwrap();
        index
            .store_instance(&instance("P1", "1.2.3", "1.2.3.9", "1.2.3.9.1", 1), &NO_QUOTA)
            .await
            .unwrap();

        let mut all = index.get_child_instances("1.2.3").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["1.2.3.4.5".to_string(), "1.2.3.9.1".to_string()]);

        let (study_id, _) = index.lookup_resource("1.2.3").await.unwrap().unwrap();
        let representative = index.find_child_instance(study_id).await.unwrap().unwrap();
        assert_eq!(
            index.get_level(representative).await.unwrap(),
            ResourceLevel::Instance
        );
    }
}
