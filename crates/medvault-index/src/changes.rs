//! 变更日志与导出审计的窗口读取
//!
//! 写入始终追加；读取消费 `[since, since + limit)` 的有界窗口，
//! `done` 在窗口触及当前尾部时为真。

use chrono::{DateTime, Utc};
use medvault_core::{
    ArchiveError, ChangeKind, ChangeRecord, ExportedResource, ResourceLevel, Result,
};
use sqlx::Row;
use tracing::debug;

use crate::store::IndexStore;

fn db_err(e: sqlx::Error) -> ArchiveError {
    ArchiveError::Database(e.to_string())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

impl IndexStore {
    /// 读取一页变更记录
    ///
    /// `since = 0` 表示从头开始；传入上一页最后的 `seq` 即可确定性
    /// 地翻页。`limit = 0` 时返回空页且 `done` 反映是否已到尾部。
    pub async fn read_changes(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<(Vec<ChangeRecord>, bool)> {
        let rows = sqlx::query(
            "SELECT seq, changeType, resourceType, publicId, date FROM Changes \
             WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(since as i64)
        .bind(limit as i64)
        .fetch_all(self.raw_pool())
        .await
        .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let kind_code: i64 = row.get(1);
            let level_code: i64 = row.get(2);
            let (Some(kind), Some(level)) = (
                ChangeKind::from_code(kind_code),
                ResourceLevel::from_code(level_code),
            ) else {
                return Err(ArchiveError::Database(format!(
                    "corrupted change record (kind {kind_code}, level {level_code})"
                )));
            };
            let date: String = row.get(4);
            records.push(ChangeRecord {
                seq: row.get::<i64, _>(0) as u64,
                kind,
                level,
                public_id: row.get(3),
                timestamp: parse_timestamp(&date),
            });
        }

        let tail: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM Changes")
            .fetch_one(self.raw_pool())
            .await
            .map_err(db_err)?;
        let done = match records.last() {
            Some(last) => last.seq as i64 >= tail,
            None => since as i64 >= tail,
        };

        debug!(
            "read {} change records since {} (done = {})",
            records.len(),
            since,
            done
        );
        Ok((records, done))
    }

    /// 追加一条导出审计记录
    pub async fn log_exported(
        &self,
        level: ResourceLevel,
        public_id: &str,
        remote_aet: &str,
        patient_id: &str,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> Result<ExportedResource> {
        let timestamp = Utc::now();
        let result = sqlx::query(
            "INSERT INTO ExportedResources(resourceType, publicId, remoteAet, patientId, \
             studyUid, seriesUid, sopUid, date) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(level.code())
        .bind(public_id)
        .bind(remote_aet)
        .bind(patient_id)
        .bind(study_uid)
        .bind(series_uid)
        .bind(instance_uid)
        .bind(medvault_core::utils::to_iso8601(&timestamp))
        .execute(self.raw_pool())
        .await
        .map_err(db_err)?;

        Ok(ExportedResource {
            seq: result.last_insert_rowid() as u64,
            level,
            public_id: public_id.to_string(),
            remote_aet: remote_aet.to_string(),
            patient_id: patient_id.to_string(),
            study_uid: study_uid.to_string(),
            series_uid: series_uid.to_string(),
            instance_uid: instance_uid.to_string(),
            timestamp,
        })
    }

    /// 读取一页导出审计，窗口语义与变更日志一致
    pub async fn read_exported(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<(Vec<ExportedResource>, bool)> {
        let rows = sqlx::query(
            "SELECT seq, resourceType, publicId, remoteAet, patientId, studyUid, seriesUid, \
             sopUid, date FROM ExportedResources WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(since as i64)
        .bind(limit as i64)
        .fetch_all(self.raw_pool())
        .await
        .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let level_code: i64 = row.get(1);
            let Some(level) = ResourceLevel::from_code(level_code) else {
                return Err(ArchiveError::Database(format!(
                    "corrupted exported record (level {level_code})"
                )));
            };
            let date: String = row.get(8);
            records.push(ExportedResource {
                seq: row.get::<i64, _>(0) as u64,
                level,
                public_id: row.get(2),
                remote_aet: row.get(3),
                patient_id: row.get(4),
                study_uid: row.get(5),
                series_uid: row.get(6),
                instance_uid: row.get(7),
                timestamp: parse_timestamp(&date),
            });
        }

        let tail: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM ExportedResources")
            .fetch_one(self.raw_pool())
            .await
            .map_err(db_err)?;
        let done = match records.last() {
            Some(last) => last.seq as i64 >= tail,
            None => since as i64 >= tail,
        };

        Ok((records, done))
    }
}
