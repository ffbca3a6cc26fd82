//! 索引数据库连接管理

use medvault_core::{ArchiveError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite连接句柄
///
/// 连接池上限固定为1：索引是单写者引擎，所有语句在同一连接上
/// 串行执行，内存库也因此在池的生命周期内保持稳定。
pub struct IndexConnection {
    pool: SqlitePool,
}

impl IndexConnection {
    /// 打开文件数据库，不存在时创建
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// 打开内存数据库，主要用于测试与一次性运行
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ArchiveError::Database(e.to_string()))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ArchiveError::Database(e.to_string()))?;

        let connection = IndexConnection { pool };
        connection.create_tables().await?;
        Ok(connection)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 创建数据库表
    async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS Resources(
                internalId INTEGER PRIMARY KEY AUTOINCREMENT,
                resourceType INTEGER NOT NULL,
                publicId TEXT NOT NULL UNIQUE,
                parentId INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS MainDicomTags(
                id INTEGER NOT NULL,
                tagGroup INTEGER NOT NULL,
                tagElement INTEGER NOT NULL,
                value TEXT,
                PRIMARY KEY(id, tagGroup, tagElement)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS DicomIdentifiers(
                id INTEGER NOT NULL,
                tagGroup INTEGER NOT NULL,
                tagElement INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY(id, tagGroup, tagElement)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS Metadata(
                id INTEGER NOT NULL,
                type INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY(id, type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS AttachedFiles(
                id INTEGER NOT NULL,
                fileType INTEGER NOT NULL,
                uuid TEXT NOT NULL,
                compressedSize INTEGER NOT NULL,
                uncompressedSize INTEGER NOT NULL,
                compressionType INTEGER NOT NULL,
                uncompressedMD5 TEXT,
                compressedMD5 TEXT,
                PRIMARY KEY(id, fileType)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS Changes(
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                changeType INTEGER NOT NULL,
                resourceType INTEGER NOT NULL,
                publicId TEXT NOT NULL,
                date TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ExportedResources(
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                resourceType INTEGER NOT NULL,
                publicId TEXT NOT NULL,
                remoteAet TEXT NOT NULL,
                patientId TEXT NOT NULL,
                studyUid TEXT NOT NULL,
                seriesUid TEXT NOT NULL,
                sopUid TEXT NOT NULL,
                date TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS PatientRecyclingOrder(
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                patientId INTEGER NOT NULL UNIQUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS GlobalProperties(
                name TEXT PRIMARY KEY,
                value TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_resources_public_id ON Resources(publicId)",
            "CREATE INDEX IF NOT EXISTS idx_resources_parent ON Resources(parentId)",
            "CREATE INDEX IF NOT EXISTS idx_resources_type ON Resources(resourceType)",
            "CREATE INDEX IF NOT EXISTS idx_main_tags_id ON MainDicomTags(id)",
            "CREATE INDEX IF NOT EXISTS idx_identifiers_value \
             ON DicomIdentifiers(tagGroup, tagElement, value)",
            "CREATE INDEX IF NOT EXISTS idx_attached_files_id ON AttachedFiles(id)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ArchiveError::Database(e.to_string()))?;
        }

        tracing::debug!("index schema ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_creates_schema() {
        let connection = IndexConnection::open_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Resources")
            .fetch_one(connection.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let connection = IndexConnection::open(&path).await.unwrap();
        sqlx::query("INSERT INTO GlobalProperties VALUES('version', '1')")
            .execute(connection.pool())
            .await
            .unwrap();
        assert!(path.exists());
    }
}
