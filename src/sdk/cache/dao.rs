//! 本地键值缓存数据访问层（DAO）
//!
//! 表结构由 sqlx migration 管理（`local_kv_cache`）。

use anyhow::{Context, Result};
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 键值缓存 DAO（基于 sqlx）
#[derive(Clone)]
pub struct KvCacheDao {
    db: Pool<Sqlite>,
}

impl KvCacheDao {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 读取一条缓存记录
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM local_kv_cache WHERE cache_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await
        .context("查询本地缓存失败")?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// 写入一条缓存记录，覆盖旧值
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let sql = r#"
            INSERT INTO local_kv_cache (cache_key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
        "#;

        sqlx::query(sql)
            .bind(key)
            .bind(value)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&self.db)
            .await
            .context("写入本地缓存失败")?;
        debug!("[CacheDAO] 写入缓存 key={}, {} 字节", key, value.len());
        Ok(())
    }

    /// 删除一条缓存记录
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM local_kv_cache WHERE cache_key = ?
            "#,
        )
        .bind(key)
        .execute(&self.db)
        .await
        .context("删除本地缓存失败")?;
        debug!("[CacheDAO] 删除缓存 key={}", key);
        Ok(())
    }
}
