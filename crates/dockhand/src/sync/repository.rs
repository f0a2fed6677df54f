//! Container mirror repository.
//!
//! Every write is scoped to rows matching a container id (or a row id), so
//! reconciliation and executor status updates can interleave freely.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{ContainerRecord, ObservedContainer, OperationStatus};
use crate::db;

const SELECT_COLUMNS: &str = r#"
    SELECT id, container_id, name, image, status, operation_status, last_error,
           need_update, created_at, updated_at
    FROM container_records
"#;

#[derive(Debug, Clone)]
pub struct ContainerRecordRepository {
    pool: SqlitePool,
}

impl ContainerRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list_all(&self) -> Result<Vec<ContainerRecord>> {
        let records =
            sqlx::query_as::<_, ContainerRecord>(&format!("{SELECT_COLUMNS} ORDER BY name, id"))
                .fetch_all(&self.pool)
                .await
                .context("listing container records")?;
        Ok(records)
    }

    /// Most recently updated row for a container id.
    pub async fn get_by_container_id(&self, container_id: &str) -> Result<Option<ContainerRecord>> {
        let record = sqlx::query_as::<_, ContainerRecord>(&format!(
            "{SELECT_COLUMNS} WHERE container_id = ? ORDER BY updated_at DESC, id DESC LIMIT 1"
        ))
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching container record")?;
        Ok(record)
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let record = sqlx::query_as::<_, ContainerRecord>(&format!(
            "{SELECT_COLUMNS} WHERE name = ? ORDER BY updated_at DESC, id DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching container record by name")?;
        Ok(record)
    }

    /// Refresh engine-owned fields of every row for this container id.
    /// Returns the number of rows touched.
    pub async fn update_observed(&self, observed: &ObservedContainer) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE container_records
            SET name = ?, image = ?, status = ?, updated_at = ?
            WHERE container_id = ?
            "#,
        )
        .bind(&observed.name)
        .bind(&observed.image)
        .bind(&observed.status)
        .bind(db::now())
        .bind(&observed.container_id)
        .execute(&self.pool)
        .await
        .context("updating container record")?;
        Ok(result.rows_affected())
    }

    /// Point an existing row at a recreated container.
    pub async fn rebind(&self, row_id: i64, observed: &ObservedContainer) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE container_records
            SET container_id = ?, name = ?, image = ?, status = ?, need_update = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&observed.container_id)
        .bind(&observed.name)
        .bind(&observed.image)
        .bind(&observed.status)
        .bind(db::now())
        .bind(row_id)
        .execute(&self.pool)
        .await
        .context("rebinding container record")?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a row unless one already exists for the container id.
    ///
    /// The existence check and the insert are one statement, so two callers
    /// racing on the same id cannot both insert.
    pub async fn insert_if_absent(
        &self,
        observed: &ObservedContainer,
        operation_status: OperationStatus,
    ) -> Result<bool> {
        let now = db::now();
        let result = sqlx::query(
            r#"
            INSERT INTO container_records (
                container_id, name, image, status, operation_status, need_update,
                created_at, updated_at
            )
            SELECT ?, ?, ?, ?, ?, 0, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM container_records WHERE container_id = ?)
            "#,
        )
        .bind(&observed.container_id)
        .bind(&observed.name)
        .bind(&observed.image)
        .bind(&observed.status)
        .bind(operation_status)
        .bind(&now)
        .bind(&now)
        .bind(&observed.container_id)
        .execute(&self.pool)
        .await
        .context("inserting container record")?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a successful operation's resulting status.
    pub async fn update_status(&self, container_id: &str, status: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE container_records
            SET status = ?, operation_status = ?, last_error = NULL, updated_at = ?
            WHERE container_id = ?
            "#,
        )
        .bind(status)
        .bind(OperationStatus::Success)
        .bind(db::now())
        .bind(container_id)
        .execute(&self.pool)
        .await
        .context("updating container status")?;
        Ok(result.rows_affected())
    }

    pub async fn update_error(&self, container_id: &str, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE container_records
            SET operation_status = ?, last_error = ?, updated_at = ?
            WHERE container_id = ?
            "#,
        )
        .bind(OperationStatus::Failed)
        .bind(message)
        .bind(db::now())
        .bind(container_id)
        .execute(&self.pool)
        .await
        .context("updating container error")?;
        Ok(result.rows_affected())
    }

    pub async fn set_need_update_for_image(&self, image: &str, need_update: bool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE container_records
            SET need_update = ?, updated_at = ?
            WHERE image = ? AND need_update != ?
            "#,
        )
        .bind(need_update)
        .bind(db::now())
        .bind(image)
        .bind(need_update)
        .execute(&self.pool)
        .await
        .context("updating need_update flag")?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_container_id(&self, container_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM container_records WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("deleting container record")?;
        Ok(result.rows_affected())
    }

    /// Delete a row only if nobody touched it since `updated_at` was read.
    pub async fn delete_if_unchanged(&self, row_id: i64, updated_at: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM container_records WHERE id = ? AND updated_at = ?")
            .bind(row_id)
            .bind(updated_at)
            .execute(&self.pool)
            .await
            .context("deleting stale container record")?;
        Ok(result.rows_affected() > 0)
    }

    /// Keep one row per container id: latest `updated_at`, then latest
    /// `created_at`, then highest row id.
    pub async fn cleanup_duplicates(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM container_records
            WHERE id IN (
                SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                               PARTITION BY container_id
                               ORDER BY updated_at DESC, created_at DESC, id DESC
                           ) AS rn
                    FROM container_records
                )
                WHERE rn > 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("removing duplicate container records")?;
        Ok(result.rows_affected())
    }

    /// Raw insert used to reproduce legacy duplicate rows in tests.
    #[cfg(test)]
    pub(crate) async fn insert_raw(
        &self,
        container_id: &str,
        name: &str,
        created_at: &str,
        updated_at: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO container_records (container_id, name, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(container_id)
        .bind(name)
        .bind(created_at)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("inserting raw record")?;
        Ok(result.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> ContainerRecordRepository {
        let db = Database::in_memory().await.unwrap();
        ContainerRecordRepository::new(db.pool().clone())
    }

    fn observed(id: &str, name: &str) -> ObservedContainer {
        ObservedContainer {
            container_id: id.to_string(),
            name: name.to_string(),
            image: "nginx:latest".to_string(),
            status: "running".to_string(),
        }
    }

    #[tokio::test]
    async fn cleanup_keeps_latest_updated_row() {
        let repo = repo().await;
        repo.insert_raw("abc", "old", "2024-01-01T00:00:00.000000Z", "2024-01-01T00:00:00.000000Z")
            .await
            .unwrap();
        let keep = repo
            .insert_raw("abc", "new", "2024-01-01T00:00:00.000000Z", "2024-03-01T00:00:00.000000Z")
            .await
            .unwrap();
        repo.insert_raw("abc", "mid", "2024-02-01T00:00:00.000000Z", "2024-02-01T00:00:00.000000Z")
            .await
            .unwrap();
        repo.insert_raw("def", "other", "2024-01-01T00:00:00.000000Z", "2024-01-01T00:00:00.000000Z")
            .await
            .unwrap();

        assert_eq!(repo.cleanup_duplicates().await.unwrap(), 2);

        let rows = repo.list_all().await.unwrap();
        assert_eq!(rows.len(), 2);
        let abc: Vec<_> = rows.iter().filter(|r| r.container_id == "abc").collect();
        assert_eq!(abc.len(), 1);
        assert_eq!(abc[0].id, keep);
        assert_eq!(abc[0].name, "new");

        // Nothing left to collapse.
        assert_eq!(repo.cleanup_duplicates().await.unwrap(), 0);
        assert_eq!(repo.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cleanup_breaks_ties_by_created_then_id() {
        let repo = repo().await;
        let ts = "2024-01-01T00:00:00.000000Z";
        repo.insert_raw("abc", "a", ts, ts).await.unwrap();
        let newest = repo.insert_raw("abc", "b", ts, ts).await.unwrap();
        repo.cleanup_duplicates().await.unwrap();
        let rows = repo.list_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, newest);
    }

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let repo = repo().await;
        let c = observed("abc", "web");
        assert!(repo.insert_if_absent(&c, OperationStatus::Success).await.unwrap());
        assert!(!repo.insert_if_absent(&c, OperationStatus::Success).await.unwrap());
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_and_error_updates_are_row_scoped() {
        let repo = repo().await;
        repo.insert_if_absent(&observed("abc", "web"), OperationStatus::Success)
            .await
            .unwrap();
        repo.insert_if_absent(&observed("def", "db"), OperationStatus::Success)
            .await
            .unwrap();

        assert_eq!(repo.update_error("abc", "port already allocated").await.unwrap(), 1);
        let abc = repo.get_by_container_id("abc").await.unwrap().unwrap();
        assert_eq!(abc.operation_status, OperationStatus::Failed);
        assert_eq!(abc.last_error.as_deref(), Some("port already allocated"));

        assert_eq!(repo.update_status("abc", "stopped").await.unwrap(), 1);
        let abc = repo.get_by_container_id("abc").await.unwrap().unwrap();
        assert_eq!(abc.status, "stopped");
        assert_eq!(abc.operation_status, OperationStatus::Success);
        assert!(abc.last_error.is_none());

        let def = repo.get_by_container_id("def").await.unwrap().unwrap();
        assert_eq!(def.status, "running");
        assert_eq!(repo.update_status("missing", "stopped").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_if_unchanged_skips_touched_rows() {
        let repo = repo().await;
        repo.insert_if_absent(&observed("abc", "web"), OperationStatus::Success)
            .await
            .unwrap();
        let row = repo.get_by_container_id("abc").await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        repo.update_status("abc", "stopped").await.unwrap();

        assert!(!repo.delete_if_unchanged(row.id, &row.updated_at).await.unwrap());
        let row = repo.get_by_container_id("abc").await.unwrap().unwrap();
        assert!(repo.delete_if_unchanged(row.id, &row.updated_at).await.unwrap());
    }
}
