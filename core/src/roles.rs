// Named watched roots ("roles"), e.g. recordings or editing
// The watcher reconciles its per-role watchers against this table

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::Path;

/// A named directory the watcher may monitor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub role: String,
    pub abs_path: String,
    pub watch: bool,
}

#[derive(Clone)]
pub struct RoleStore {
    pool: SqlitePool,
}

impl RoleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn all(&self) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>("SELECT role, abs_path, watch FROM so_roles ORDER BY role")
            .fetch_all(&self.pool)
            .await?;
        Ok(roles)
    }

    /// Roles with watching enabled whose path still exists on disk
    pub async fn watched(&self) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            "SELECT role, abs_path, watch FROM so_roles WHERE watch = 1 ORDER BY role",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(roles
            .into_iter()
            .filter(|r| Path::new(&r.abs_path).is_dir())
            .collect())
    }

    pub async fn get(&self, role: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, Role>(
            "SELECT role, abs_path, watch FROM so_roles WHERE role = ?",
        )
        .bind(role)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set(&self, role: &str, abs_path: &Path, watch: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO so_roles (role, abs_path, watch)
            VALUES (?, ?, ?)
            ON CONFLICT(role) DO UPDATE SET
                abs_path = excluded.abs_path,
                watch = excluded.watch
            "#,
        )
        .bind(role)
        .bind(abs_path.to_string_lossy().as_ref())
        .bind(watch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_memory_pool};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_watched_filters_missing_paths() {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let store = RoleStore::new(pool);

        let dir = TempDir::new().unwrap();
        store.set("recordings", dir.path(), true).await.unwrap();
        store.set("archive", Path::new("/does/not/exist"), true).await.unwrap();
        store.set("editing", dir.path(), false).await.unwrap();

        let watched = store.watched().await.unwrap();
        assert_eq!(watched.len(), 1);
        assert_eq!(watched[0].role, "recordings");

        // Toggling watch off removes it from the watched view
        store.set("recordings", dir.path(), false).await.unwrap();
        assert!(store.watched().await.unwrap().is_empty());
        assert_eq!(store.all().await.unwrap().len(), 3);
    }
}
