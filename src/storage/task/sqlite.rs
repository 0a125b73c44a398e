use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Schema, SqlErr, SqlxSqliteConnector,
};
use sea_query::Expr;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::entity::{ActiveModel as TaskActiveModel, Column, Entity as TaskEntity};
use super::{StatusUpdate, StoreError, TaskStats, TaskStorage, UpdateOutcome};
use crate::schedule::types::{Task, TaskStatus};

pub struct SqliteTaskStorage {
    db: DatabaseConnection,
}

impl SqliteTaskStorage {
    /// Wrap a shared pool and create the task table if it is missing.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        info!("Initializing SQLite task storage");
        let db = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool);
        let storage = Self { db };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let mut table = schema.create_table_from_entity(TaskEntity);
        table.if_not_exists();
        self.db.execute(backend.build(&table)).await?;

        for mut index in schema.create_index_from_entity(TaskEntity) {
            index.if_not_exists();
            self.db.execute(backend.build(&index)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStorage for SqliteTaskStorage {
    async fn create(&self, id: &str, filename: &str) -> Result<Task, StoreError> {
        let task = Task::new(id, filename);
        let model = TaskActiveModel::from(task)
            .insert(&self.db)
            .await
            .map_err(|e| match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::DuplicateId(id.to_string()),
                _ => StoreError::Database(e),
            })?;
        Ok(model.into())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let model = TaskEntity::find_by_id(id.to_string()).one(&self.db).await?;
        Ok(model.map(Task::from))
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let models = TaskEntity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Task::from).collect())
    }

    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let models = TaskEntity::find()
            .filter(Column::Id.is_in(ids.iter().cloned()))
            .order_by_desc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Task::from).collect())
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<UpdateOutcome, StoreError> {
        let status = update.status();
        let no_text: Option<String> = None;
        let no_time: Option<DateTime<Utc>> = None;

        let mut query = TaskEntity::update_many().col_expr(Column::Status, Expr::value(status.as_str()));
        query = match update {
            StatusUpdate::Processing => query
                .col_expr(Column::Result, Expr::value(no_text.clone()))
                .col_expr(Column::Error, Expr::value(no_text))
                .col_expr(Column::CompletedAt, Expr::value(no_time)),
            StatusUpdate::Completed { result } => query
                .col_expr(Column::Result, Expr::value(Some(result)))
                .col_expr(Column::CompletedAt, Expr::value(Some(Utc::now())))
                .col_expr(Column::Error, Expr::value(no_text)),
            StatusUpdate::Failed { error } => query
                .col_expr(Column::Error, Expr::value(Some(error)))
                .col_expr(Column::Result, Expr::value(no_text))
                .col_expr(Column::CompletedAt, Expr::value(no_time)),
        };

        let predecessors = status.predecessors().iter().map(|s| s.as_str());
        let result = query
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(predecessors))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            return Ok(UpdateOutcome::Updated);
        }

        match self.get(id).await? {
            None => {
                warn!("Task {} no longer exists, skipping update to {}", id, status);
                Ok(UpdateOutcome::NotFound)
            }
            Some(current) => {
                warn!(
                    "Task {} is {}, refusing transition to {}",
                    id, current.status, status
                );
                Ok(UpdateOutcome::Rejected(current.status))
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = TaskEntity::delete_by_id(id.to_string()).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    async fn stats(&self) -> Result<TaskStats, StoreError> {
        let counts: Vec<(TaskStatus, i64)> = TaskEntity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut stats = TaskStats::default();
        for (status, count) in counts {
            let count = count.max(0) as u64;
            match status {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Processing => stats.processing = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}
