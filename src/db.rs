use crate::models::{
    Advertisement, AdvertisementPatch, NewAdvertisement, NewUser, User, UserPatch,
};
use crate::store::{DispatchStore, RecordStore, StoreError};
use crate::{DispatchTask, Status};
use anyhow::Error;
use async_trait::async_trait;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

/// Turns a violation of the given kind into `mapped`; other errors stay database errors.
fn on_violation(err: sqlx::Error, kind: ErrorKind, mapped: StoreError) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.kind() == kind => mapped,
        _ => StoreError::Database(err),
    }
}

fn email_taken(err: sqlx::Error) -> StoreError {
    on_violation(
        err,
        ErrorKind::UniqueViolation,
        StoreError::Conflict("User with this email already exists".to_string()),
    )
}

fn unknown_owner(err: sqlx::Error) -> StoreError {
    on_violation(
        err,
        ErrorKind::ForeignKeyViolation,
        StoreError::Invalid("Owner does not exist".to_string()),
    )
}

impl DbHandle {
    #[instrument(name = "db.new", skip(url))]
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl RecordStore for DbHandle {
    async fn user(&self, id: i32) -> Result<Option<User>, StoreError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT id, name, email, password FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?,
        )
    }

    #[instrument(name = "db.create_user", skip_all)]
    async fn create_user(&self, user: &NewUser) -> Result<i32, StoreError> {
        sqlx::query_scalar(
            "INSERT INTO users (name, email, password) \
            VALUES ($1, $2, $3) \
            RETURNING id",
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password)
        .fetch_one(&*self.pool)
        .await
        .map_err(email_taken)
    }

    #[instrument(name = "db.update_user", skip(self, patch))]
    async fn update_user(&self, id: i32, patch: &UserPatch) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users \
                SET name = COALESCE($2, name), \
                email = COALESCE($3, email), \
                password = CASE WHEN $4 THEN $5 ELSE password END \
            WHERE id = $1",
        )
        .bind(id)
        .bind(&patch.name)
        .bind(&patch.email)
        .bind(patch.password.is_some())
        .bind(patch.password.clone().flatten())
        .execute(&*self.pool)
        .await
        .map_err(email_taken)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.delete_user", skip(self))]
    async fn delete_user(&self, id: i32) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|err| {
                on_violation(
                    err,
                    ErrorKind::ForeignKeyViolation,
                    StoreError::Conflict("User still owns advertisements".to_string()),
                )
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn user_emails(&self) -> Result<Vec<String>, StoreError> {
        debug!("Getting recipient list");
        Ok(sqlx::query_scalar("SELECT email FROM users ORDER BY id")
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn advertisement(&self, id: i32) -> Result<Option<Advertisement>, StoreError> {
        Ok(sqlx::query_as::<_, Advertisement>(
            "SELECT id, header, description, registration_time, owner \
            FROM advertisements \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.create_advertisement", skip_all)]
    async fn create_advertisement(&self, adv: &NewAdvertisement) -> Result<i32, StoreError> {
        sqlx::query_scalar(
            "INSERT INTO advertisements (header, description, owner) \
            VALUES ($1, $2, $3) \
            RETURNING id",
        )
        .bind(&adv.header)
        .bind(&adv.description)
        .bind(adv.owner)
        .fetch_one(&*self.pool)
        .await
        .map_err(unknown_owner)
    }

    #[instrument(name = "db.update_advertisement", skip(self, patch))]
    async fn update_advertisement(
        &self,
        id: i32,
        patch: &AdvertisementPatch,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE advertisements \
                SET header = COALESCE($2, header), \
                description = COALESCE($3, description), \
                owner = CASE WHEN $4 THEN $5 ELSE owner END \
            WHERE id = $1",
        )
        .bind(id)
        .bind(&patch.header)
        .bind(&patch.description)
        .bind(patch.owner.is_some())
        .bind(patch.owner.flatten())
        .execute(&*self.pool)
        .await
        .map_err(unknown_owner)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.delete_advertisement", skip(self))]
    async fn delete_advertisement(&self, id: i32) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM advertisements WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DispatchStore for DbHandle {
    #[instrument(name = "db.submit_task", skip(self, recipients), fields(recipients = recipients.len()))]
    async fn submit_task(&self, id: Uuid, recipients: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO dispatch_tasks \
            (id, recipients, status) \
            VALUES ($1, $2, 'QUEUED')",
        )
        .bind(id)
        .bind(recipients)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<DispatchTask>, StoreError> {
        Ok(sqlx::query_as::<_, DispatchTask>(
            "SELECT id, recipients, status, result \
            FROM dispatch_tasks \
            WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.claim_queued_tasks", skip(self))]
    async fn claim_queued_tasks(&self, limit: i64) -> Result<Vec<DispatchTask>, StoreError> {
        debug!("Claiming {} queued tasks", limit);
        Ok(sqlx::query_as::<_, DispatchTask>(
            "UPDATE dispatch_tasks \
                SET status = 'PROCESSING', \
                started_at = now() \
            WHERE id IN ( \
                SELECT id FROM dispatch_tasks \
                WHERE status = 'QUEUED' \
                ORDER BY created_at asc \
                LIMIT $1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, recipients, status, result",
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.complete_task", skip(self, result))]
    async fn complete_task(&self, id: Uuid, result: &str) -> Result<bool, StoreError> {
        settle(&self.pool, id, Status::Completed, result).await
    }

    #[instrument(name = "db.fail_task", skip(self))]
    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        settle(&self.pool, id, Status::Failed, error).await
    }

    async fn reset_processing_tasks(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE dispatch_tasks \
                SET status = 'QUEUED', \
                started_at = NULL \
            WHERE status = 'PROCESSING'",
        )
        .execute(&*self.pool)
        .await?;

        debug!("Reset {} processing tasks", result.rows_affected());
        Ok(result.rows_affected())
    }
}

async fn settle(pool: &PgPool, id: Uuid, status: Status, result: &str) -> Result<bool, StoreError> {
    let updated = sqlx::query(
        "UPDATE dispatch_tasks \
            SET status = $1, \
            result = $2, \
            duration = extract(epoch from now() - started_at) \
        WHERE id = $3 AND status IN ('QUEUED', 'PROCESSING')",
    )
    .bind(status)
    .bind(result)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}
