//! Storage seams for the HTTP layer and the dispatch queue.
//!
//! [`crate::db::DbHandle`] implements both traits on PostgreSQL.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Advertisement, AdvertisementPatch, NewAdvertisement, NewUser, User, UserPatch,
};
use crate::DispatchTask;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The write clashes with existing rows (unique key, dependent rows).
    #[error("{0}")]
    Conflict(String),
    /// The write references rows that do not exist.
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Users and advertisements.
///
/// `update_*` and `delete_*` return `false` when no row has the given id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn user(&self, id: i32) -> Result<Option<User>, StoreError>;
    async fn create_user(&self, user: &NewUser) -> Result<i32, StoreError>;
    async fn update_user(&self, id: i32, patch: &UserPatch) -> Result<bool, StoreError>;
    async fn delete_user(&self, id: i32) -> Result<bool, StoreError>;
    /// Every user's address, in id order.
    async fn user_emails(&self) -> Result<Vec<String>, StoreError>;

    async fn advertisement(&self, id: i32) -> Result<Option<Advertisement>, StoreError>;
    async fn create_advertisement(&self, adv: &NewAdvertisement) -> Result<i32, StoreError>;
    async fn update_advertisement(
        &self,
        id: i32,
        patch: &AdvertisementPatch,
    ) -> Result<bool, StoreError>;
    async fn delete_advertisement(&self, id: i32) -> Result<bool, StoreError>;
}

/// Durable state of dispatch tasks.
///
/// `complete_task` and `fail_task` only move tasks that are still pending and
/// return whether they did, which keeps the status monotonic.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn submit_task(&self, id: Uuid, recipients: &[String]) -> Result<(), StoreError>;
    async fn get_task(&self, id: Uuid) -> Result<Option<DispatchTask>, StoreError>;
    /// Atomically moves up to `limit` queued tasks to processing and returns them.
    async fn claim_queued_tasks(&self, limit: i64) -> Result<Vec<DispatchTask>, StoreError>;
    async fn complete_task(&self, id: Uuid, result: &str) -> Result<bool, StoreError>;
    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, StoreError>;
    /// Puts tasks orphaned in processing by a previous run back in the queue.
    async fn reset_processing_tasks(&self) -> Result<u64, StoreError>;
}
