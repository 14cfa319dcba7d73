//! In-memory doubles for the storage and mail seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::{
    Advertisement, AdvertisementPatch, NewAdvertisement, NewUser, User, UserPatch,
};
use crate::notifier::{MailTransport, NotifyError};
use crate::store::{DispatchStore, RecordStore, StoreError};
use crate::{DispatchTask, Status};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    advertisements: Vec<Advertisement>,
    tasks: Vec<DispatchTask>,
    next_user: i32,
    next_adv: i32,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    reject_settles: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_task(&self, task: DispatchTask) {
        self.tables.lock().unwrap().tasks.push(task);
    }

    /// While set, `complete_task` and `fail_task` fail like a lost connection.
    pub fn reject_settles(&self, reject: bool) {
        self.reject_settles.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn user(&self, id: i32) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn create_user(&self, user: &NewUser) -> Result<i32, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict(
                "User with this email already exists".to_string(),
            ));
        }
        tables.next_user += 1;
        let id = tables.next_user;
        tables.users.push(User {
            id,
            name: user.name.clone(),
            email: user.email.clone(),
            password: user.password.clone(),
        });
        Ok(id)
    }

    async fn update_user(&self, id: i32, patch: &UserPatch) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(email) = &patch.email {
            if tables.users.iter().any(|u| u.id != id && &u.email == email) {
                return Err(StoreError::Conflict(
                    "User with this email already exists".to_string(),
                ));
            }
        }
        let Some(user) = tables.users.iter_mut().find(|u| u.id == id) else {
            return Ok(false);
        };
        if let Some(name) = &patch.name {
            user.name = name.clone();
        }
        if let Some(email) = &patch.email {
            user.email = email.clone();
        }
        if let Some(password) = &patch.password {
            user.password = password.clone();
        }
        Ok(true)
    }

    async fn delete_user(&self, id: i32) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.advertisements.iter().any(|a| a.owner == Some(id)) {
            return Err(StoreError::Conflict(
                "User still owns advertisements".to_string(),
            ));
        }
        let before = tables.users.len();
        tables.users.retain(|u| u.id != id);
        Ok(tables.users.len() < before)
    }

    async fn user_emails(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.iter().map(|u| u.email.clone()).collect())
    }

    async fn advertisement(&self, id: i32) -> Result<Option<Advertisement>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.advertisements.iter().find(|a| a.id == id).cloned())
    }

    async fn create_advertisement(&self, adv: &NewAdvertisement) -> Result<i32, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(owner) = adv.owner {
            if !tables.users.iter().any(|u| u.id == owner) {
                return Err(StoreError::Invalid("Owner does not exist".to_string()));
            }
        }
        tables.next_adv += 1;
        let id = tables.next_adv;
        tables.advertisements.push(Advertisement {
            id,
            header: adv.header.clone(),
            description: adv.description.clone(),
            registration_time: Utc::now(),
            owner: adv.owner,
        });
        Ok(id)
    }

    async fn update_advertisement(
        &self,
        id: i32,
        patch: &AdvertisementPatch,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(Some(owner)) = patch.owner {
            if !tables.users.iter().any(|u| u.id == owner) {
                return Err(StoreError::Invalid("Owner does not exist".to_string()));
            }
        }
        let Some(adv) = tables.advertisements.iter_mut().find(|a| a.id == id) else {
            return Ok(false);
        };
        if let Some(header) = &patch.header {
            adv.header = header.clone();
        }
        if let Some(description) = &patch.description {
            adv.description = description.clone();
        }
        if let Some(owner) = patch.owner {
            adv.owner = owner;
        }
        Ok(true)
    }

    async fn delete_advertisement(&self, id: i32) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.advertisements.len();
        tables.advertisements.retain(|a| a.id != id);
        Ok(tables.advertisements.len() < before)
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn submit_task(&self, id: Uuid, recipients: &[String]) -> Result<(), StoreError> {
        self.insert_task(DispatchTask {
            id,
            recipients: recipients.to_vec(),
            status: Status::Queued,
            result: None,
        });
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<DispatchTask>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn claim_queued_tasks(&self, limit: i64) -> Result<Vec<DispatchTask>, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(tables
            .tasks
            .iter_mut()
            .filter(|t| t.status == Status::Queued)
            .take(limit)
            .map(|t| {
                t.status = Status::Processing;
                t.clone()
            })
            .collect())
    }

    async fn complete_task(&self, id: Uuid, result: &str) -> Result<bool, StoreError> {
        self.settle(id, Status::Completed, result)
    }

    async fn fail_task(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        self.settle(id, Status::Failed, error)
    }

    async fn reset_processing_tasks(&self) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let mut reset = 0;
        for task in tables.tasks.iter_mut().filter(|t| t.status == Status::Processing) {
            task.status = Status::Queued;
            reset += 1;
        }
        Ok(reset)
    }
}

impl MemoryStore {
    fn settle(&self, id: Uuid, status: Status, result: &str) -> Result<bool, StoreError> {
        if self.reject_settles.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut tables = self.tables.lock().unwrap();
        match tables
            .tasks
            .iter_mut()
            .find(|t| t.id == id && !t.status.is_terminal())
        {
            Some(task) => {
                task.status = status;
                task.result = Some(result.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Records what the notifier asked of it; can fail on open or on one address,
/// and can hold `open` until released.
#[derive(Default)]
pub struct FakeTransport {
    auth_error: Option<String>,
    reject: Option<String>,
    gate: Option<Arc<Semaphore>>,
    opened: AtomicUsize,
    delivered: Mutex<Vec<(String, String)>>,
}

impl FakeTransport {
    pub fn failing_auth(error: &str) -> Self {
        Self {
            auth_error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn rejecting(recipient: &str) -> Self {
        Self {
            reject: Some(recipient.to_string()),
            ..Self::default()
        }
    }

    /// `open` blocks until the returned semaphore gets a permit.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (transport, gate)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn open(&self) -> Result<(), NotifyError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        match &self.auth_error {
            Some(error) => Err(NotifyError::Session(error.clone())),
            None => Ok(()),
        }
    }

    async fn deliver(&self, recipient: &str, body: &str) -> Result<(), NotifyError> {
        if self.reject.as_deref() == Some(recipient) {
            return Err(NotifyError::Delivery {
                recipient: recipient.to_string(),
                reason: "550 mailbox unavailable".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((recipient.to_string(), body.to_string()));
        Ok(())
    }
}
