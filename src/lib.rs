use serde::Serialize;
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notifier;
pub mod queue;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod test_support;

/// One asynchronous execution of the bulk email send.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DispatchTask {
    pub id: Uuid,
    pub recipients: Vec<String>,
    pub status: Status,
    pub result: Option<String>,
}

/// Internal queue status, as stored in `dispatch_tasks.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "dispatch_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    pub fn state(self) -> TaskState {
        match self {
            Status::Queued | Status::Processing => TaskState::Pending,
            Status::Completed => TaskState::Success,
            Status::Failed => TaskState::Failure,
        }
    }
}

/// Status as reported to clients polling a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Success,
    Failure,
}
