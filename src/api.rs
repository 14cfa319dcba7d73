//! HTTP surface: entity CRUD and the bulk email dispatch endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    Advertisement, AdvertisementPatch, NewAdvertisement, NewUser, User, UserPatch,
};
use crate::queue::TaskQueue;
use crate::store::RecordStore;
use crate::TaskState;

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub tasks: TaskQueue,
    /// Cap on the `wait` query parameter of the task status endpoint.
    pub max_wait: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/email_send", post(send_to_all))
        .route("/email/:task_id", get(task_status))
        .route("/user", post(create_user))
        .route(
            "/user/:id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/adv", post(create_advertisement))
        .route(
            "/adv/:id",
            get(get_advertisement)
                .patch(update_advertisement)
                .delete(delete_advertisement),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct Saved {
    status: &'static str,
    id: i32,
}

impl Saved {
    fn ok(id: i32) -> Json<Self> {
        Json(Saved { status: "ok", id })
    }
}

#[derive(Serialize)]
struct Submitted {
    task_id: Uuid,
    message: &'static str,
}

#[derive(Serialize)]
struct TaskStatusBody {
    status: TaskState,
    result: Option<String>,
}

#[derive(Deserialize)]
struct WaitParams {
    /// Seconds to wait for the task to settle before answering.
    wait: Option<u64>,
}

async fn send_to_all(State(state): State<AppState>) -> ApiResult<Json<Submitted>> {
    let recipients = state.records.user_emails().await?;
    let count = recipients.len();
    let task_id = state.tasks.submit(recipients).await?;
    info!(message = "Bulk email queued", task_id = %task_id, recipients = count);

    Ok(Json(Submitted {
        task_id,
        message: "success",
    }))
}

/// Answers right away unless `wait` asks for a bounded wait. A task that is
/// still pending gets `202` with `Retry-After`, leaving retries to the client.
async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    query: Result<Query<WaitParams>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(params) = query?;
    let id = Uuid::parse_str(&task_id).map_err(|_| ApiError::NotFound("Task"))?;

    let task = match params.wait {
        Some(secs) if secs > 0 => {
            let timeout = Duration::from_secs(secs).min(state.max_wait);
            state.tasks.wait_settled(id, timeout).await?
        }
        _ => state.tasks.status(id).await?,
    }
    .ok_or(ApiError::NotFound("Task"))?;

    let body = TaskStatusBody {
        status: task.status.state(),
        result: task.result,
    };
    if task.status.is_terminal() {
        return Ok(Json(body).into_response());
    }

    let retry_after = state.tasks.poll_interval().as_secs().max(1).to_string();
    Ok((
        StatusCode::ACCEPTED,
        [(header::RETRY_AFTER, retry_after)],
        Json(body),
    )
        .into_response())
}

async fn get_user(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
) -> ApiResult<Json<User>> {
    let Path(id) = path?;
    let user = state.records.user(id).await?.ok_or(ApiError::NotFound("User"))?;
    Ok(Json(user))
}

async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> ApiResult<Json<Saved>> {
    let Json(new_user) = body?;
    new_user.validate().map_err(ApiError::Invalid)?;
    let id = state.records.create_user(&new_user).await?;
    Ok(Saved::ok(id))
}

async fn update_user(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
    body: Result<Json<UserPatch>, JsonRejection>,
) -> ApiResult<Json<Saved>> {
    let Path(id) = path?;
    let Json(patch) = body?;
    patch.validate().map_err(ApiError::Invalid)?;
    if !state.records.update_user(id, &patch).await? {
        return Err(ApiError::NotFound("User"));
    }
    Ok(Saved::ok(id))
}

async fn delete_user(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
) -> ApiResult<Json<Saved>> {
    let Path(id) = path?;
    if !state.records.delete_user(id).await? {
        return Err(ApiError::NotFound("User"));
    }
    Ok(Saved::ok(id))
}

async fn get_advertisement(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
) -> ApiResult<Json<Advertisement>> {
    let Path(id) = path?;
    let adv = state
        .records
        .advertisement(id)
        .await?
        .ok_or(ApiError::NotFound("Advertisement"))?;
    Ok(Json(adv))
}

async fn create_advertisement(
    State(state): State<AppState>,
    body: Result<Json<NewAdvertisement>, JsonRejection>,
) -> ApiResult<Json<Saved>> {
    let Json(new_adv) = body?;
    new_adv.validate().map_err(ApiError::Invalid)?;
    let id = state.records.create_advertisement(&new_adv).await?;
    Ok(Saved::ok(id))
}

async fn update_advertisement(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
    body: Result<Json<AdvertisementPatch>, JsonRejection>,
) -> ApiResult<Json<Saved>> {
    let Path(id) = path?;
    let Json(patch) = body?;
    patch.validate().map_err(ApiError::Invalid)?;
    if !state.records.update_advertisement(id, &patch).await? {
        return Err(ApiError::NotFound("Advertisement"));
    }
    Ok(Saved::ok(id))
}

async fn delete_advertisement(
    State(state): State<AppState>,
    path: Result<Path<i32>, PathRejection>,
) -> ApiResult<Json<Saved>> {
    let Path(id) = path?;
    if !state.records.delete_advertisement(id).await? {
        return Err(ApiError::NotFound("Advertisement"));
    }
    Ok(Saved::ok(id))
}
