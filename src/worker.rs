use crate::notifier::Notifier;
use crate::DispatchTask;
use async_channel::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

#[derive(Debug)]
pub enum WorkMessage {
    JobCompleted(Uuid, String),
    JobFailed(Uuid, String),
}

pub async fn start(
    cancel_token: CancellationToken,
    notifier: Arc<Notifier>,
    recv_from_queue: Receiver<DispatchTask>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            task = recv_from_queue.recv() => {
                match task {
                    Err(err) => {
                        error!(message = "Error receiving task by worker, exiting", error = ?err);
                        break;
                    },
                    Ok(task) => {
                        let message = process(&notifier, task).await;
                        if send_to_server.send(message).is_err() {
                            // Server is gone; the task stays PROCESSING and is re-queued on restart
                            error!("Server channel closed, worker exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip(notifier, task), fields(task_id = %task.id))]
async fn process(notifier: &Notifier, task: DispatchTask) -> WorkMessage {
    match notifier.notify(&task.recipients).await {
        Ok(message) => WorkMessage::JobCompleted(task.id, message),
        Err(err) => WorkMessage::JobFailed(task.id, err.to_string()),
    }
}
