use crate::notifier::Notifier;
use crate::queue::TaskQueue;
use crate::worker::{self, WorkMessage};
use crate::DispatchTask;
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

/// Runs the dispatch queue until `cancel_token` fires.
///
/// Claims queued tasks while workers are free, hands them to the worker pool
/// and records each outcome. Wake-ups come from submissions, worker reports
/// and a periodic tick that also catches tasks queued by other processes.
pub async fn serve(
    cancel_token: CancellationToken,
    queue: TaskQueue,
    notifier: Arc<Notifier>,
    workers_count: u16,
    mut recv_from_client: mpsc::UnboundedReceiver<Uuid>,
) -> Result<(), Error> {
    let store = queue.store.clone();

    // Resubmit processing tasks (reset processing status to queued)
    let reset = store.reset_processing_tasks().await?;
    if reset > 0 {
        info!(message = "Re-queued interrupted tasks", count = reset);
    }

    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) =
        async_channel::bounded::<DispatchTask>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let notifier = notifier.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, notifier, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }

    let mut free_workers = workers_count as i64;
    let mut ticker = tokio::time::interval(queue.poll_interval().max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Outcomes the store has not accepted yet; retried on every wake-up
    let mut unsettled: Vec<Outcome> = vec![];

    loop {
        record_outcomes(&queue, &mut unsettled).await;

        if free_workers > 0 {
            match store.claim_queued_tasks(free_workers).await {
                Ok(tasks) => {
                    for task in tasks {
                        debug!(message = "Dispatching task", task_id = %task.id);
                        send_to_queue.send(task).await?;
                        free_workers -= 1;
                    }
                }
                Err(err) => error!(message = "Failed to claim queued tasks", error = %err),
            }
        }

        // Waiting for something to else to happen to continue...
        tokio::select! {
            // Handle cancellation
            _ = cancel_token.cancelled() => {
                debug!("Server Cancelled");
                break;
            },
            _ = ticker.tick() => {},
            // Handle responses from workers
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed unexpectedly, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(message) => {
                        free_workers += 1;
                        unsettled.push(outcome(message));
                    },
                }
            },
            // Handle wake-ups from clients
            chan_msg = recv_from_client.recv() => {
                match chan_msg {
                    None => {
                        debug!("Client channel closed, exiting");
                        cancel_token.cancel();
                        break;
                    },
                    Some(task_id) => {
                        debug!(message = "Requested task", task_id = %task_id);
                    }
                }
            }
        }
    }

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    // Workers may have finished a batch after cancellation; record it so a
    // restart does not send it again.
    drop(send_to_server);
    while let Some(message) = recv_from_worker.recv().await {
        unsettled.push(outcome(message));
    }
    record_outcomes(&queue, &mut unsettled).await;
    for (task_id, _) in &unsettled {
        error!(message = "Task outcome lost on shutdown, it will be re-queued", task_id = %task_id);
    }

    info!("Server stopped.");

    Ok(())
}

/// A finished task and its result text, `Err` when delivery failed.
type Outcome = (Uuid, Result<String, String>);

fn outcome(message: WorkMessage) -> Outcome {
    match message {
        WorkMessage::JobCompleted(task_id, message) => {
            debug!(message = "Completed task", task_id = %task_id);
            (task_id, Ok(message))
        }
        WorkMessage::JobFailed(task_id, error_msg) => {
            debug!(message = "Failed task", task_id = %task_id, error = %error_msg);
            (task_id, Err(error_msg))
        }
    }
}

/// Settles every pending outcome, keeping the ones the store rejected.
async fn record_outcomes(queue: &TaskQueue, unsettled: &mut Vec<Outcome>) {
    let mut rejected = vec![];
    for (task_id, result) in unsettled.drain(..) {
        let settled = match &result {
            Ok(message) => queue.store.complete_task(task_id, message).await,
            Err(error_msg) => queue.store.fail_task(task_id, error_msg).await,
        };
        match settled {
            Ok(true) => announce(queue, task_id),
            Ok(false) => warn!(message = "Task was already settled", task_id = %task_id),
            Err(err) => {
                error!(message = "Failed to record task outcome", task_id = %task_id, error = %err);
                rejected.push((task_id, result));
            }
        }
    }
    *unsettled = rejected;
}

fn announce(queue: &TaskQueue, task_id: Uuid) {
    // No receivers just means nobody is waiting on this task.
    let _ = queue.settled.send(task_id);
}
