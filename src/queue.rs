//! Client side of the dispatch queue: submit tasks and read their state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::store::{DispatchStore, StoreError};
use crate::DispatchTask;

const SETTLED_CAPACITY: usize = 64;

/// Handle shared by request handlers and the queue server.
///
/// Submissions wake the server over an mpsc channel; the server announces
/// settled task ids on a broadcast channel that [`TaskQueue::wait_settled`]
/// listens to.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) store: Arc<dyn DispatchStore>,
    send_to_server: mpsc::UnboundedSender<Uuid>,
    pub(crate) settled: broadcast::Sender<Uuid>,
    poll_interval: Duration,
}

impl TaskQueue {
    /// Returns the handle and the receiver the server loop consumes.
    pub fn new(
        store: Arc<dyn DispatchStore>,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        let (settled, _) = broadcast::channel(SETTLED_CAPACITY);
        let queue = TaskQueue {
            store,
            send_to_server,
            settled,
            poll_interval,
        };
        (queue, recv_from_client)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Queues a send to `recipients` and returns its id without waiting for delivery.
    #[instrument(skip_all, fields(recipients = recipients.len(), task_id))]
    pub async fn submit(&self, recipients: Vec<String>) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        tracing::Span::current().record("task_id", tracing::field::display(id));

        self.store.submit_task(id, &recipients).await?;

        // The row is durable; a server that is not listening picks it up on its next tick or start.
        if self.send_to_server.send(id).is_err() {
            warn!(message = "Queue server not running", task_id = %id);
        }
        debug!(message = "Submitted task", task_id = %id);
        Ok(id)
    }

    /// Current state of a task, `None` when the id was never issued.
    pub async fn status(&self, id: Uuid) -> Result<Option<DispatchTask>, StoreError> {
        self.store.get_task(id).await
    }

    /// Waits up to `timeout` for the task to settle and returns its latest state.
    ///
    /// Settlements by this process arrive over the broadcast channel; the row is
    /// also re-read every poll interval so tasks settled elsewhere are noticed.
    pub async fn wait_settled(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<Option<DispatchTask>, StoreError> {
        let mut settled = self.settled.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let Some(task) = self.store.get_task(id).await? else {
                return Ok(None);
            };
            if task.status.is_terminal() {
                return Ok(Some(task));
            }

            let recheck = tokio::time::sleep(self.poll_interval);
            tokio::pin!(recheck);
            loop {
                tokio::select! {
                    _ = &mut deadline => return Ok(Some(task)),
                    _ = &mut recheck => break,
                    event = settled.recv() => match event {
                        Ok(settled_id) if settled_id != id => continue,
                        // ours, or we lagged and may have missed it
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            (&mut recheck).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}
