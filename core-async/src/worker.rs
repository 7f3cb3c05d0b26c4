//! Sequential background job queue.
//!
//! [`WorkQueue`] moves slow work (disk writes, mostly) off a latency-sensitive
//! task. Jobs run one at a time in submission order on a single spawned
//! worker, so two jobs touching the same file never interleave.
//!
//! The worker stops once every handle to the queue is dropped and the backlog
//! is drained.

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace};

use crate::sync::{mpsc, oneshot};
use crate::task::{self, JoinHandle};

enum Message {
    Run(BoxFuture<'static, ()>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WorkQueue {
    name: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl WorkQueue {
    /// Spawns the worker task and returns a handle to submit jobs.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime context.
    pub fn spawn(name: impl Into<String>) -> Self {
        let (queue, _handle) = Self::spawn_with_handle(name);
        queue
    }

    /// Like [`WorkQueue::spawn`], also returning the worker's join handle.
    pub fn spawn_with_handle(name: impl Into<String>) -> (Self, JoinHandle<()>) {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = task::spawn(run_worker(name.clone(), receiver));
        (Self { name, sender }, handle)
    }

    /// Queues `job`. Returns `false` if the worker has stopped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.sender.send(Message::Run(job.boxed())).is_ok()
    }

    /// Waits until every job submitted before this call has finished.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

async fn run_worker(name: String, mut receiver: mpsc::UnboundedReceiver<Message>) {
    debug!(queue = %name, "work queue started");
    let mut completed: u64 = 0;
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Run(job) => {
                job.await;
                completed += 1;
                trace!(queue = %name, completed, "job finished");
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(queue = %name, completed, "work queue stopped");
}
