//! FIFO gate that runs async tasks strictly one at a time.
//!
//! Tasks are pushed onto an unbounded channel and drained by a single
//! consumer task, so the order of [`Sequencer::enqueue`] calls is the order
//! in which tasks run, however many callers enqueue concurrently. Used for
//! the per-kernel execution queue, and for anything else that must be
//! single-flight per resource (completion requests, for example).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use tokio::sync::{mpsc, oneshot};

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const WITHDRAWN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SequencerError {
    #[error("Task was withdrawn before it started")]
    Withdrawn,
    #[error("Task was dropped without completing")]
    Dropped,
}

struct Job {
    state: Arc<AtomicU8>,
    task: BoxFuture<'static, ()>,
}

/// A FIFO task gate. Cloning shares the same queue.
#[derive(Clone)]
pub struct Sequencer {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
}

impl Sequencer {
    /// Create a sequencer and spawn its consumer. Needs a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));

        let consumer_depth = Arc::clone(&depth);
        let consumer_name = Arc::clone(&name);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let claimed = job
                    .state
                    .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if claimed {
                    job.task.await;
                } else {
                    debug!("[sequencer:{}] Skipping withdrawn task", consumer_name);
                }
                consumer_depth.fetch_sub(1, Ordering::AcqRel);
            }
            debug!("[sequencer:{}] Queue closed", consumer_name);
        });

        Self { name, tx, depth }
    }

    /// Queue `task` behind everything enqueued before it.
    pub fn enqueue<F, T>(&self, task: F) -> Sequenced<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(QUEUED));
        let job = Job {
            state: Arc::clone(&state),
            task: async move {
                let output = task.await;
                // The caller may have dropped its handle; the task still ran.
                let _ = done_tx.send(output);
            }
            .boxed(),
        };

        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            debug!("[sequencer:{}] Enqueue after shutdown", self.name);
        }
        Sequenced { state, rx: done_rx }
    }

    /// Tasks waiting or running.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a task in a [`Sequencer`]. Resolves with the task's output.
///
/// Dropping the handle does not cancel the task.
pub struct Sequenced<T> {
    state: Arc<AtomicU8>,
    rx: oneshot::Receiver<T>,
}

impl<T> Sequenced<T> {
    /// Remove the task from the queue. Fails once the task has started.
    pub fn withdraw(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, WITHDRAWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_withdrawn(&self) -> bool {
        self.state.load(Ordering::Acquire) == WITHDRAWN
    }

    pub fn has_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }
}

impl<T> Future for Sequenced<T> {
    type Output = Result<T, SequencerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(Ok(output)),
            Poll::Ready(Err(_)) if self.is_withdrawn() => {
                Poll::Ready(Err(SequencerError::Withdrawn))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(SequencerError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tasks_run_in_enqueue_order() {
        let sequencer = Sequencer::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let log = Arc::clone(&log);
                sequencer.enqueue(async move {
                    // Later tasks finish faster; order must still hold.
                    tokio::time::sleep(Duration::from_millis(20 - i)).await;
                    log.lock().unwrap().push(i);
                    i * 2
                })
            })
            .collect();

        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap());
        }
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(outputs, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_tasks_never_overlap() {
        let sequencer = Sequencer::new("test");
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                sequencer.enqueue(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_from_many_tasks() {
        let sequencer = Sequencer::new("test");
        let ran = Arc::new(Mutex::new(Vec::new()));
        // Enqueue and record under one lock so the recorded order is the
        // real enqueue order even with callers on several threads.
        let enqueued = Arc::new(Mutex::new(Vec::new()));

        let mut spawned = Vec::new();
        for i in 0..32 {
            let sequencer = sequencer.clone();
            let ran = Arc::clone(&ran);
            let enqueued = Arc::clone(&enqueued);
            spawned.push(tokio::spawn(async move {
                let handle = {
                    let mut order = enqueued.lock().unwrap();
                    order.push(i);
                    sequencer.enqueue(async move {
                        ran.lock().unwrap().push(i);
                    })
                };
                handle.await.unwrap();
            }));
        }
        for task in spawned {
            task.await.unwrap();
        }

        assert_eq!(*ran.lock().unwrap(), *enqueued.lock().unwrap());
    }

    #[tokio::test]
    async fn test_withdraw_before_start() {
        let sequencer = Sequencer::new("test");
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = sequencer.enqueue(async move {
            let _ = release_rx.await;
        });
        let victim = {
            let ran = Arc::clone(&ran);
            sequencer.enqueue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        let after = sequencer.enqueue(async { "after" });

        assert_eq!(sequencer.len(), 3);
        assert!(victim.withdraw());
        assert!(victim.is_withdrawn());

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        assert_eq!(after.await.unwrap(), "after");
        assert_eq!(victim.await.unwrap_err(), SequencerError::Withdrawn);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(sequencer.is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_after_start_is_refused() {
        let sequencer = Sequencer::new("test");
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = sequencer.enqueue(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            7
        });
        started_rx.await.unwrap();

        assert!(running.has_started());
        assert!(!running.withdraw());
        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let sequencer = Sequencer::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            drop(sequencer.enqueue(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sequencer.enqueue(async {}).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
