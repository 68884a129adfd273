//! In-process transport. For debugging and pipeline development.
//!
//! Each worker runs on its own task with a private request channel; all
//! asynchronous replies funnel into one shared queue consumed by
//! `next_reply`. Blocking requests carry their own return channel and
//! never touch the shared queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Result, TrainError};

use super::{AbstractManager, AbstractWorker, Blob, WorkerFactory};

/// Registry key of the in-process transport.
pub const MULTI_THREAD_MANAGER: &str = "multi_thread";

enum ReplyRoute {
    /// Deliver to the shared reply queue.
    Queue,
    /// Deliver to the issuer of a blocking request.
    Direct(oneshot::Sender<Result<Blob>>),
}

struct RequestEnvelope {
    blob: Blob,
    route: ReplyRoute,
}

pub struct MultiThreadManager {
    request_txs: StdMutex<Vec<mpsc::UnboundedSender<RequestEnvelope>>>,
    reply_rx: Mutex<mpsc::UnboundedReceiver<Result<Blob>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    next_worker: AtomicUsize,
}

impl MultiThreadManager {
    /// Spawns `num_workers` workers, each set up with the welcome blob.
    pub fn new(num_workers: usize, factory: &WorkerFactory, welcome: Blob) -> Result<Self> {
        if num_workers == 0 {
            return Err(TrainError::invalid_argument(
                "multi_thread manager needs at least one worker",
            ));
        }

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut request_txs = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for worker_idx in 0..num_workers {
            let mut worker = factory();
            worker.setup(&welcome, worker_idx, num_workers)?;

            let (tx, mut rx) = mpsc::unbounded_channel::<RequestEnvelope>();
            let reply_tx = reply_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let result = worker.run_request(&envelope.blob);
                    match envelope.route {
                        ReplyRoute::Queue => {
                            let _ = reply_tx.send(result);
                        }
                        ReplyRoute::Direct(tx) => {
                            let _ = tx.send(result);
                        }
                    }
                }
                if let Err(e) = worker.done() {
                    tracing::warn!("worker #{worker_idx} shutdown error: {e}");
                }
            });
            request_txs.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            request_txs: StdMutex::new(request_txs),
            reply_rx: Mutex::new(reply_rx),
            workers: StdMutex::new(handles),
            num_workers,
            next_worker: AtomicUsize::new(0),
        })
    }

    fn send(&self, envelope: RequestEnvelope, worker_idx: Option<usize>) -> Result<()> {
        let txs = self
            .request_txs
            .lock()
            .map_err(|_| TrainError::internal("request channel lock poisoned"))?;
        if txs.is_empty() {
            return Err(TrainError::internal("manager is shut down"));
        }
        let worker_idx = match worker_idx {
            Some(idx) if idx < txs.len() => idx,
            Some(idx) => {
                return Err(TrainError::internal(format!(
                    "worker index {idx} out of range ({} workers)",
                    txs.len()
                )));
            }
            None => self.next_worker.fetch_add(1, Ordering::Relaxed) % txs.len(),
        };
        txs[worker_idx]
            .send(envelope)
            .map_err(|_| TrainError::internal(format!("worker #{worker_idx} is gone")))
    }
}

#[async_trait]
impl AbstractManager for MultiThreadManager {
    async fn blocking_request(&self, blob: Blob, worker_idx: Option<usize>) -> Result<Blob> {
        let (tx, rx) = oneshot::channel();
        self.send(
            RequestEnvelope {
                blob,
                route: ReplyRoute::Direct(tx),
            },
            worker_idx,
        )?;
        rx.await
            .map_err(|_| TrainError::internal("worker dropped a blocking request"))?
    }

    fn async_request(&self, blob: Blob, worker_idx: Option<usize>) -> Result<()> {
        self.send(
            RequestEnvelope {
                blob,
                route: ReplyRoute::Queue,
            },
            worker_idx,
        )
    }

    async fn next_reply(&self) -> Result<Blob> {
        let mut rx = self.reply_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| TrainError::internal("reply queue closed"))?
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    async fn done(&self) -> Result<()> {
        let txs = {
            let mut txs = self
                .request_txs
                .lock()
                .map_err(|_| TrainError::internal("request channel lock poisoned"))?;
            std::mem::take(&mut *txs)
        };
        drop(txs);

        let handles = {
            let mut handles = self
                .workers
                .lock()
                .map_err(|_| TrainError::internal("worker handle lock poisoned"))?;
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Echoes the request, prefixed with the worker index.
    struct EchoWorker {
        worker_idx: usize,
    }

    impl AbstractWorker for EchoWorker {
        fn setup(&mut self, _welcome: &[u8], worker_idx: usize, _num_workers: usize) -> Result<()> {
            self.worker_idx = worker_idx;
            Ok(())
        }

        fn run_request(&mut self, request: &[u8]) -> Result<Blob> {
            let mut reply = vec![self.worker_idx as u8];
            reply.extend_from_slice(request);
            Ok(reply)
        }
    }

    fn echo_factory() -> WorkerFactory {
        Arc::new(|| Box::new(EchoWorker { worker_idx: 0 }) as Box<dyn AbstractWorker>)
    }

    #[tokio::test]
    async fn test_blocking_request_addresses_worker() {
        let manager = MultiThreadManager::new(3, &echo_factory(), vec![]).unwrap();
        let reply = manager.blocking_request(vec![42], Some(2)).await.unwrap();
        assert_eq!(reply, vec![2, 42]);
        manager.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_async_replies_arrive_once_each() {
        let manager = MultiThreadManager::new(4, &echo_factory(), vec![]).unwrap();
        for worker_idx in 0..4 {
            manager.async_request(vec![7], Some(worker_idx)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            let reply = manager.next_reply().await.unwrap();
            assert_eq!(reply[1], 7);
            seen.push(reply[0]);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        manager.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_unaddressed_requests_round_robin() {
        let manager = MultiThreadManager::new(2, &echo_factory(), vec![]).unwrap();
        let first = manager.blocking_request(vec![0], None).await.unwrap();
        let second = manager.blocking_request(vec![0], None).await.unwrap();
        assert_ne!(first[0], second[0]);
        manager.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_worker() {
        let manager = MultiThreadManager::new(1, &echo_factory(), vec![]).unwrap();
        assert!(manager.async_request(vec![], Some(5)).is_err());
        manager.done().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_done_fail() {
        let manager = MultiThreadManager::new(1, &echo_factory(), vec![]).unwrap();
        manager.done().await.unwrap();
        assert!(manager.async_request(vec![], Some(0)).is_err());
    }
}
