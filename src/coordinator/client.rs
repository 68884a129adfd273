//! Typed client over the abstract request/response transport.
//!
//! The client serializes [`WorkerRequest`]s, deserializes [`WorkerReply`]s
//! and factors the one fanout+gather shape every broadcast phase uses:
//! send W asynchronous requests, consume exactly W replies in arrival
//! order, and, if any reply carries `request_restart_iter`, drain the
//! remainder of the phase before surfacing `DataLoss`.

use crate::distribute::AbstractManager;
use crate::error::{Result, TrainError};

use super::protocol::{WorkerReply, WorkerRequest};

pub struct DistributionClient {
    manager: Box<dyn AbstractManager>,
}

impl DistributionClient {
    pub fn new(manager: Box<dyn AbstractManager>) -> Self {
        Self { manager }
    }

    pub fn num_workers(&self) -> usize {
        self.manager.num_workers()
    }

    /// Sends a request and waits for its reply. `None` lets the transport
    /// pick the worker.
    pub async fn blocking_request(
        &self,
        request: &WorkerRequest,
        worker_idx: Option<usize>,
    ) -> Result<WorkerReply> {
        let blob = self.manager.blocking_request(request.to_blob()?, worker_idx).await?;
        WorkerReply::from_blob(&blob)
    }

    /// Sends a request to one worker; the reply lands on the shared queue.
    pub fn async_request(&self, request: &WorkerRequest, worker_idx: usize) -> Result<()> {
        self.manager.async_request(request.to_blob()?, Some(worker_idx))
    }

    /// Sends a request to a transport-picked worker; the reply lands on
    /// the shared queue.
    pub fn async_request_any(&self, request: &WorkerRequest) -> Result<()> {
        self.manager.async_request(request.to_blob()?, None)
    }

    /// Waits for the next asynchronous reply, in arrival order.
    pub async fn next_reply(&self) -> Result<WorkerReply> {
        let blob = self.manager.next_reply().await?;
        WorkerReply::from_blob(&blob)
    }

    /// Consumes and discards `count` replies.
    pub async fn skip_replies(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.next_reply().await?;
        }
        Ok(())
    }

    /// Consumes exactly `expected` replies, visiting each one. When a reply
    /// carries `request_restart_iter`, the remaining replies of the phase
    /// are drained and discarded before `DataLoss` is returned; stale
    /// replies must never contaminate the next phase.
    pub async fn gather(
        &self,
        expected: usize,
        mut visit: impl FnMut(WorkerReply) -> Result<()>,
    ) -> Result<()> {
        for reply_idx in 0..expected {
            let reply = self.next_reply().await?;
            if reply.request_restart_iter {
                self.skip_replies(expected - reply_idx - 1).await?;
                return Err(TrainError::data_loss(format!(
                    "worker #{} requested an iteration restart",
                    reply.worker_idx
                )));
            }
            visit(reply)?;
        }
        Ok(())
    }

    /// Fanout+gather over every worker: one request per worker, exactly
    /// one reply per request.
    pub async fn broadcast(
        &self,
        mut make_request: impl FnMut(usize) -> WorkerRequest,
        visit: impl FnMut(WorkerReply) -> Result<()>,
    ) -> Result<()> {
        let num_workers = self.num_workers();
        for worker_idx in 0..num_workers {
            self.async_request(&make_request(worker_idx), worker_idx)?;
        }
        self.gather(num_workers, visit).await
    }

    /// Stops the workers.
    pub async fn shutdown(&self) -> Result<()> {
        self.manager.done().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coordinator::protocol::{ReplyPayload, RequestPayload};
    use crate::distribute::{AbstractWorker, Blob, MultiThreadManager, WorkerFactory};

    /// Acknowledges everything; flags `request_restart_iter` on
    /// `FindSplits` when constructed as lossy.
    struct ScriptedWorker {
        worker_idx: usize,
        lossy: bool,
    }

    impl AbstractWorker for ScriptedWorker {
        fn setup(&mut self, welcome: &[u8], worker_idx: usize, _num_workers: usize) -> Result<()> {
            self.worker_idx = worker_idx;
            self.lossy = welcome.contains(&(worker_idx as u8));
            Ok(())
        }

        fn run_request(&mut self, request: &[u8]) -> Result<Blob> {
            let request = WorkerRequest::from_blob(request)?;
            let reply = match request.payload {
                RequestPayload::FindSplits { .. } if self.lossy => {
                    WorkerReply::restart_iteration(self.worker_idx, request.request_id)
                }
                RequestPayload::FindSplits { .. } => WorkerReply::new(
                    self.worker_idx,
                    request.request_id,
                    ReplyPayload::FindSplits {
                        splits_per_weak_model: vec![],
                    },
                ),
                _ => WorkerReply::new(
                    self.worker_idx,
                    request.request_id,
                    ReplyPayload::StartTraining,
                ),
            };
            reply.to_blob()
        }
    }

    fn scripted_factory() -> WorkerFactory {
        Arc::new(|| {
            Box::new(ScriptedWorker {
                worker_idx: 0,
                lossy: false,
            }) as Box<dyn AbstractWorker>
        })
    }

    fn find_splits_request() -> WorkerRequest {
        WorkerRequest::new(RequestPayload::FindSplits {
            features_per_weak_model: vec![],
        })
    }

    #[tokio::test]
    async fn test_broadcast_gathers_every_worker() {
        let manager = MultiThreadManager::new(3, &scripted_factory(), vec![]).unwrap();
        let client = DistributionClient::new(Box::new(manager));

        let mut seen = Vec::new();
        client
            .broadcast(
                |_| find_splits_request(),
                |reply| {
                    seen.push(reply.worker_idx);
                    Ok(())
                },
            )
            .await
            .unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_reply_drains_phase() {
        // Worker #1 is lossy.
        let manager = MultiThreadManager::new(3, &scripted_factory(), vec![1u8]).unwrap();
        let client = DistributionClient::new(Box::new(manager));

        let err = client
            .broadcast(|_| find_splits_request(), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_data_loss());

        // The phase was drained: the next queued reply belongs to the new
        // request, not to the abandoned phase.
        client
            .async_request(&WorkerRequest::new(RequestPayload::StartTraining), 0)
            .unwrap();
        let reply = client.next_reply().await.unwrap();
        assert_eq!(reply.payload.kind(), "StartTraining");
        client.shutdown().await.unwrap();
    }
}
