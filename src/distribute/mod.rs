//! Abstract distribution layer.
//!
//! The coordinator drives its workers through an [`AbstractManager`]: an
//! opaque request/response transport carrying serialized blobs. Replies to
//! asynchronous requests are consumed from a single shared queue in
//! arrival order, not request order; matching replies to a logical phase
//! is the caller's responsibility.
//!
//! Transport implementations and worker implementations are looked up in
//! name-keyed registries built once at initialization.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DistributeConfig;
use crate::error::{Result, TrainError};

pub mod multi_thread;

pub use multi_thread::{MultiThreadManager, MULTI_THREAD_MANAGER};

/// A serialized request or reply payload.
pub type Blob = Vec<u8>;

/// Request/response transport between the coordinator and its workers.
///
/// Implementations may use threads, cooperative tasks or network sockets;
/// the coordinator only requires that [`AbstractManager::next_reply`]
/// serializes arrivals.
#[async_trait]
pub trait AbstractManager: Send + Sync {
    /// Sends a request to one worker and waits for its reply, bypassing
    /// the shared reply queue. `None` lets the transport pick the worker.
    async fn blocking_request(&self, blob: Blob, worker_idx: Option<usize>) -> Result<Blob>;

    /// Sends a request whose reply will land on the shared reply queue.
    /// Returns as soon as the request is enqueued. `None` lets the
    /// transport pick the worker.
    fn async_request(&self, blob: Blob, worker_idx: Option<usize>) -> Result<()>;

    /// Waits for the next asynchronous reply, in arrival order.
    async fn next_reply(&self) -> Result<Blob>;

    fn num_workers(&self) -> usize;

    /// Stops the workers after they drain their in-flight requests.
    async fn done(&self) -> Result<()>;
}

/// A worker process driven by an [`AbstractManager`].
pub trait AbstractWorker: Send {
    /// Called once before any request, with the manager's welcome blob.
    fn setup(&mut self, welcome: &[u8], worker_idx: usize, num_workers: usize) -> Result<()>;

    /// Handles one request and produces the reply blob.
    fn run_request(&mut self, request: &[u8]) -> Result<Blob>;

    /// Called once when the manager shuts down.
    fn done(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Constructor of a worker instance.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn AbstractWorker> + Send + Sync>;

/// Name → constructor table for workers.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: WorkerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn factory(&self, name: &str) -> Result<WorkerFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| TrainError::invalid_argument(format!("unknown worker '{name}'")))
    }
}

/// Constructor of a manager from the distribute configuration.
pub type ManagerFactory = Arc<
    dyn Fn(&DistributeConfig, usize, WorkerFactory, Blob) -> Result<Box<dyn AbstractManager>>
        + Send
        + Sync,
>;

/// Name → constructor table for transports.
pub struct ManagerRegistry {
    factories: HashMap<String, ManagerFactory>,
}

impl ManagerRegistry {
    /// Registry with the built-in transports registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            MULTI_THREAD_MANAGER,
            Arc::new(|_config, num_workers, factory, welcome| {
                Ok(Box::new(MultiThreadManager::new(num_workers, &factory, welcome)?)
                    as Box<dyn AbstractManager>)
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, factory: ManagerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiates the transport named by `config.implementation` and
    /// hands every spawned worker the welcome blob.
    pub fn create_manager(
        &self,
        config: &DistributeConfig,
        num_workers: usize,
        worker_factory: WorkerFactory,
        welcome: Blob,
    ) -> Result<Box<dyn AbstractManager>> {
        let factory = self.factories.get(&config.implementation).ok_or_else(|| {
            TrainError::invalid_argument(format!(
                "unknown distribute implementation '{}'",
                config.implementation
            ))
        })?;
        factory(config, num_workers, worker_factory, welcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullWorker;

    impl AbstractWorker for NullWorker {
        fn setup(&mut self, _welcome: &[u8], _worker_idx: usize, _num_workers: usize) -> Result<()> {
            Ok(())
        }

        fn run_request(&mut self, request: &[u8]) -> Result<Blob> {
            Ok(request.to_vec())
        }
    }

    fn null_factory() -> WorkerFactory {
        Arc::new(|| Box::new(NullWorker) as Box<dyn AbstractWorker>)
    }

    #[test]
    fn test_worker_registry_lookup() {
        let mut registry = WorkerRegistry::new();
        registry.register("null", null_factory());
        assert!(registry.factory("null").is_ok());
        assert!(registry.factory("missing").is_err());
    }

    #[tokio::test]
    async fn test_manager_registry_creates_multi_thread() {
        let registry = ManagerRegistry::with_builtins();
        let config = DistributeConfig {
            implementation: MULTI_THREAD_MANAGER.to_string(),
            ..Default::default()
        };
        let manager = registry
            .create_manager(&config, 2, null_factory(), vec![])
            .unwrap();
        assert_eq!(manager.num_workers(), 2);
        manager.done().await.unwrap();
    }

    #[test]
    fn test_manager_registry_rejects_unknown_kind() {
        let registry = ManagerRegistry::with_builtins();
        let config = DistributeConfig {
            implementation: "grpc".to_string(),
            ..Default::default()
        };
        let result = registry.create_manager(&config, 1, null_factory(), vec![]);
        assert!(result.is_err());
    }
}
