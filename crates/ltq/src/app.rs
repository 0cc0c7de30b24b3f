//! In-process supervisor for multiple Workers sharing a middleware prefix.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LtqError;
use crate::middleware::Middleware;
use crate::worker::Worker;

/// Runs several Workers in the same process, each with its own cooperative
/// scheduler so one Worker's blocking behavior cannot stall another.
pub struct App {
    workers: HashMap<String, Arc<Worker>>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl App {
    pub fn new() -> Self {
        Self { workers: HashMap::new(), middlewares: Vec::new() }
    }

    /// Sets the app-level middleware prefix. Must be called before
    /// `register_worker` for workers registered afterward to pick it up;
    /// workers already registered are unaffected.
    pub fn use_middleware(&mut self, middlewares: Vec<Arc<dyn Middleware>>) {
        self.middlewares = middlewares;
    }

    /// Attaches the app-level middleware prefix to `worker`'s stack (as
    /// outer layers) and registers it under `worker.name()`.
    pub async fn register_worker(&mut self, worker: Arc<Worker>) {
        if !self.middlewares.is_empty() {
            worker.prepend_middleware(self.middlewares.clone()).await;
        }
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn worker(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.values()
    }

    /// Brings every registered Worker to the running state in parallel.
    /// Returns once every Worker has drained and stopped (normally in
    /// response to `stop`).
    pub async fn start(&self) -> Result<(), LtqError> {
        let handles: Vec<_> = self
            .workers
            .values()
            .cloned()
            .map(|worker| tokio::spawn(async move { worker.start().await }))
            .collect();

        for handle in handles {
            handle.await.map_err(|e| LtqError::Other(anyhow::anyhow!(e)))??;
        }
        Ok(())
    }

    /// Asks every Worker to shut down and returns immediately; callers
    /// await the `start()` future (or its spawned task) to observe drain
    /// completion.
    pub fn stop(&self) {
        for worker in self.workers.values() {
            worker.shutdown();
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
