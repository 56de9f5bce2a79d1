use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::worker::{WorkerId, WorkerSession};

/// Source of the currently connected workers
#[cfg_attr(test, mockall::automock)]
pub trait WorkerRegistry: Send + Sync {
    /// Snapshot of online workers, in no particular order
    fn online_workers(&self) -> Vec<Arc<WorkerSession>>;
}

/// Registry keeping sessions in connection order
#[derive(Default)]
pub struct InMemoryRegistry {
    workers: RwLock<Vec<Arc<WorkerSession>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; an existing session with the same id is replaced
    pub fn register(&self, worker: Arc<WorkerSession>) {
        let mut workers = self.workers.write();
        workers.retain(|w| w.id() != worker.id());
        debug!("Worker connected: {}", worker.id());
        workers.push(worker);
    }

    /// Mark a session offline and drop it from the registry
    pub fn disconnect(&self, id: &WorkerId) -> Option<Arc<WorkerSession>> {
        let mut workers = self.workers.write();
        let pos = workers.iter().position(|w| w.id() == id)?;
        let worker = workers.remove(pos);
        worker.set_online(false);
        debug!("Worker disconnected: {}", id);
        Some(worker)
    }

    pub fn get(&self, id: &WorkerId) -> Option<Arc<WorkerSession>> {
        self.workers.read().iter().find(|w| w.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}

impl WorkerRegistry for InMemoryRegistry {
    fn online_workers(&self) -> Vec<Arc<WorkerSession>> {
        self.workers
            .read()
            .iter()
            .filter(|w| w.is_online())
            .cloned()
            .collect()
    }
}
