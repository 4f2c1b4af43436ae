//! A structured scope for fire-and-forget background work (CacheFirst
//! refreshes, sync drains). The client owns one scope; shutdown aborts
//! everything still in flight so tasks never outlive their client.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct TaskScope {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a background task bound to this scope. Must be called from
    /// within a tokio runtime.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(tokio::spawn(fut));
    }

    /// Abort all still-running tasks.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
