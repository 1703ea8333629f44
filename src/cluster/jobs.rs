//! At-most-one named background task per host.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::cluster::host::InetAddr;

/// Registry of background tasks keyed by host address. Each key holds
/// at most one live task.
pub struct Jobs {
    tasks: Mutex<HashMap<InetAddr, JoinHandle<()>>>,
}

impl Jobs {
    pub fn new() -> Self {
        Jobs {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts `task` under `key`. A live task already registered for
    /// `key` is cancelled first when `replace` is true; otherwise the
    /// new task is dropped and the existing one keeps running.
    pub fn add<F>(&self, key: InetAddr, replace: bool, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(existing) = tasks.get(&key) {
            if !replace && !existing.is_finished() {
                return;
            }
            existing.abort();
        }
        debug!(%key, replace, "starting background job");
        tasks.insert(key, tokio::spawn(task));
    }

    /// Cancels the task registered under `key`, if any.
    pub fn cancel(&self, key: InetAddr) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(&key) {
            handle.abort();
        }
    }

    /// Keys with a live task.
    pub fn show_jobs(&self) -> Vec<InetAddr> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Cancels every registered task.
    pub fn destroy(&self) {
        let tasks: Vec<(InetAddr, JoinHandle<()>)> =
            self.tasks.lock().unwrap().drain().collect();
        for (key, handle) in tasks {
            debug!(%key, "cancelling background job");
            handle.abort();
        }
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Jobs::new()
    }
}
