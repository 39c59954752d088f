//! Supervised long-lived tasks
//!
//! Each monitoring loop runs as its own task. A task that panics is started
//! again from its factory until the restart budget is spent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use super::{EventSink, MonitorEvent};

const RESTART_BACKOFF: Duration = Duration::from_millis(200);

/// Owner of every monitoring task
pub struct Supervisor {
    max_restarts: u32,
    events: EventSink,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<Mutex<Vec<AbortHandle>>>,
}

impl Supervisor {
    pub fn new(max_restarts: u32, events: EventSink) -> Self {
        Self {
            max_restarts,
            events,
            watchers: Mutex::new(Vec::new()),
            running: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn `factory()` and keep it alive across panics
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let max_restarts = self.max_restarts;
        let events = self.events.clone();
        let running = self.running.clone();

        let watcher = tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let task = tokio::spawn(factory());
                running.lock().push(task.abort_handle());
                debug!("Supervised task {} started", name);

                match task.await {
                    Ok(()) => {
                        debug!("Supervised task {} finished", name);
                        break;
                    }
                    Err(e) if e.is_panic() => {
                        restarts += 1;
                        if restarts > max_restarts {
                            error!("Task {} panicked {} times, giving up", name, restarts);
                            events.emit(MonitorEvent::TaskAbandoned { task: name.clone() });
                            break;
                        }
                        warn!("Task {} panicked, restarting ({}/{})", name, restarts, max_restarts);
                        events.emit(MonitorEvent::TaskRestarted {
                            task: name.clone(),
                            restarts,
                        });
                        tokio::time::sleep(RESTART_BACKOFF).await;
                    }
                    Err(_) => break,
                }
            }
        });
        self.watchers.lock().push(watcher);
    }

    /// Number of watched tasks
    pub fn task_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Abort every task and its watcher
    pub fn shutdown(&self) {
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
        for task in self.running.lock().drain(..) {
            task.abort();
        }
        debug!("Supervisor shut down");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
