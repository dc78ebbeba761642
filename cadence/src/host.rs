//! Host facade tying the registry, schedulers and monitor server together.

use crate::config::HostConfig;
use crate::sched::Scheduler;
use crate::server::MonitorServer;
use crate::task::{RegisterError, TaskDescriptor, TaskId, TaskRegistry};
use crate::trace::info;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

/// A running task host.
///
/// Registering a task through the host also spawns its scheduler threads;
/// deregistering stops and joins them. [`Host::serve`] runs the monitor
/// server on the calling thread.
pub struct Host {
    registry: Arc<TaskRegistry>,
    schedulers: Mutex<HashMap<u16, Scheduler>>,
}

impl Host {
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Host {
            registry: Arc::new(TaskRegistry::new(config)),
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Registers a task and starts ticking it.
    pub fn start_task(&self, desc: TaskDescriptor) -> Result<TaskId, RegisterError> {
        let task = self.registry.register(desc)?;
        let id = task.id();
        let pin = self.registry.config().pin_fastest;
        let scheduler = match Scheduler::spawn(Arc::clone(&task), pin) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                self.registry.deregister(id);
                return Err(RegisterError::Spawn(err));
            }
        };
        if let Ok(mut table) = self.schedulers.lock() {
            table.insert(id.as_raw(), scheduler);
        }
        Ok(id)
    }

    /// Stops a task's scheduler and removes it from the registry.
    pub fn stop_task(&self, id: TaskId) -> bool {
        let removed = self.registry.deregister(id).is_some();
        let scheduler = self
            .schedulers
            .lock()
            .ok()
            .and_then(|mut table| table.remove(&id.as_raw()));
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
        removed
    }

    /// Builds a monitor server for this host's tasks.
    pub fn server(&self) -> io::Result<MonitorServer> {
        MonitorServer::new(Arc::clone(&self.registry))
    }

    /// Runs the monitor server on the calling thread until `shutdown`.
    pub fn serve(&self, shutdown: &AtomicBool) -> io::Result<()> {
        self.server()?.run(shutdown)
    }

    /// Stops every task.
    pub fn shutdown(&self) {
        let ids: Vec<TaskId> = self.registry.active().iter().map(|t| t.id()).collect();
        for id in ids {
            self.stop_task(id);
        }
        info!("host shut down");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}
