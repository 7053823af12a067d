use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::error::StorageError;

/// Lifecycle shared by every background loop of the store.
///
/// `stopped` is the cancellation token each loop checks per iteration; `wakeup` cuts a
/// bounded wait short when new work arrives.
#[derive(Debug)]
pub struct ServiceThread {
    name: &'static str,
    stopped: AtomicBool,
    notified: Mutex<bool>,
    signal: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceThread {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stopped: AtomicBool::new(false),
            notified: Mutex::new(false),
            signal: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn start<F>(&self, body: F) -> Result<(), StorageError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.stopped.store(false, Ordering::Release);
        let spawned = std::thread::Builder::new()
            .name(self.name.to_string())
            .spawn(body)
            .map_err(|e| {
                StorageError::from_io_error(e, &format!("Failed to spawn {} thread", self.name))
            })?;
        *handle = Some(spawned);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn wakeup(&self) {
        let mut notified = self.notified.lock();
        if !*notified {
            *notified = true;
            self.signal.notify_one();
        }
    }

    /// Block until woken or `interval` elapses. Returns `true` when woken.
    pub fn wait_for_running(&self, interval: Duration) -> bool {
        let mut notified = self.notified.lock();
        if !*notified {
            self.signal.wait_for(&mut notified, interval);
        }
        std::mem::replace(&mut *notified, false)
    }

    /// Raise the stop flag, wake the loop and join it.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("{} thread panicked", self.name);
            }
        }
    }
}
