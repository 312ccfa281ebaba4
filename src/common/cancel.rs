use std::io;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-job cancellation with two escalation tiers.
///
/// Tier one (`cancel`) is cooperative: pipeline stages poll it between frames.
/// Tier two (`terminate`) kills every external process registered with the signal
/// and releases anything awaiting `terminated()`.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancel: CancellationToken,
    terminate: CancellationToken,
    processes: Mutex<Vec<Arc<ProcessHandle>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Forceful tier. Implies `cancel`.
    pub fn terminate(&self) {
        self.inner.cancel.cancel();
        self.inner.terminate.cancel();

        let processes = std::mem::take(&mut *lock(&self.inner.processes));
        for process in processes {
            debug!(pid = process.id(), "Killing external process");
            process.kill();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminate.is_cancelled()
    }

    pub async fn terminated(&self) {
        self.inner.terminate.cancelled().await
    }

    /// Hands a spawned child to the signal so `terminate` can reach it.
    pub fn register(&self, child: Child) -> Arc<ProcessHandle> {
        let handle = Arc::new(ProcessHandle::new(child));
        if self.is_terminated() {
            handle.kill();
            return handle;
        }

        let mut processes = lock(&self.inner.processes);
        processes.retain(|p| !p.has_exited());
        processes.push(handle.clone());
        handle
    }
}

/// A child process shared between its owner and the cancel signal.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<Child>,
}

impl ProcessHandle {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn kill(&self) {
        let _ = lock(&self.child).kill();
    }

    fn has_exited(&self) -> bool {
        matches!(lock(&self.child).try_wait(), Ok(Some(_)))
    }

    /// Blocks until the process exits. The lock is released between polls so a
    /// concurrent `kill` is never stuck behind a waiter.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = lock(&self.child).try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
