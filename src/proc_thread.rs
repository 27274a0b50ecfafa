//! The shared processing worker: a condition-variable thread woken by a
//! coalescing set of wake flags.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

bitflags::bitflags! {
    /// Wake-up reasons. Multiple raises of the same flag may wake the worker
    /// once; the callback always receives the union observed at wake time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeFlags: u32 {
        const KILL = 0b001;
        const AUDIO = 0b010;
        const FLUSH = 0b100;
    }
}

struct Shared {
    flags: Mutex<WakeFlags>,
    wake: Condvar,
}

/// A worker thread driven by [`raise`](ProcThread::raise). Dropping the
/// handle raises `KILL` and joins; the drop does not return until the worker
/// has exited its callback and terminated.
pub struct ProcThread {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ProcThread {
    pub fn spawn<F>(mut callback: F) -> std::io::Result<ProcThread>
    where
        F: FnMut(WakeFlags) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            flags: Mutex::new(WakeFlags::empty()),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("april-proc".into())
            .spawn(move || {
                let mut guard = match worker_shared.flags.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };

                loop {
                    while guard.is_empty() {
                        guard = match worker_shared.wake.wait(guard) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }

                    let flags = *guard;
                    *guard = WakeFlags::empty();
                    drop(guard);

                    if flags.contains(WakeFlags::KILL) {
                        return;
                    }

                    callback(flags);

                    guard = match worker_shared.flags.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            })?;

        Ok(ProcThread {
            shared,
            worker: Some(worker),
        })
    }

    /// ORs `flag` into the pending set and signals the worker.
    pub fn raise(&self, flag: WakeFlags) {
        let mut guard = match self.shared.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard |= flag;
        drop(guard);
        self.shared.wake.notify_one();
    }
}

impl Drop for ProcThread {
    fn drop(&mut self) {
        self.raise(WakeFlags::KILL);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() == std::thread::current().id() {
                // Dropped from inside the worker's own callback; it observes
                // KILL and exits once the callback returns.
                return;
            }
            if worker.join().is_err() {
                log::error!("processing thread panicked during shutdown");
            }
        }
    }
}
