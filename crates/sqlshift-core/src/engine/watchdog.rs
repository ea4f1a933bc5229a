//! Statement timeout enforcement.
//!
//! A watchdog thread interrupts the connection if a unit's transaction runs
//! past its deadline. The interrupted statement fails with
//! `SQLITE_INTERRUPT` and the transaction is rolled back like any other
//! failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::InterruptHandle;

struct Signal {
    disarmed: Mutex<bool>,
    wake: Condvar,
}

/// Armed deadline for one transaction.
pub struct Watchdog {
    signal: Arc<Signal>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Interrupt `interrupt` if not disarmed within `timeout`.
    pub fn arm(interrupt: InterruptHandle, timeout: Duration) -> Self {
        let signal = Arc::new(Signal {
            disarmed: Mutex::new(false),
            wake: Condvar::new(),
        });
        let fired = Arc::new(AtomicBool::new(false));

        let thread_signal = Arc::clone(&signal);
        let thread_fired = Arc::clone(&fired);
        let handle = thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            let mut disarmed = thread_signal.disarmed.lock();
            while !*disarmed {
                if thread_signal
                    .wake
                    .wait_until(&mut disarmed, deadline)
                    .timed_out()
                {
                    if !*disarmed {
                        thread_fired.store(true, Ordering::SeqCst);
                        interrupt.interrupt();
                        tracing::warn!(timeout_ms = timeout.as_millis() as u64, "statement timeout, interrupting");
                    }
                    break;
                }
            }
        });

        Self {
            signal,
            fired,
            handle: Some(handle),
        }
    }

    /// Stop the watchdog. Returns whether it fired.
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        {
            let mut disarmed = self.signal.disarmed.lock();
            *disarmed = true;
            self.signal.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
