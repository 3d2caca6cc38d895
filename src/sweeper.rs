use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{info, warn};

/// An engine core the sweeper can rescue orphans from.
pub(crate) trait SweepTarget: Send + Sync + 'static {
    /// Rescue every reservation older than `threshold_ms`, returning how
    /// many were returned to queue-visible storage. A rescue that fails
    /// (store at capacity, I/O error) must leave the record in place so the
    /// next sweep retries it.
    fn rescue_orphans(&self, threshold_ms: u64) -> usize;
}

/// Background orphan-recovery thread.
///
/// Runs on a dedicated named OS thread and wakes every `interval` to scan
/// for abandoned reservations. Shutdown is a message on the channel;
/// dropping the sender has the same effect, so teardown is safe even after
/// a partial init.
pub(crate) struct Sweeper {
    shutdown_tx: crossbeam_channel::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(
        target: Arc<dyn SweepTarget>,
        interval: Duration,
        threshold_ms: u64,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("coda-sweeper".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let rescued = target.rescue_orphans(threshold_ms);
                        if rescued > 0 {
                            info!(rescued, "rescued orphaned messages");
                        }
                    }
                }
            })?;

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Stop the sweeper thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
