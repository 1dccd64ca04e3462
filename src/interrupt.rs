//! Ctrl+C bookkeeping.
//!
//! The process installs a single `ctrlc` handler that only counts signals.
//! The engine, the session and the replayer poll the counter at their own
//! suspension points and decide what an interrupt means there.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    pending: Arc<AtomicUsize>,
}

static PROCESS_INTERRUPTS: OnceLock<Interrupts> = OnceLock::new();

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide counter fed by the Ctrl+C handler.
    ///
    /// The handler is installed on first use. If another handler was already
    /// registered the counter still works, it just never increments.
    pub fn install() -> Self {
        PROCESS_INTERRUPTS
            .get_or_init(|| {
                let interrupts = Interrupts::new();
                let counter = interrupts.clone();
                if let Err(e) = ctrlc::set_handler(move || counter.raise()) {
                    tracing::warn!(error = %e, "could not install Ctrl+C handler");
                }
                interrupts
            })
            .clone()
    }

    pub fn raise(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.pending() > 0
    }

    /// Return and reset the number of interrupts received since the last take.
    pub fn take(&self) -> usize {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_counter() {
        let interrupts = Interrupts::new();
        interrupts.raise();
        interrupts.raise();
        assert!(interrupts.is_raised());
        assert_eq!(interrupts.take(), 2);
        assert_eq!(interrupts.pending(), 0);
    }

    #[test]
    fn clones_share_state() {
        let a = Interrupts::new();
        let b = a.clone();
        b.raise();
        assert_eq!(a.pending(), 1);
    }
}
