//! Cooperative shutdown.
//!
//! SIGTERM and SIGINT only flip a [`ShutdownToken`]; the worker's command
//! loop polls it between commands.

use nix::unistd::{getppid, Pid};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token on SIGTERM or SIGINT. The registration lasts for
    /// the rest of the process.
    pub fn register_signals(&self) -> std::io::Result<()> {
        for signal in [SIGTERM, SIGINT] {
            signal_hook::flag::register(signal, Arc::clone(&self.cancelled))?;
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Detects that the process that spawned us has gone away (we were
/// re-parented).
#[derive(Debug, Clone, Copy)]
pub struct ParentWatch {
    parent: Pid,
}

impl ParentWatch {
    pub fn current() -> Self {
        Self { parent: getppid() }
    }

    pub fn parent_exited(&self) -> bool {
        getppid() != self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_parent_unchanged_in_process() {
        assert!(!ParentWatch::current().parent_exited());
    }

    #[test]
    fn test_sigterm_cancels_registered_token() {
        let token = ShutdownToken::new();
        token.register_signals().unwrap();
        let unrelated = ShutdownToken::new();
        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert!(token.is_cancelled());
        assert!(!unrelated.is_cancelled());
    }
}
