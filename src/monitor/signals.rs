//! Stop and reload requests
//!
//! SIGINT/SIGTERM request a stop, SIGHUP a configuration reload. The
//! handlers only set flags; the monitor loop reads them between ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use crate::error::ClusterResult;
use crate::observability::Logger;

/// Flags set by signal handlers (or tests) and polled by the monitor.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlags {
    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl ShutdownFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install process signal handlers feeding a new set of flags.
    pub fn install() -> ClusterResult<Self> {
        let flags = Self::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (mut terminate, mut interrupt, mut hangup) = runtime.block_on(async {
            Ok::<_, std::io::Error>((
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::hangup())?,
            ))
        })?;

        let handler = flags.clone();
        std::thread::Builder::new()
            .name("walwarden-signals".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = terminate.recv() => handler.request_stop(),
                            _ = interrupt.recv() => handler.request_stop(),
                            _ = hangup.recv() => handler.request_reload(),
                        }
                    }
                })
            })?;
        Logger::debug("SIGNAL_HANDLERS_INSTALLED", &[]);
        Ok(flags)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_is_consumed_once() {
        let flags = ShutdownFlags::new();
        flags.request_reload();
        assert!(flags.take_reload());
        assert!(!flags.take_reload());
    }

    #[test]
    fn test_clones_share_flags() {
        let flags = ShutdownFlags::new();
        let handler = flags.clone();
        handler.request_stop();
        assert!(flags.stop_requested());
    }
}
