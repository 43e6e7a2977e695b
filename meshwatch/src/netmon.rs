//! Interface-change watcher: signals `meshrouted`'s driver that an address
//! or route changed so it can re-check reachability and broadcast out of
//! cycle, rather than waiting for the next `alarm_timeout` tick.
//!
//! Resolves the open question in the design notes about the original's empty
//! `NewAddr`/`DelAddr` handlers: here, any netlink address/route/link
//! notification marks the watch channel dirty.

#[cfg(target_os = "linux")]
mod linux;

use n0_error::stack_error;
use n0_future::task::AbortOnDropHandle;
use tokio::sync::watch;

#[stack_error(derive, add_meta, from_sources)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to set up the netlink route monitor")]
    Setup { source: std::io::Error },
}

/// Watches for interface/address/route changes and republishes a fresh
/// generation number on `changed()` each time one occurs.
#[derive(Debug)]
pub struct Monitor {
    _handle: AbortOnDropHandle<()>,
    changed: watch::Receiver<u64>,
}

impl Monitor {
    #[cfg(target_os = "linux")]
    pub async fn new() -> Result<Self, Error> {
        let (tx, rx) = watch::channel(0u64);
        let handle = self::linux::spawn(tx);
        Ok(Monitor {
            _handle: AbortOnDropHandle::new(handle),
            changed: rx,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn new() -> Result<Self, Error> {
        let (_tx, rx) = watch::channel(0u64);
        let handle = tokio::spawn(std::future::pending::<()>());
        Ok(Monitor {
            _handle: AbortOnDropHandle::new(handle),
            changed: rx,
        })
    }

    /// A receiver that ticks every time an interface/address/route change is
    /// observed. Clone freely; each clone tracks its own last-seen
    /// generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.clone()
    }
}
