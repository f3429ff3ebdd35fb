// Host-provided signals the observer reads but does not own.

pub trait AccountState: Send + Sync {
    fn is_registered(&self) -> bool;

    /// Whether push wakeups are available. Without them the socket is the
    /// only way messages arrive, so it stays up in the background.
    fn fcm_enabled(&self) -> bool;

    fn websocket_mode_forced(&self) -> bool {
        false
    }

    fn proxy_enabled(&self) -> bool {
        false
    }
}

pub trait NetworkMonitor: Send + Sync {
    fn has_network(&self) -> bool;

    /// True when the service is reached through censorship circumvention,
    /// which switches to the shorter timeout set.
    fn is_censored(&self) -> bool {
        false
    }
}

/// Best-effort process lifetime hints. Failures are logged, never fatal.
pub trait PlatformHooks: Send + Sync {
    /// Persistent notification service for websocket-only delivery.
    fn start_foreground_service(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ask the OS to keep us around a little longer (app came to foreground).
    fn keep_process_alive(&self) {}

    /// The socket is down and the app is not visible; the OS may reap us.
    fn allow_process_death(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlatformHooks;

impl PlatformHooks for NoopPlatformHooks {}
