use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{ObserverConfig, ObserverTimeouts};
use crate::jobs::JobQueue;
use crate::lease::KeepAliveLeaseRegistry;
use crate::platform::{AccountState, NetworkMonitor};

/// Foreground/interaction state plus keep-alive leases. One mutex guards all
/// of it so evaluation sees a consistent picture.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub app_visible: bool,
    pub last_interaction_ms: u64,
    pub leases: KeepAliveLeaseRegistry,
}

impl ConnectionState {
    pub fn new(now_ms: u64) -> Self {
        Self {
            app_visible: false,
            last_interaction_ms: now_ms,
            leases: KeepAliveLeaseRegistry::new(),
        }
    }

    pub fn on_foreground(&mut self) {
        self.app_visible = true;
    }

    pub fn on_background(&mut self, now_ms: u64) {
        self.app_visible = false;
        self.last_interaction_ms = now_ms;
    }

    pub fn register_lease(&mut self, key: &str, now_ms: u64) {
        self.leases.register(key, now_ms);
        self.last_interaction_ms = now_ms;
    }

    pub fn remove_lease(&mut self, key: &str, now_ms: u64) {
        self.leases.remove(key);
        self.last_interaction_ms = now_ms;
    }
}

pub(crate) fn lock_state(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    match state.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

/// Everything the connection decision depends on, captured at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInputs {
    pub registered: bool,
    pub app_visible: bool,
    /// Zero while visible.
    pub time_idle: Duration,
    pub fcm_enabled: bool,
    pub has_network: bool,
    pub keep_alive_leases: usize,
    pub force_websocket: bool,
    pub proxy_enabled: bool,
    pub decrypt_queue_empty: bool,
}

impl ConnectionInputs {
    pub fn is_connection_necessary(&self, max_background_time: Duration) -> bool {
        self.registered
            && (self.app_visible
                || self.time_idle < max_background_time
                || !self.fcm_enabled
                || self.keep_alive_leases > 0)
            && self.has_network
            && self.decrypt_queue_empty
    }
}

pub struct NecessityEvaluator {
    state: Arc<Mutex<ConnectionState>>,
    clock: Arc<dyn Clock>,
    account: Arc<dyn AccountState>,
    network: Arc<dyn NetworkMonitor>,
    jobs: Arc<dyn JobQueue>,
    config: ObserverConfig,
}

impl NecessityEvaluator {
    pub fn new(
        state: Arc<Mutex<ConnectionState>>,
        clock: Arc<dyn Clock>,
        account: Arc<dyn AccountState>,
        network: Arc<dyn NetworkMonitor>,
        jobs: Arc<dyn JobQueue>,
        config: ObserverConfig,
    ) -> Self {
        Self {
            state,
            clock,
            account,
            network,
            jobs,
            config,
        }
    }

    pub fn timeouts(&self) -> ObserverTimeouts {
        self.config.timeouts(self.network.is_censored())
    }

    /// Captures the current inputs. Expired leases are purged as a side effect.
    pub fn snapshot(&self) -> ConnectionInputs {
        let timeouts = self.timeouts();
        let now = self.clock.now_millis();

        let (app_visible, time_idle, keep_alive_leases) = {
            let mut state = lock_state(&self.state);
            let time_idle = if state.app_visible {
                Duration::ZERO
            } else {
                Duration::from_millis(now.saturating_sub(state.last_interaction_ms))
            };
            if state.leases.purge_expired(now, timeouts.keep_alive_max_age) {
                tracing::debug!("removed old keep-alive leases");
            }
            (state.app_visible, time_idle, state.leases.len())
        };

        ConnectionInputs {
            registered: self.account.is_registered(),
            app_visible,
            time_idle,
            fcm_enabled: self.account.fcm_enabled(),
            has_network: self.network.has_network(),
            keep_alive_leases,
            force_websocket: self.account.websocket_mode_forced(),
            proxy_enabled: self.account.proxy_enabled(),
            decrypt_queue_empty: self.jobs.is_queue_empty(&self.config.decrypt_queue),
        }
    }

    pub fn is_connection_necessary(&self) -> bool {
        let max_background_time = self.timeouts().max_background_time;
        let inputs = self.snapshot();
        let conclusion = inputs.is_connection_necessary(max_background_time);

        let idle = if inputs.app_visible {
            "N/A".to_string()
        } else {
            format!(
                "{} ms ({})",
                inputs.time_idle.as_millis(),
                if inputs.time_idle < max_background_time {
                    "within limit"
                } else {
                    "over limit"
                }
            )
        };
        tracing::debug!(
            network = inputs.has_network,
            foreground = inputs.app_visible,
            idle = %idle,
            fcm = inputs.fcm_enabled,
            keep_alive_leases = inputs.keep_alive_leases,
            registered = inputs.registered,
            proxy = inputs.proxy_enabled,
            force_websocket = inputs.force_websocket,
            decrypt_queue_empty = inputs.decrypt_queue_empty,
            "[{}]",
            if conclusion {
                "Needs Connection"
            } else {
                "Does Not Need Connection"
            }
        );
        conclusion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::{InMemoryJobQueue, StaticAccount, StaticNetwork};

    const MAX_BG: Duration = Duration::from_secs(120);

    #[test]
    fn formula_matches_for_every_input_combination() {
        let idles = [
            Duration::ZERO,
            MAX_BG - Duration::from_millis(1),
            MAX_BG,
            Duration::from_secs(180),
        ];
        let mut checked = 0;
        for bits in 0u32..(1 << 7) {
            let b = |i: u32| bits & (1 << i) != 0;
            for idle in idles {
                for leases in [0usize, 1, 3] {
                    let inputs = ConnectionInputs {
                        registered: b(0),
                        app_visible: b(1),
                        time_idle: idle,
                        fcm_enabled: b(2),
                        has_network: b(3),
                        keep_alive_leases: leases,
                        force_websocket: b(4),
                        proxy_enabled: b(5),
                        decrypt_queue_empty: b(6),
                    };
                    let expected = inputs.registered
                        && inputs.has_network
                        && inputs.decrypt_queue_empty
                        && (inputs.app_visible
                            || idle < MAX_BG
                            || !inputs.fcm_enabled
                            || leases != 0);
                    assert_eq!(
                        inputs.is_connection_necessary(MAX_BG),
                        expected,
                        "{inputs:?}"
                    );
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 128 * 4 * 3);
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        state: Arc<Mutex<ConnectionState>>,
        network: Arc<StaticNetwork>,
        evaluator: NecessityEvaluator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let state = Arc::new(Mutex::new(ConnectionState::new(clock.now_millis())));
        let account = Arc::new(StaticAccount::new(true, true));
        let network = Arc::new(StaticNetwork::new(true));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let evaluator = NecessityEvaluator::new(
            state.clone(),
            clock.clone(),
            account,
            network.clone(),
            jobs,
            ObserverConfig::default(),
        );
        Fixture {
            clock,
            state,
            network,
            evaluator,
        }
    }

    #[test]
    fn backgrounded_past_limit_without_leases_disconnects() {
        let f = fixture();
        f.state.lock().unwrap().on_background(f.clock.now_millis());
        f.clock.advance(Duration::from_secs(3 * 60));
        assert!(!f.evaluator.is_connection_necessary());
    }

    #[test]
    fn fresh_lease_keeps_connection() {
        let f = fixture();
        f.state.lock().unwrap().on_background(f.clock.now_millis());
        f.clock.advance(Duration::from_secs(3 * 60 - 10));
        // register_lease also counts as interaction; rewind it to isolate the lease.
        {
            let mut state = f.state.lock().unwrap();
            let last = state.last_interaction_ms;
            state.register_lease("call", f.clock.now_millis());
            state.last_interaction_ms = last;
        }
        f.clock.advance(Duration::from_secs(10));
        assert!(f.evaluator.is_connection_necessary());
    }

    #[test]
    fn expired_lease_behaves_as_if_never_registered() {
        let f = fixture();
        {
            let mut state = f.state.lock().unwrap();
            state.on_background(f.clock.now_millis());
            state.leases.register("call", f.clock.now_millis());
        }
        f.clock.advance(Duration::from_secs(5 * 60));

        let inputs = f.evaluator.snapshot();
        assert_eq!(inputs.keep_alive_leases, 0);
        assert!(!f.state.lock().unwrap().leases.contains("call"));
        assert!(!f.evaluator.is_connection_necessary());
    }

    #[test]
    fn visible_app_reports_zero_idle() {
        let f = fixture();
        f.state.lock().unwrap().on_foreground();
        f.clock.advance(Duration::from_secs(600));
        let inputs = f.evaluator.snapshot();
        assert_eq!(inputs.time_idle, Duration::ZERO);
        assert!(f.evaluator.is_connection_necessary());
    }

    #[test]
    fn censored_network_shortens_background_window() {
        let f = fixture();
        f.state.lock().unwrap().on_background(f.clock.now_millis());
        f.clock.advance(Duration::from_secs(30));

        f.network.set_censored(true);
        assert_eq!(f.evaluator.timeouts(), ObserverTimeouts::censored());
        assert!(!f.evaluator.is_connection_necessary());

        f.network.set_censored(false);
        assert_eq!(f.evaluator.timeouts(), ObserverTimeouts::uncensored());
        assert!(f.evaluator.is_connection_necessary());
    }

    #[test]
    fn lease_age_limit_follows_censorship() {
        let f = fixture();
        {
            let mut state = f.state.lock().unwrap();
            state.on_background(f.clock.now_millis());
            state.leases.register("call", f.clock.now_millis());
        }
        f.clock.advance(Duration::from_secs(3 * 60));

        // Five minute limit: the lease still holds the connection.
        let inputs = f.evaluator.snapshot();
        assert_eq!(inputs.keep_alive_leases, 1);
        assert!(f.evaluator.is_connection_necessary());

        // Two minute limit: the same lease is now expired and purged.
        f.network.set_censored(true);
        assert_eq!(f.evaluator.snapshot().keep_alive_leases, 0);
        assert!(!f.state.lock().unwrap().leases.contains("call"));
        assert!(!f.evaluator.is_connection_necessary());
    }
}
