use std::collections::HashMap;
use std::time::Duration;

/// Named requests to keep the socket open (active calls, FCM wakeups, ...).
///
/// Not synchronized on its own: it lives inside the observer's connection
/// state and is only touched under that mutex, together with the rest of the
/// necessity inputs.
#[derive(Debug, Default, Clone)]
pub struct KeepAliveLeaseRegistry {
    leases: HashMap<String, u64>,
}

impl KeepAliveLeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts `key` with `now_ms` as its creation time.
    pub fn register(&mut self, key: &str, now_ms: u64) {
        self.leases.insert(key.to_string(), now_ms);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.leases.remove(key).is_some()
    }

    /// Drops every lease whose age is at least `max_age`. Returns whether
    /// anything was dropped.
    pub fn purge_expired(&mut self, now_ms: u64, max_age: Duration) -> bool {
        let max_age_ms = max_age.as_millis().min(u128::from(u64::MAX)) as u64;
        let before = self.leases.len();
        self.leases
            .retain(|_, created_at| now_ms.saturating_sub(*created_at) < max_age_ms);
        self.leases.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.leases.contains_key(key)
    }

    /// Sorted keys, for logging.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.leases.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_AGE: Duration = Duration::from_secs(300);

    #[test]
    fn purge_keeps_fresh_and_drops_expired() {
        let mut leases = KeepAliveLeaseRegistry::new();
        leases.register("call", 1_000);
        leases.register("fcm", 200_000);

        assert!(!leases.purge_expired(250_000, MAX_AGE));
        assert_eq!(leases.len(), 2);

        // "call" is exactly max_age old now.
        assert!(leases.purge_expired(301_000, MAX_AGE));
        assert!(!leases.contains("call"));
        assert!(leases.contains("fcm"));
    }

    #[test]
    fn re_register_refreshes_creation_time() {
        let mut leases = KeepAliveLeaseRegistry::new();
        leases.register("call", 0);
        leases.register("call", 200_000);
        assert!(!leases.purge_expired(400_000, MAX_AGE));
        assert_eq!(leases.keys(), vec!["call".to_string()]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut leases = KeepAliveLeaseRegistry::new();
        leases.register("a", 0);
        assert!(leases.remove("a"));
        assert!(!leases.remove("a"));
        assert!(leases.is_empty());
    }

    #[test]
    fn clock_going_backwards_does_not_expire() {
        let mut leases = KeepAliveLeaseRegistry::new();
        leases.register("a", 10_000);
        assert!(!leases.purge_expired(5_000, MAX_AGE));
        assert!(leases.contains("a"));
    }
}
