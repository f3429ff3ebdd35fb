use std::sync::{Condvar, Mutex, MutexGuard};

/// Counting wakeup gate for the retrieval thread.
///
/// Anything that can change whether a connection is needed calls
/// [`ConnectionGate::release`]. The waiter never trusts the wake reason: it
/// drains all pending permits and re-runs the full predicate, so a burst of N
/// releases costs one predicate check, not N.
#[derive(Debug, Default)]
pub struct ConnectionGate {
    permits: Mutex<u64>,
    cond: Condvar,
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn permits(&self) -> MutexGuard<'_, u64> {
        match self.permits.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn release(&self) {
        let mut permits = self.permits();
        *permits = permits.saturating_add(1);
        self.cond.notify_one();
    }

    /// Takes every pending permit, returning how many there were.
    pub fn drain_permits(&self) -> u64 {
        std::mem::take(&mut *self.permits())
    }

    pub fn available_permits(&self) -> u64 {
        *self.permits()
    }

    /// Blocks until one permit is available and takes it.
    pub fn acquire(&self) {
        let mut permits = self.permits();
        while *permits == 0 {
            permits = match self.cond.wait(permits) {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
        }
        *permits -= 1;
    }

    /// Blocks until `predicate` holds. Returns how many times it was evaluated.
    ///
    /// The predicate runs without the gate's lock held, so it may take other
    /// locks (connection state, job queue) freely.
    pub fn wait_until(&self, mut predicate: impl FnMut() -> bool) -> u64 {
        self.drain_permits();
        let mut checks = 0u64;
        loop {
            checks += 1;
            if predicate() {
                return checks;
            }
            if self.drain_permits() == 0 {
                self.acquire();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn burst_of_releases_costs_one_check() {
        let gate = ConnectionGate::new();
        for _ in 0..5 {
            gate.release();
        }
        assert_eq!(gate.available_permits(), 5);

        let checks = gate.wait_until(|| true);
        assert_eq!(checks, 1);
        assert_eq!(gate.available_permits(), 0);
    }

    #[test]
    fn waiter_sleeps_until_released_and_rechecks() {
        let gate = Arc::new(ConnectionGate::new());
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = gate.clone();
            let ready = ready.clone();
            thread::spawn(move || gate.wait_until(|| ready.load(Ordering::SeqCst)))
        };

        // A wake with the predicate still false must not let the waiter through.
        thread::sleep(Duration::from_millis(20));
        gate.release();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        ready.store(true, Ordering::SeqCst);
        gate.release();
        let checks = waiter.join().unwrap();
        assert!(checks >= 2, "expected at least two checks, got {checks}");
    }

    #[test]
    fn release_during_check_is_not_lost() {
        let gate = ConnectionGate::new();
        let mut calls = 0;
        let checks = gate.wait_until(|| {
            calls += 1;
            if calls == 1 {
                // State changed while we were evaluating.
                gate.release();
                false
            } else {
                true
            }
        });
        assert_eq!(checks, 2);
    }
}
