use std::sync::{Mutex, MutexGuard};

/// The two process-wide locks that serialize protocol-state mutation.
///
/// Lock order is always group-processing first, then session. Code that needs
/// only the session lock may take it alone, but must never take the group lock
/// while holding it.
#[derive(Debug, Default)]
pub struct ProcessingLocks {
    group: Mutex<()>,
    session: Mutex<()>,
}

/// Both locks held. Released together on drop.
#[must_use]
pub struct ProcessingGuard<'a> {
    _session: MutexGuard<'a, ()>,
    _group: MutexGuard<'a, ()>,
}

fn lock(m: &Mutex<()>) -> MutexGuard<'_, ()> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

impl ProcessingLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> ProcessingGuard<'_> {
        let group = lock(&self.group);
        let session = lock(&self.session);
        ProcessingGuard {
            _session: session,
            _group: group,
        }
    }

    pub fn acquire_session(&self) -> MutexGuard<'_, ()> {
        lock(&self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn session_waits_for_combined_holder() {
        let locks = Arc::new(ProcessingLocks::new());
        let guard = locks.acquire();

        let other = {
            let locks = locks.clone();
            thread::spawn(move || {
                let _s = locks.acquire_session();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!other.is_finished());
        drop(guard);
        other.join().unwrap();
    }

    #[test]
    fn contending_combined_acquires_do_not_deadlock() {
        let locks = Arc::new(ProcessingLocks::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _g = locks.acquire();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
    }
}
