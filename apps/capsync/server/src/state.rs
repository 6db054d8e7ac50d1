//! The single authoritative flag.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the flag.
///
/// `version` increases by one on every real transition. It never goes on the
/// wire; connections use it to refuse an older value once a newer one has been
/// queued for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub enabled: bool,
    pub version: u64,
}

impl FlagSnapshot {
    fn pack(self) -> u64 {
        (self.version << 1) | u64::from(self.enabled)
    }

    fn unpack(word: u64) -> Self {
        Self {
            enabled: word & 1 == 1,
            version: word >> 1,
        }
    }
}

/// Process-wide flag cell. Starts disabled at version 0.
///
/// Value and version share one atomic word so a transition is a single
/// compare-and-swap and readers never see a torn pair.
#[derive(Debug, Default)]
pub struct SharedState {
    word: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> bool {
        self.snapshot().enabled
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot::unpack(self.word.load(Ordering::Acquire))
    }

    /// Assigns `enabled` unless it is already the current value. Returns
    /// whether the value changed.
    pub fn set_if_different(&self, enabled: bool) -> bool {
        self.transition(enabled).is_some()
    }

    /// Same as [`set_if_different`](Self::set_if_different) but hands back the
    /// snapshot that was committed, so the caller can fan out exactly that
    /// version.
    pub fn transition(&self, enabled: bool) -> Option<FlagSnapshot> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let snapshot = FlagSnapshot::unpack(current);
            if snapshot.enabled == enabled {
                return None;
            }
            let next = FlagSnapshot {
                enabled,
                version: snapshot.version + 1,
            };
            match self.word.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test_timeout::timeout]
    fn starts_disabled() {
        let state = SharedState::new();
        assert!(!state.read());
        assert_eq!(
            state.snapshot(),
            FlagSnapshot {
                enabled: false,
                version: 0
            }
        );
    }

    #[test_timeout::timeout]
    fn same_value_is_a_noop() {
        let state = SharedState::new();
        assert!(!state.set_if_different(false));
        assert_eq!(state.snapshot().version, 0);

        assert!(state.set_if_different(true));
        assert!(!state.set_if_different(true));
        assert!(state.read());
        assert_eq!(state.snapshot().version, 1);
    }

    #[test_timeout::timeout]
    fn transition_reports_committed_version() {
        let state = SharedState::new();
        let first = state.transition(true).unwrap();
        let second = state.transition(false).unwrap();
        assert_eq!(
            first,
            FlagSnapshot {
                enabled: true,
                version: 1
            }
        );
        assert_eq!(
            second,
            FlagSnapshot {
                enabled: false,
                version: 2
            }
        );
        assert_eq!(state.transition(false), None);
    }

    #[test_timeout::timeout(10)]
    fn concurrent_writers_never_lose_a_transition() {
        let state = Arc::new(SharedState::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let mut changed = 0u64;
                    for n in 0..1_000 {
                        if state.set_if_different((i + n) % 2 == 0) {
                            changed += 1;
                        }
                    }
                    changed
                })
            })
            .collect();

        let total: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        let snapshot = state.snapshot();
        // Every successful swap bumped the version exactly once, and the
        // version parity pins the final value (it started disabled at 0).
        assert_eq!(snapshot.version, total);
        assert_eq!(snapshot.enabled, total % 2 == 1);
    }
}
