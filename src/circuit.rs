// ===============================
// src/circuit.rs (per provider x credential scope)
// ===============================
use ahash::AHashMap as HashMap;
use std::hash::Hash;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub opened_until: Option<Instant>,
}

/// What a recorded failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted(u32),
    Opened { until: Instant },
}

/// Consecutive-failure breaker. State is created lazily on first use and never persisted.
#[derive(Debug)]
pub struct CircuitBreaker<K> {
    states: HashMap<K, CircuitState>,
    threshold: u32,
    cooldown: Duration,
}

impl<K> CircuitBreaker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { states: HashMap::new(), threshold: threshold.max(1), cooldown }
    }

    /// True while the cooldown window is running. An elapsed window closes the circuit.
    pub fn is_open(&mut self, key: &K, now: Instant) -> bool {
        let Some(st) = self.states.get_mut(key) else { return false };
        match st.opened_until {
            Some(until) if until > now => true,
            Some(_) => {
                // cooldown elapsed: closed again with a fresh failure count
                st.opened_until = None;
                st.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&mut self, key: &K) {
        if let Some(st) = self.states.get_mut(key) {
            *st = CircuitState::default();
        }
    }

    pub fn record_failure(&mut self, key: K, now: Instant) -> FailureOutcome {
        let st = self.states.entry(key).or_default();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        if st.consecutive_failures >= self.threshold {
            let until = now + self.cooldown;
            st.opened_until = Some(until);
            FailureOutcome::Opened { until }
        } else {
            FailureOutcome::Counted(st.consecutive_failures)
        }
    }

    pub fn state(&self, key: &K) -> CircuitState {
        self.states.get(key).copied().unwrap_or_default()
    }
}
