//! Entropy-based failover policy
//!
//! Each backend carries an entropy value in `[0, max_fail]`. A connectivity
//! failure on the active backend adds one, a success takes one away (never
//! below zero). Reaching `max_fail` marks the backend dead and moves the
//! active index to the next backend in configuration order, wrapping around.
//! Isolated flakiness is absorbed; sustained failure fails over after a
//! bounded number of attempts.

use serde::Serialize;
use std::time::Duration;

/// Failover tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// Entropy ceiling; reaching it marks the backend dead
    pub max_fail: u32,
    /// Attempts per executed command
    pub failure_retry: u32,
    /// Pause after a connectivity failure before the next attempt
    pub retry_backoff: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_fail: 6,
            failure_retry: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// What a failure report did to the health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverEvent {
    /// Nothing changed: single backend, or the report is stale
    Ignored,
    /// Entropy of the active backend went up
    Degraded { index: usize, entropy: u32 },
    /// The active backend died and `to` took over
    Switched { from: usize, to: usize },
}

/// Per-backend snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub alive: bool,
    pub entropy: u32,
    pub active: bool,
}

/// Active index, liveness and entropy of every backend, guarded as one unit
#[derive(Debug, Clone)]
pub struct HealthState {
    active: usize,
    alive: Vec<bool>,
    entropy: Vec<u32>,
    max_fail: u32,
}

impl HealthState {
    /// All backends alive, entropy zero, index 0 active
    pub fn new(backends: usize, max_fail: u32) -> Self {
        Self {
            active: 0,
            alive: vec![true; backends],
            entropy: vec![0; backends],
            max_fail,
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    pub fn is_alive(&self, index: usize) -> bool {
        self.alive.get(index).copied().unwrap_or(false)
    }

    pub fn entropy(&self, index: usize) -> u32 {
        self.entropy.get(index).copied().unwrap_or(0)
    }

    /// True iff no backend is alive. Gates every execution path.
    pub fn all_down(&self) -> bool {
        !self.alive.iter().any(|alive| *alive)
    }

    /// Make `index` active: alive, entropy reset
    pub fn switch_to(&mut self, index: usize) -> bool {
        if index >= self.alive.len() {
            return false;
        }
        self.active = index;
        self.entropy[index] = 0;
        self.alive[index] = true;
        true
    }

    /// Account a connectivity failure observed on backend `index`.
    ///
    /// Reports about a backend that is no longer active are dropped, so
    /// concurrent failures against the same dying backend switch only once.
    pub fn record_failure(&mut self, index: usize) -> FailoverEvent {
        if self.alive.len() <= 1 || index != self.active {
            return FailoverEvent::Ignored;
        }

        let entropy = (self.entropy[index] + 1).min(self.max_fail);
        self.entropy[index] = entropy;
        if entropy < self.max_fail {
            return FailoverEvent::Degraded { index, entropy };
        }

        self.alive[index] = false;
        let next = (index + 1) % self.alive.len();
        self.switch_to(next);
        FailoverEvent::Switched {
            from: index,
            to: next,
        }
    }

    /// Account a success observed on backend `index`
    pub fn record_success(&mut self, index: usize) {
        if index != self.active {
            return;
        }
        if let Some(entropy) = self.entropy.get_mut(index) {
            *entropy = entropy.saturating_sub(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_dead(&mut self, index: usize) {
        self.alive[index] = false;
        self.entropy[index] = self.max_fail;
    }

    /// Snapshot labelled with the given addresses
    pub fn snapshot<'a>(&self, addresses: impl Iterator<Item = &'a str>) -> Vec<BackendStatus> {
        addresses
            .enumerate()
            .map(|(index, address)| BackendStatus {
                address: address.to_string(),
                alive: self.is_alive(index),
                entropy: self.entropy(index),
                active: index == self.active,
            })
            .collect()
    }
}
