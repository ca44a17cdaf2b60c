use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::registry::WorkerHandle;

/// Worker selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    /// Fewest tasks currently in flight; ties go to the earliest registered.
    LeastLoaded,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_loaded" => Ok(Strategy::LeastLoaded),
            other => Err(format!(
                "unknown strategy '{}', expected round_robin, random or least_loaded",
                other
            )),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastLoaded => "least_loaded",
        };
        f.write_str(name)
    }
}

/// Picks a worker from a registry snapshot. The input list is never modified.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns `None` only for an empty list.
    pub fn select(&self, workers: &[WorkerHandle]) -> Option<WorkerHandle> {
        if workers.is_empty() {
            return None;
        }

        let index = match self.strategy {
            Strategy::RoundRobin => self.next_round_robin(workers.len()),
            Strategy::Random => rand::thread_rng().gen_range(0..workers.len()),
            Strategy::LeastLoaded => workers
                .iter()
                .enumerate()
                .min_by_key(|(i, h)| (h.in_flight(), *i))
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        workers.get(index).cloned()
    }

    /// Current cursor position (clamped if the list shrank), then advances it modulo `len`.
    fn next_round_robin(&self, len: usize) -> usize {
        let previous = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cursor| {
                let current = if cursor >= len { 0 } else { cursor };
                Some((current + 1) % len)
            })
            .unwrap_or(0);

        if previous >= len { 0 } else { previous }
    }
}
