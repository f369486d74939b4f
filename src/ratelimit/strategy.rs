//! Failover strategies: which backends to try, and in what order.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Failover strategy names as they appear in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Always prefer the earliest healthy backend in configured order
    #[default]
    FirstHealthy,
    /// Rotate the starting backend among healthy ones
    RoundRobin,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FirstHealthy => "first_healthy",
            StrategyKind::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_healthy" => Ok(StrategyKind::FirstHealthy),
            "round_robin" => Ok(StrategyKind::RoundRobin),
            other => Err(format!("unknown failover strategy '{}'", other)),
        }
    }
}

/// A configured strategy together with any state it needs across calls.
#[derive(Debug)]
pub enum FailoverStrategy {
    FirstHealthy,
    RoundRobin {
        /// Shared across callers; wraps on overflow
        cursor: AtomicUsize,
    },
}

impl FailoverStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::FirstHealthy => FailoverStrategy::FirstHealthy,
            StrategyKind::RoundRobin => FailoverStrategy::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            FailoverStrategy::FirstHealthy => StrategyKind::FirstHealthy,
            FailoverStrategy::RoundRobin { .. } => StrategyKind::RoundRobin,
        }
    }

    /// Produce the candidate order for one operation.
    ///
    /// `healthy[i]` is the health of the i-th configured backend. The result
    /// holds backend indices. When no backend is healthy every backend is
    /// returned in configured order, since a stale record may be wrong.
    pub fn candidates(&self, healthy: &[bool]) -> Vec<usize> {
        let healthy_indices: Vec<usize> = healthy
            .iter()
            .enumerate()
            .filter_map(|(index, &ok)| ok.then_some(index))
            .collect();

        if healthy_indices.is_empty() {
            return (0..healthy.len()).collect();
        }

        match self {
            FailoverStrategy::FirstHealthy => healthy_indices,
            FailoverStrategy::RoundRobin { cursor } => {
                let start = cursor.fetch_add(1, Ordering::Relaxed) % healthy_indices.len();
                let mut order = Vec::with_capacity(healthy_indices.len());
                order.extend_from_slice(&healthy_indices[start..]);
                order.extend_from_slice(&healthy_indices[..start]);
                order
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_healthy_all_healthy_keeps_configured_order() {
        let strategy = FailoverStrategy::new(StrategyKind::FirstHealthy);
        for _ in 0..10 {
            assert_eq!(strategy.candidates(&[true, true, true]), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_first_healthy_skips_unhealthy() {
        let strategy = FailoverStrategy::new(StrategyKind::FirstHealthy);
        assert_eq!(strategy.candidates(&[false, true, true]), vec![1, 2]);
        assert_eq!(strategy.candidates(&[true, false, true]), vec![0, 2]);
    }

    #[test]
    fn test_none_healthy_falls_back_to_full_order() {
        for kind in [StrategyKind::FirstHealthy, StrategyKind::RoundRobin] {
            let strategy = FailoverStrategy::new(kind);
            assert_eq!(strategy.candidates(&[false, false, false]), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_round_robin_rotates_among_healthy() {
        let strategy = FailoverStrategy::new(StrategyKind::RoundRobin);
        let healthy = [true, false, true, true];

        assert_eq!(strategy.candidates(&healthy), vec![0, 2, 3]);
        assert_eq!(strategy.candidates(&healthy), vec![2, 3, 0]);
        assert_eq!(strategy.candidates(&healthy), vec![3, 0, 2]);
        assert_eq!(strategy.candidates(&healthy), vec![0, 2, 3]);
    }

    #[test]
    fn test_round_robin_balances_under_concurrency() {
        let strategy = Arc::new(FailoverStrategy::new(StrategyKind::RoundRobin));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let strategy = strategy.clone();
                std::thread::spawn(move || {
                    let mut firsts = [0usize; 3];
                    for _ in 0..300 {
                        firsts[strategy.candidates(&[true, true, true])[0]] += 1;
                    }
                    firsts
                })
            })
            .collect();

        let mut totals = [0usize; 3];
        for thread in threads {
            let firsts = thread.join().unwrap();
            for (total, count) in totals.iter_mut().zip(firsts) {
                *total += count;
            }
        }

        // No lost cursor updates: 1200 calls spread exactly over 3 backends
        assert_eq!(totals, [400, 400, 400]);
    }

    #[test]
    fn test_round_robin_cursor_wraps() {
        let strategy = FailoverStrategy::RoundRobin {
            cursor: AtomicUsize::new(usize::MAX),
        };
        assert_eq!(strategy.candidates(&[true, true]).len(), 2);
        assert_eq!(strategy.candidates(&[true, true]).len(), 2);
    }

    #[test]
    fn test_strategy_kind_names() {
        assert_eq!(StrategyKind::FirstHealthy.to_string(), "first_healthy");
        assert_eq!(
            "round_robin".parse::<StrategyKind>(),
            Ok(StrategyKind::RoundRobin)
        );
        assert!("quorum_write".parse::<StrategyKind>().is_err());
        assert_eq!(
            FailoverStrategy::new(StrategyKind::RoundRobin).kind(),
            StrategyKind::RoundRobin
        );
    }
}
