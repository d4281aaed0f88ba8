// sqlbridge-core/src/metrics.rs
//! Process-wide counters for the bridge

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::hooks::HookKind;

#[derive(Debug, Default)]
pub struct Metrics {
    enabled: AtomicBool,
    pub env_hits: AtomicU64,
    pub env_misses: AtomicU64,
    pub env_evictions: AtomicU64,
    pub connections_allocated: AtomicU64,
    pub connections_recycled: AtomicU64,
    pub connections_released: AtomicU64,
    hook_calls: [AtomicU64; HookKind::COUNT],
    pub udf_func: AtomicU64,
    pub udf_step: AtomicU64,
    pub udf_final: AtomicU64,
    pub udf_value: AtomicU64,
    pub udf_inverse: AtomicU64,
    pub auto_ext_runs: AtomicU64,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        let metrics = Metrics::default();
        metrics.enabled.store(enabled, Ordering::Relaxed);
        metrics
    }

    #[inline]
    pub fn incr(&self, counter: &AtomicU64) {
        if self.enabled.load(Ordering::Relaxed) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn hook_called(&self, kind: HookKind) {
        self.incr(&self.hook_calls[kind.index()]);
    }

    pub fn hook_calls(&self, kind: HookKind) -> u64 {
        self.hook_calls[kind.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy; counters keep moving while it is taken
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            env_hits: load(&self.env_hits),
            env_misses: load(&self.env_misses),
            env_evictions: load(&self.env_evictions),
            connections_allocated: load(&self.connections_allocated),
            connections_recycled: load(&self.connections_recycled),
            connections_released: load(&self.connections_released),
            hook_calls: HookKind::ALL
                .iter()
                .map(|k| (k.name().to_string(), self.hook_calls(*k)))
                .filter(|(_, n)| *n > 0)
                .collect(),
            udf_func: load(&self.udf_func),
            udf_step: load(&self.udf_step),
            udf_final: load(&self.udf_final),
            udf_value: load(&self.udf_value),
            udf_inverse: load(&self.udf_inverse),
            auto_ext_runs: load(&self.auto_ext_runs),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub env_hits: u64,
    pub env_misses: u64,
    pub env_evictions: u64,
    pub connections_allocated: u64,
    pub connections_recycled: u64,
    pub connections_released: u64,
    pub hook_calls: Vec<(String, u64)>,
    pub udf_func: u64,
    pub udf_step: u64,
    pub udf_final: u64,
    pub udf_value: u64,
    pub udf_inverse: u64,
    pub auto_ext_runs: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_stay_zero() {
        let m = Metrics::new(false);
        m.incr(&m.udf_func);
        m.hook_called(HookKind::Commit);
        assert_eq!(m.snapshot().udf_func, 0);
        assert_eq!(m.hook_calls(HookKind::Commit), 0);
    }

    #[test]
    fn test_snapshot_json() {
        let m = Metrics::new(true);
        m.incr(&m.udf_step);
        m.hook_called(HookKind::Trace);
        m.hook_called(HookKind::Trace);
        let snap = m.snapshot();
        assert_eq!(snap.udf_step, 1);
        assert_eq!(snap.hook_calls, vec![("trace".to_string(), 2)]);
        let json: serde_json::Value = serde_json::from_str(&snap.to_json()).unwrap();
        assert_eq!(json["udf_step"], 1);
    }
}
