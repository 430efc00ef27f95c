use std::sync::Arc;
use std::time::Instant;

use comfy_table::Table;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

type Map<V> = DashMap<String, V, FxBuildHasher>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ops {
    pub pending: i64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Average {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Average {
    fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub name: String,
    pub value: String,
}

struct Inner {
    started: Instant,
    counters: Map<u64>,
    ops: Map<Ops>,
    averages: Map<Average>,
    domains: Map<u64>,
}

/// Process-wide counters shared by the listener, engine and upstream resolver.
///
/// Every key lives in its own map entry, so concurrent updates of unrelated
/// keys only contend when they hash into the same shard.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Instant::now(),
                counters: DashMap::with_hasher(FxBuildHasher::default()),
                ops: DashMap::with_hasher(FxBuildHasher::default()),
                averages: DashMap::with_hasher(FxBuildHasher::default()),
                domains: DashMap::with_hasher(FxBuildHasher::default()),
            }),
        }
    }

    pub fn add(&self, key: &str, value: u64) {
        if let Some(mut v) = self.inner.counters.get_mut(key) {
            *v += value;
            return;
        }
        *self.inner.counters.entry(key.to_string()).or_insert(0) += value;
    }

    pub fn inc_ops(&self, key: &str) {
        let bump = |ops: &mut Ops| {
            ops.pending += 1;
            ops.total += 1;
        };
        if let Some(mut v) = self.inner.ops.get_mut(key) {
            bump(&mut *v);
            return;
        }
        let mut entry = self.inner.ops.entry(key.to_string()).or_default();
        bump(&mut *entry);
    }

    pub fn dec_ops(&self, key: &str) {
        if let Some(mut v) = self.inner.ops.get_mut(key) {
            v.pending -= 1;
        }
    }

    pub fn add_avg(&self, key: &str, value: f64) {
        if let Some(mut v) = self.inner.averages.get_mut(key) {
            v.record(value);
            return;
        }
        self.inner
            .averages
            .entry(key.to_string())
            .and_modify(|v| v.record(value))
            .or_insert_with(|| Average::new(value));
    }

    pub fn hit_domain(&self, name: &str) {
        if let Some(mut v) = self.inner.domains.get_mut(name) {
            *v += 1;
            return;
        }
        *self.inner.domains.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.inner.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn ops(&self, key: &str) -> Ops {
        self.inner.ops.get(key).map(|v| *v).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn average(&self, key: &str) -> Option<Average> {
        self.inner.averages.get(key).map(|v| *v)
    }

    #[cfg(test)]
    pub fn domain_hits(&self, name: &str) -> u64 {
        self.inner.domains.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Flattened view of every metric, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricRow> {
        let mut rows = Vec::new();
        for entry in self.inner.counters.iter() {
            rows.push(MetricRow {
                name: entry.key().clone(),
                value: entry.value().to_string(),
            });
        }
        for entry in self.inner.ops.iter() {
            let ops = entry.value();
            rows.push(MetricRow {
                name: format!("{}_pending", entry.key()),
                value: ops.pending.to_string(),
            });
            rows.push(MetricRow {
                name: format!("{}_total", entry.key()),
                value: ops.total.to_string(),
            });
        }
        for entry in self.inner.averages.iter() {
            let avg = entry.value();
            for (suffix, v) in [("avg", avg.mean()), ("max", avg.max), ("min", avg.min)] {
                rows.push(MetricRow {
                    name: format!("{}_{}", entry.key(), suffix),
                    value: format!("{v:.3}"),
                });
            }
        }
        rows.push(MetricRow {
            name: "uptime".to_string(),
            value: format!("{:.3}", self.inner.started.elapsed().as_secs_f64()),
        });
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Per-domain hits, most hit first.
    pub fn domain_snapshot(&self) -> Vec<(String, u64)> {
        let mut rows: Vec<(String, u64)> = self
            .inner
            .domains
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    /// Metric table followed by the per-domain hit table.
    pub fn render_table(&self) -> String {
        let mut metrics = Table::new();
        metrics.set_header(vec!["metric", "value"]);
        for row in self.snapshot() {
            metrics.add_row(vec![row.name, row.value]);
        }

        let domains = self.domain_snapshot();
        if domains.is_empty() {
            return metrics.to_string();
        }
        let mut hits = Table::new();
        hits.set_header(vec!["domain", "hits"]);
        for (domain, count) in domains {
            hits.add_row(vec![domain, count.to_string()]);
        }
        format!("{metrics}\n{hits}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.add("net.bytes_received", 10);
        m.add("net.bytes_received", 5);
        assert_eq!(m.counter("net.bytes_received"), 15);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn ops_track_pending_and_total() {
        let m = Metrics::new();
        m.inc_ops("core.requests");
        m.inc_ops("core.requests");
        m.dec_ops("core.requests");
        assert_eq!(
            m.ops("core.requests"),
            Ops {
                pending: 1,
                total: 2
            }
        );
    }

    #[test]
    fn averages_keep_min_and_max() {
        let m = Metrics::new();
        for v in [4.0, 2.0, 6.0] {
            m.add_avg("core.latency_ms", v);
        }
        let avg = m.average("core.latency_ms").expect("average");
        assert_eq!(avg.count, 3);
        assert_eq!(avg.mean(), 4.0);
        assert_eq!(avg.min, 2.0);
        assert_eq!(avg.max, 6.0);
    }

    #[test]
    fn snapshot_is_sorted_and_expands_suffixes() {
        let m = Metrics::new();
        m.add("rules.block", 1);
        m.inc_ops("core.requests");
        m.add_avg("net.active_workers", 1.0);
        let names: Vec<String> = m.snapshot().into_iter().map(|r| r.name).collect();

        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for expected in [
            "core.requests_pending",
            "core.requests_total",
            "net.active_workers_avg",
            "net.active_workers_max",
            "net.active_workers_min",
            "rules.block",
            "uptime",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn render_table_lists_domains_by_hits() {
        let m = Metrics::new();
        m.hit_domain("a.com.");
        m.hit_domain("b.com.");
        m.hit_domain("b.com.");
        let table = m.render_table();
        let a = table.find("a.com.").expect("a listed");
        let b = table.find("b.com.").expect("b listed");
        assert!(b < a);
        let header = table.find("metric").expect("metric header");
        let domains = table.find("domain").expect("domain header");
        assert!(header < domains && domains < b);
        assert!(table.contains("uptime"));
    }

    #[test]
    fn render_table_without_domains_has_only_metrics() {
        let m = Metrics::new();
        m.add("net.dropped", 2);
        let table = m.render_table();
        assert!(table.contains("net.dropped"));
        assert!(!table.contains("domain"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let m = Metrics::new();
        let tasks = (0..16).map(|_| {
            let m = m.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    m.add("hits", 1);
                    m.hit_domain("example.com.");
                    m.add_avg("lat", 1.0);
                }
            })
        });
        for res in join_all(tasks).await {
            res.expect("task");
        }
        assert_eq!(m.counter("hits"), 8000);
        assert_eq!(m.domain_hits("example.com."), 8000);
        assert_eq!(m.average("lat").map(|a| a.count), Some(8000));
    }
}
