//! Process metrics with Prometheus text exposition.
//!
//! Two sources feed `GET /metrics`: live process counters (registered here,
//! atomic, label-aware) and database aggregates (task/subtask counts by
//! status, agent-run counts by type, token and cost totals, average task
//! duration) gathered at scrape time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A label set is a sorted list of key=value pairs identifying one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Labels(Vec<(String, String)>);

impl Labels {
    fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

/// Thread-safe counter registry.
#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<(String, Labels), AtomicU64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_by(name, labels, 1);
    }

    pub fn increment_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap();
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap();
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap();
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Render registered counters in Prometheus text format.
    pub fn export_counters(&self) -> String {
        let map = self.counters.read().unwrap();
        let mut grouped: HashMap<&str, Vec<(&Labels, u64)>> = HashMap::new();
        for ((name, labels), val) in map.iter() {
            grouped
                .entry(name.as_str())
                .or_default()
                .push((labels, val.load(Ordering::Relaxed)));
        }
        let mut names: Vec<&&str> = grouped.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(&format!("# TYPE {} counter\n", name));
            let mut entries = grouped[*name].clone();
            entries.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
            for (labels, value) in entries {
                out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
            }
        }
        out
    }
}

/// Database aggregates included in every scrape.
#[derive(Debug, Clone, Default)]
pub struct DbAggregates {
    pub tasks_by_status: Vec<(String, i64)>,
    pub subtasks_by_status: Vec<(String, i64)>,
    pub agent_runs_by_type: Vec<(String, i64)>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub avg_task_duration_seconds: Option<f64>,
}

/// Assemble the full exposition body from DB aggregates plus live counters.
pub fn render_exposition(agg: &DbAggregates, collector: &MetricsCollector) -> String {
    let mut out = String::new();

    out.push_str("# TYPE conductor_tasks gauge\n");
    for (status, count) in &agg.tasks_by_status {
        out.push_str(&format!("conductor_tasks{{status=\"{}\"}} {}\n", status, count));
    }

    out.push_str("# TYPE conductor_subtasks gauge\n");
    for (status, count) in &agg.subtasks_by_status {
        out.push_str(&format!(
            "conductor_subtasks{{status=\"{}\"}} {}\n",
            status, count
        ));
    }

    out.push_str("# TYPE conductor_agent_runs gauge\n");
    for (run_type, count) in &agg.agent_runs_by_type {
        out.push_str(&format!(
            "conductor_agent_runs{{type=\"{}\"}} {}\n",
            run_type, count
        ));
    }

    out.push_str("# TYPE conductor_tokens_total counter\n");
    out.push_str(&format!(
        "conductor_tokens_total{{direction=\"input\"}} {}\n",
        agg.input_tokens
    ));
    out.push_str(&format!(
        "conductor_tokens_total{{direction=\"output\"}} {}\n",
        agg.output_tokens
    ));

    out.push_str("# TYPE conductor_cost_usd_total counter\n");
    out.push_str(&format!("conductor_cost_usd_total {}\n", agg.total_cost));

    out.push_str("# TYPE conductor_task_duration_seconds_avg gauge\n");
    out.push_str(&format!(
        "conductor_task_duration_seconds_avg {}\n",
        agg.avg_task_duration_seconds.unwrap_or(0.0)
    ));

    out.push_str(&collector.export_counters());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let m = MetricsCollector::new();
        m.increment("conductor_webhooks_total", &[("event", "board_item")]);
        m.increment("conductor_webhooks_total", &[("event", "board_item")]);
        m.increment("conductor_webhooks_total", &[("event", "pull_request")]);

        assert_eq!(m.get("conductor_webhooks_total", &[("event", "board_item")]), 2);
        assert_eq!(m.get("conductor_webhooks_total", &[("event", "pull_request")]), 1);
        assert_eq!(m.get("conductor_webhooks_total", &[("event", "comment")]), 0);
    }

    #[test]
    fn exposition_contains_all_families() {
        let collector = MetricsCollector::new();
        collector.increment("conductor_jobs_total", &[("queue", "tasks")]);
        let agg = DbAggregates {
            tasks_by_status: vec![("pending".into(), 2), ("done".into(), 1)],
            subtasks_by_status: vec![("completed".into(), 3)],
            agent_runs_by_type: vec![("master".into(), 1)],
            input_tokens: 1500,
            output_tokens: 400,
            total_cost: 0.75,
            avg_task_duration_seconds: Some(12.5),
        };
        let body = render_exposition(&agg, &collector);
        assert!(body.contains("conductor_tasks{status=\"pending\"} 2"));
        assert!(body.contains("conductor_subtasks{status=\"completed\"} 3"));
        assert!(body.contains("conductor_agent_runs{type=\"master\"} 1"));
        assert!(body.contains("conductor_tokens_total{direction=\"input\"} 1500"));
        assert!(body.contains("conductor_cost_usd_total 0.75"));
        assert!(body.contains("conductor_task_duration_seconds_avg 12.5"));
        assert!(body.contains("conductor_jobs_total{queue=\"tasks\"} 1"));
    }

    #[test]
    fn label_rendering_is_sorted_and_quoted() {
        let labels = Labels::new(&[("status", "done"), ("kind", "epic")]);
        assert_eq!(labels.prometheus_str(), "{kind=\"epic\",status=\"done\"}");
        assert_eq!(Labels::new(&[]).prometheus_str(), "");
    }
}
