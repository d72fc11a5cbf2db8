// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Metrics observation layer. Each middleware is handed an explicit
//! registry at construction time instead of reaching for a process-global
//! singleton; hot-path label lookups are cached in a once-constructor map
//! keyed by the canonicalized label tuple, so the counter handle for a
//! given label set is built at most once.

mod labels;

pub use labels::{canon_family, canon_qtype, canon_rcode, Family};

use once_cell::sync::OnceCell;
use prometheus::{CounterVec, HistogramVec, Registry};
use std::{collections::HashMap, sync::RwLock};

/// Per-component metrics sink, constructed once per middleware at pipeline
/// build time (§4.4 "Each wrapping step captures ... a dedicated metrics
/// sink").
pub struct ComponentMetrics {
    component: &'static str,
    requests_total: CounterVec,
    errors_total: CounterVec,
    latency_seconds: HistogramVec,
    // Once-constructed per-label-tuple counter handles, so the hot path
    // never allocates a label slice to look a counter up twice (§4.5, §9).
    once: OnceCell<RwLock<HashMap<Vec<String>, prometheus::Counter>>>,
}

impl ComponentMetrics {
    /// Register a new component's counters/histograms against `registry`.
    /// `labels` names the label dimensions this component uses, e.g.
    /// `&["server", "protocol", "qtype"]`.
    pub fn new(
        registry: &Registry,
        component: &'static str,
        labels: &[&str],
    ) -> prometheus::Result<Self> {
        let requests_total = CounterVec::new(
            prometheus::Opts::new(
                format!("agdns_{component}_requests_total"),
                format!("Total requests observed by {component}"),
            ),
            labels,
        )?;
        let errors_total = CounterVec::new(
            prometheus::Opts::new(
                format!("agdns_{component}_errors_total"),
                format!("Total errors observed by {component}"),
            ),
            labels,
        )?;
        let latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                format!("agdns_{component}_latency_seconds"),
                format!("Latency observed by {component}"),
            ),
            labels,
        )?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        Ok(Self {
            component,
            requests_total,
            errors_total,
            latency_seconds,
            once: OnceCell::new(),
        })
    }

    fn once_map(&self) -> &RwLock<HashMap<Vec<String>, prometheus::Counter>> {
        self.once.get_or_init(|| RwLock::new(HashMap::new()))
    }

    /// Canonicalized, allocation-cached counter for one label tuple. First
    /// lookup constructs and stores the counter; every subsequent lookup
    /// for the same tuple is a read-lock hash lookup.
    pub fn counter_for(&self, label_values: &[&str]) -> prometheus::Counter {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        if let Some(c) = self.once_map().read().unwrap().get(&key) {
            return c.clone();
        }
        let mut map = self.once_map().write().unwrap();
        map.entry(key)
            .or_insert_with(|| self.requests_total.with_label_values(label_values))
            .clone()
    }

    /// Record one request observation.
    pub fn observe(&self, label_values: &[&str], latency_seconds: f64) {
        self.requests_total.with_label_values(label_values).inc();
        self.latency_seconds
            .with_label_values(label_values)
            .observe(latency_seconds);
    }

    /// Record an error observation (`OnError`, §5, §6 `MetricsListener`).
    pub fn observe_error(&self, label_values: &[&str]) {
        self.errors_total.with_label_values(label_values).inc();
    }

    /// Component name this sink was constructed for.
    pub fn component(&self) -> &'static str {
        self.component
    }
}

/// `MetricsListener` families consumed by the pipeline: server, forward,
/// cache, rate-limit (§6). Each family is just a `ComponentMetrics` with a
/// fixed label schema; kept as distinct types so call sites can't mix up
/// which sink they are writing to.
pub struct MetricsRegistry {
    /// Registry all component sinks below are registered against.
    pub registry: Registry,
    /// Server/listener-level metrics.
    pub server: ComponentMetrics,
    /// Forward-resolver metrics.
    pub forward: ComponentMetrics,
    /// Cache-layer metrics.
    pub cache: ComponentMetrics,
    /// Rate-limit-engine metrics.
    pub ratelimit: ComponentMetrics,
}

impl MetricsRegistry {
    /// Build a fresh registry with all four component families registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            server: ComponentMetrics::new(
                &registry,
                "server",
                &["server_name", "protocol", "network", "rcode"],
            )?,
            forward: ComponentMetrics::new(
                &registry,
                "forward",
                &["upstream", "network", "qtype", "family"],
            )?,
            cache: ComponentMetrics::new(&registry, "cache", &["hit", "qtype"])?,
            ratelimit: ComponentMetrics::new(&registry, "ratelimit", &["outcome", "family"])?,
            registry,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new().expect("static metric descriptors never fail to register")
    }
}
