use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// A histogram tracking the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries.
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value into the histogram.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // Sum stored as f64 bits so it can be updated atomically.
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let new_bits = (f64::from_bits(current) + value).to_bits();
            match self.sum.compare_exchange_weak(
                current,
                new_bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Default buckets for external API call durations (seconds). Sync calls to
/// the tracker/board/platform routinely take whole seconds, hence the tail.
fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

// ---------------------------------------------------------------------------
// Label key
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs, used to distinguish
/// metric families (e.g. `api="tracker"` vs `api="board"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Format labels as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
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

    /// Merge extra label pairs into this set for histogram bucket lines.
    fn with_pair(&self, key: &str, value: &str) -> Labels {
        let mut v = self.0.clone();
        v.push((key.to_string(), value.to_string()));
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Labels(v)
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Central metrics collector supporting counters, gauges, and labeled
/// histograms, with Prometheus text exposition.
///
/// Thread-safe via interior mutability (`RwLock` for dynamic registration,
/// `Atomic*` for values).
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<(String, Labels), Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// Create a collector pre-registered with the standard sync metrics so
    /// the /metrics endpoint exposes them from the first scrape.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut c = collector.counters.write().unwrap();
            for name in ["sync_runs_total", "sync_runs_failed_total"] {
                c.insert((name.to_string(), Labels::empty()), AtomicU64::new(0));
            }
        }
        {
            let mut h = collector.histograms.write().unwrap();
            for api in ["tracker", "board", "platform", "localstore"] {
                h.insert(
                    (
                        "api_request_duration_seconds".to_string(),
                        Labels::new(&[("api", api)]),
                    ),
                    Histogram::new(default_duration_buckets()),
                );
            }
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    /// Increment a counter by 1.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
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

    /// Get the current value of a counter.
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap();
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap();
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        let map = self.gauges.read().unwrap();
        map.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value into a labeled histogram, creating it with the default
    /// duration buckets if absent.
    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.histograms.read().unwrap();
            if let Some(h) = map.get(&key) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap();
        map.entry(key)
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    // -- Export --------------------------------------------------------------

    /// Export all metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap();
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                for (labels, value) in &grouped[name] {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = self.gauges.read().unwrap();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} gauge\n", name));
                out.push_str(&format!("{} {}\n", name, map[name].load(Ordering::Relaxed)));
            }
        }

        {
            let map = self.histograms.read().unwrap();
            let mut keys: Vec<&(String, Labels)> = map.keys().collect();
            keys.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| {
                a.1.prometheus_str().cmp(&b.1.prometheus_str())
            }));
            let mut last_name = "";
            for key in keys {
                let (name, labels) = key;
                let h = &map[key];
                if last_name != name {
                    out.push_str(&format!("# TYPE {} histogram\n", name));
                    last_name = name;
                }
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    let le = labels.with_pair("le", &boundary.to_string());
                    out.push_str(&format!(
                        "{}_bucket{} {}\n",
                        name,
                        le.prometheus_str(),
                        cumulative
                    ));
                }
                let le = labels.with_pair("le", "+Inf");
                out.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    le.prometheus_str(),
                    h.get_count()
                ));
                out.push_str(&format!(
                    "{}_sum{} {}\n",
                    name,
                    labels.prometheus_str(),
                    h.get_sum()
                ));
                out.push_str(&format!(
                    "{}_count{} {}\n",
                    name,
                    labels.prometheus_str(),
                    h.get_count()
                ));
            }
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// Returns a reference to the global `MetricsCollector` singleton shared by
/// the HTTP pool, the controller, and the API server.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increment() {
        let m = MetricsCollector::new();
        m.increment_counter("sync_runs_total", &[]);
        m.increment_counter("sync_runs_total", &[]);
        m.increment_counter("sync_runs_failed_total", &[]);

        assert_eq!(m.get_counter("sync_runs_total", &[]), 2);
        assert_eq!(m.get_counter("sync_runs_failed_total", &[]), 1);
        assert_eq!(m.get_counter("issues_synced_total", &[]), 0);
    }

    #[test]
    fn counter_with_labels() {
        let m = MetricsCollector::new();
        m.increment_counter_by("api_requests_total", &[("api", "tracker")], 3);
        m.increment_counter("api_requests_total", &[("api", "board")]);
        assert_eq!(m.get_counter("api_requests_total", &[("api", "tracker")]), 3);
        assert_eq!(m.get_counter("api_requests_total", &[("api", "board")]), 1);
    }

    #[test]
    fn gauge_set() {
        let m = MetricsCollector::new();
        m.set_gauge("projects_count", 7);
        assert_eq!(m.get_gauge("projects_count"), 7);
        m.set_gauge("projects_count", 5);
        assert_eq!(m.get_gauge("projects_count"), 5);
    }

    #[test]
    fn histogram_record_and_export() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram("api_request_duration_seconds", &[("api", "tracker")], 0.05);
        m.record_histogram("api_request_duration_seconds", &[("api", "tracker")], 2.0);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE api_request_duration_seconds histogram"));
        assert!(out.contains("api_request_duration_seconds_count{api=\"tracker\"} 2"));
        assert!(out.contains("le=\"+Inf\""));
    }

    #[test]
    fn prometheus_export_counters_and_gauges() {
        let m = MetricsCollector::new();
        m.increment_counter("sync_runs_total", &[]);
        m.set_gauge("sync_in_progress", 1);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE sync_runs_total counter"));
        assert!(out.contains("sync_runs_total 1"));
        assert!(out.contains("# TYPE sync_in_progress gauge"));
        assert!(out.contains("sync_in_progress 1"));
    }

    #[test]
    fn labels_prometheus_format() {
        let l = Labels::new(&[("status", "200"), ("api", "board")]);
        assert_eq!(l.prometheus_str(), "{api=\"board\",status=\"200\"}");
        assert_eq!(Labels::empty().prometheus_str(), "");
    }

    #[test]
    fn global_metrics_singleton() {
        let a = global_metrics();
        let b = global_metrics();
        assert!(std::ptr::eq(a, b));
    }
}
