use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Metric namespace the proxy exposes itself under.
const NAMESPACE: &str = "pushprox";

/// Histogram upper bounds in seconds.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Default)]
struct DurationHistogram {
    counts: [u64; DURATION_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl DurationHistogram {
    fn observe(&mut self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += seconds;
        self.count += 1;
    }
}

/// The proxy's own observability: a gauge of known targets and a
/// per-status-code duration histogram of proxied scrapes, rendered as
/// Prometheus text exposition for `/metrics`.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    targets: AtomicU64,
    scrapes: Mutex<BTreeMap<u16, DurationHistogram>>,
}

impl ProxyMetrics {
    pub fn set_targets(&self, count: usize) {
        self.targets.store(count as u64, Ordering::Relaxed);
    }

    pub fn targets(&self) -> u64 {
        self.targets.load(Ordering::Relaxed)
    }

    pub fn observe_scrape(&self, code: u16, seconds: f64) {
        let mut scrapes = self.scrapes.lock().expect("lock poisoned");
        scrapes.entry(code).or_default().observe(seconds);
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP {NAMESPACE}_targets Number of known pushprox targets.");
        let _ = writeln!(out, "# TYPE {NAMESPACE}_targets gauge");
        let _ = writeln!(out, "{NAMESPACE}_targets {}", self.targets());

        let name = format!("{NAMESPACE}_http_proxy_duration_seconds");
        let _ = writeln!(out, "# HELP {name} Time taken by proxied scrapes.");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let scrapes = self.scrapes.lock().expect("lock poisoned");
        for (code, histogram) in scrapes.iter() {
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{name}_bucket{{code=\"{code}\",le=\"{bound}\"}} {}",
                    histogram.counts[i]
                );
            }
            let _ = writeln!(
                out,
                "{name}_bucket{{code=\"{code}\",le=\"+Inf\"}} {}",
                histogram.count
            );
            let _ = writeln!(out, "{name}_sum{{code=\"{code}\"}} {}", histogram.sum);
            let _ = writeln!(out, "{name}_count{{code=\"{code}\"}} {}", histogram.count);
        }
        out
    }
}
