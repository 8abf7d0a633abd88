//! Prometheus scrape exporter
//!
//! Projects the live store onto the `/metrics` endpoint: per-instance
//! ingest bookkeeping, the poll sidebands verbatim, and the ingested
//! families guarded by the staleness policy. When an instance's ingest
//! has gone quiet past its threshold, only its cached status family is
//! emitted, with every value forced to zero, so dashboards see an
//! explicit down signal instead of frozen data.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prometheus::{Encoder, TextEncoder};

use crate::config::StaleConfig;
use crate::storage::{InstanceState, Storage};
use crate::types::{FamilyMap, MetricKind, INSTANCE_ID_LABEL};

const HELP_INGEST_BYTES: &str = "Total bytes received from the instance via ingest API.";
const HELP_INGEST_CHUNKS: &str = "Total chunks received from the instance via ingest API.";
const HELP_INGEST_EXPIRED: &str = "Total chunked transactions dropped due to TTL expiration.";
const HELP_LAST_INGEST: &str = "Unix timestamp of the last successful ingest.";

/// Renders the live store as Prometheus text exposition
pub struct ScrapeExporter {
    storage: Arc<Storage>,
    stale_multiplier: f64,
    min_stale_age: Duration,
}

/// One family merged across instances, ready to print
struct OutFamily {
    help: String,
    kind: MetricKind,
    samples: Vec<(Vec<(String, String)>, f64)>,
}

impl ScrapeExporter {
    /// Create an exporter over the shared storage
    pub fn new(storage: Arc<Storage>, stale: &StaleConfig) -> Self {
        Self {
            storage,
            stale_multiplier: stale.multiplier,
            min_stale_age: stale.min_age(),
        }
    }

    /// Render everything: the core families followed by whatever the
    /// host process registered in the global prometheus registry.
    pub fn export(&self) -> String {
        let mut output = self.render(SystemTime::now());
        match export_global_metrics() {
            Ok(global) => output.push_str(&global),
            Err(e) => tracing::error!(error = %e, "Failed to encode global registry metrics"),
        }
        output
    }

    /// Render as an HTTP body with the exposition content type
    pub fn export_http(&self) -> (String, &'static str) {
        (self.export(), "text/plain; version=0.0.4; charset=utf-8")
    }

    /// Render the core families as of `now`. Exposed separately from
    /// [`export`](Self::export) so the staleness decision can be driven
    /// against a chosen clock.
    pub fn render(&self, now: SystemTime) -> String {
        let states = self.storage.snapshot();

        let mut families: BTreeMap<String, OutFamily> = BTreeMap::new();
        let mut ids: Vec<&String> = states.keys().collect();
        ids.sort();

        for id in ids {
            let state = &states[id];
            self.collect_bookkeeping(&mut families, id, state);
            self.collect_instance(&mut families, id, state, now);
        }

        let mut output = String::new();
        for (name, family) in &families {
            let _ = writeln!(output, "# HELP {} {}", name, escape_help(&family.help));
            let _ = writeln!(output, "# TYPE {} {}", name, family.kind.as_str());
            for (labels, value) in &family.samples {
                write_sample(&mut output, name, labels, *value);
            }
        }

        output
    }

    fn collect_bookkeeping(
        &self,
        families: &mut BTreeMap<String, OutFamily>,
        instance_id: &str,
        state: &InstanceState,
    ) {
        let stats = &state.ingest_stats;
        let labels = vec![(INSTANCE_ID_LABEL.to_string(), instance_id.to_string())];

        push_sample(
            families,
            "metricz_ingest_bytes_total",
            HELP_INGEST_BYTES,
            MetricKind::Counter,
            labels.clone(),
            stats.total_bytes as f64,
        );
        push_sample(
            families,
            "metricz_ingest_chunks_total",
            HELP_INGEST_CHUNKS,
            MetricKind::Counter,
            labels.clone(),
            stats.total_chunks as f64,
        );
        push_sample(
            families,
            "metricz_ingest_transactions_expired_total",
            HELP_INGEST_EXPIRED,
            MetricKind::Counter,
            labels.clone(),
            stats.expired_transactions as f64,
        );

        if let Some(last) = stats.last_ingest {
            let unix = last
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            push_sample(
                families,
                "metricz_ingest_last_timestamp_seconds",
                HELP_LAST_INGEST,
                MetricKind::Gauge,
                labels,
                unix,
            );
        }
    }

    fn collect_instance(
        &self,
        families: &mut BTreeMap<String, OutFamily>,
        instance_id: &str,
        state: &InstanceState,
        now: SystemTime,
    ) {
        for source in [
            &state.polled_families,
            &state.a2s_families,
            &state.rcon_families,
        ]
        .into_iter()
        .flatten()
        {
            collect_families(families, source);
        }

        let (ingested, last_update) = match (&state.ingested_families, state.last_ingest_update) {
            (Some(f), Some(t)) => (f, t),
            _ => return,
        };

        let age = now.duration_since(last_update).unwrap_or_default();
        let threshold = self.stale_threshold(state.scrape_interval);

        if age > threshold {
            tracing::warn!(
                instance_id,
                since_update_secs = age.as_secs(),
                threshold_secs = threshold.as_secs(),
                "Ingest metrics are stale, resetting status to 0"
            );

            if let Some(status) = &state.cached_status_family {
                let kind = if status.kind.is_exportable() {
                    status.kind
                } else {
                    MetricKind::Gauge
                };
                for sample in &status.samples {
                    push_sample(
                        families,
                        &status.name,
                        &status.help,
                        kind,
                        sample.labels.clone(),
                        0.0,
                    );
                }
            }
        } else {
            collect_families(families, ingested);
        }
    }

    fn stale_threshold(&self, scrape_interval: f64) -> Duration {
        let secs = scrape_interval * self.stale_multiplier;
        if secs.is_finite() && secs > 0.0 {
            self.min_stale_age.max(Duration::from_secs_f64(secs))
        } else {
            self.min_stale_age
        }
    }
}

/// Append every gauge/counter sample of a family map
fn collect_families(out: &mut BTreeMap<String, OutFamily>, source: &FamilyMap) {
    for family in source.values() {
        if !family.kind.is_exportable() {
            continue;
        }
        for sample in &family.samples {
            push_sample(
                out,
                &family.name,
                &family.help,
                family.kind,
                sample.labels.clone(),
                sample.value,
            );
        }
    }
}

fn push_sample(
    out: &mut BTreeMap<String, OutFamily>,
    name: &str,
    help: &str,
    kind: MetricKind,
    labels: Vec<(String, String)>,
    value: f64,
) {
    let family = out.entry(name.to_string()).or_insert_with(|| OutFamily {
        help: help.to_string(),
        kind,
        samples: Vec::new(),
    });
    family.samples.push((labels, value));
}

fn write_sample(output: &mut String, name: &str, labels: &[(String, String)], value: f64) {
    output.push_str(name);
    if !labels.is_empty() {
        output.push('{');
        for (i, (label, label_value)) in labels.iter().enumerate() {
            if i > 0 {
                output.push(',');
            }
            let _ = write!(output, "{}=\"{}\"", label, escape_label_value(label_value));
        }
        output.push('}');
    }
    output.push(' ');
    output.push_str(&format_value(value));
    output.push('\n');
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Encode everything registered in the default prometheus registry,
/// including the process collector the crate registers on Linux.
fn export_global_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("failed to encode metrics: {e}"))?;

    String::from_utf8(buffer).map_err(|e| format!("metrics contain invalid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_and_validate;

    fn stale_cfg() -> StaleConfig {
        StaleConfig {
            multiplier: 2.0,
            min_age_secs: 30,
        }
    }

    fn ingest(storage: &Storage, instance: &str, text: &str) {
        let families = parse_and_validate(text.as_bytes(), instance, false).unwrap();
        storage.update_ingested(instance, families, text.len(), 1);
    }

    #[test]
    fn test_bookkeeping_samples() {
        let storage = Arc::new(Storage::new(1024));
        ingest(&storage, "srv-a", "foo 1\n");

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        assert!(output.contains("# TYPE metricz_ingest_bytes_total counter"));
        assert!(output.contains("metricz_ingest_bytes_total{instance_id=\"srv-a\"} 6"));
        assert!(output.contains("metricz_ingest_chunks_total{instance_id=\"srv-a\"} 1"));
        assert!(output.contains("metricz_ingest_transactions_expired_total{instance_id=\"srv-a\"} 0"));
        assert!(output.contains("metricz_ingest_last_timestamp_seconds{instance_id=\"srv-a\"}"));
    }

    #[test]
    fn test_last_ingest_omitted_without_ingest() {
        let storage = Arc::new(Storage::new(1024));
        storage.update_polled(
            "srv-a",
            parse_and_validate(b"p 1\n".as_slice(), "srv-a", false).unwrap(),
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        assert!(output.contains("metricz_ingest_bytes_total{instance_id=\"srv-a\"} 0"));
        assert!(!output.contains("metricz_ingest_last_timestamp_seconds"));
    }

    #[test]
    fn test_fresh_ingested_families_emitted_verbatim() {
        let storage = Arc::new(Storage::new(1024));
        ingest(
            &storage,
            "srv-a",
            "# TYPE dayz_metricz_status gauge\ndayz_metricz_status 1\n# TYPE foo gauge\nfoo 7\n",
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        assert!(output.contains("dayz_metricz_status{instance_id=\"srv-a\"} 1"));
        assert!(output.contains("foo{instance_id=\"srv-a\"} 7"));
    }

    #[test]
    fn test_staleness_collapse_to_status_zero() {
        let storage = Arc::new(Storage::new(1024));
        ingest(
            &storage,
            "srv-a",
            "# TYPE dayz_metricz_scrape_interval_seconds gauge\ndayz_metricz_scrape_interval_seconds 15\n\
             # TYPE dayz_metricz_status gauge\ndayz_metricz_status 1\n\
             # TYPE foo gauge\nfoo 7\n",
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        // threshold = max(15 * 2.0, 30) = 30s; 45s is past it
        let output = exporter.render(SystemTime::now() + Duration::from_secs(45));

        assert!(output.contains("dayz_metricz_status{instance_id=\"srv-a\"} 0"));
        assert!(!output.contains("\nfoo"));
        assert!(!output.contains("dayz_metricz_scrape_interval_seconds{"));
    }

    #[test]
    fn test_staleness_transition_is_monotonic() {
        let storage = Arc::new(Storage::new(1024));
        ingest(
            &storage,
            "srv-a",
            "# TYPE dayz_metricz_scrape_interval_seconds gauge\ndayz_metricz_scrape_interval_seconds 15\n\
             # TYPE dayz_metricz_status gauge\ndayz_metricz_status 1\n",
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let base = SystemTime::now();

        let fresh = exporter.render(base + Duration::from_secs(20));
        assert!(fresh.contains("dayz_metricz_status{instance_id=\"srv-a\"} 1"));

        for age in [31, 60, 600] {
            let stale = exporter.render(base + Duration::from_secs(age));
            assert!(stale.contains("dayz_metricz_status{instance_id=\"srv-a\"} 0"));
        }
    }

    #[test]
    fn test_min_stale_age_floor() {
        let storage = Arc::new(Storage::new(1024));
        // Tiny scrape interval: the 30s floor still applies
        ingest(
            &storage,
            "srv-a",
            "# TYPE dayz_metricz_scrape_interval_seconds gauge\ndayz_metricz_scrape_interval_seconds 1\n\
             # TYPE dayz_metricz_status gauge\ndayz_metricz_status 1\n",
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now() + Duration::from_secs(20));
        assert!(output.contains("dayz_metricz_status{instance_id=\"srv-a\"} 1"));
    }

    #[test]
    fn test_sideband_families_survive_staleness() {
        let storage = Arc::new(Storage::new(1024));
        ingest(&storage, "srv-a", "# TYPE foo gauge\nfoo 7\n");
        storage.update_a2s(
            "srv-a",
            parse_and_validate(
                b"# TYPE metricz_a2s_up gauge\nmetricz_a2s_up 1\n".as_slice(),
                "srv-a",
                false,
            )
            .unwrap(),
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now() + Duration::from_secs(3600));

        assert!(output.contains("metricz_a2s_up{instance_id=\"srv-a\"} 1"));
        assert!(!output.contains("\nfoo"));
    }

    #[test]
    fn test_untyped_families_are_skipped() {
        let storage = Arc::new(Storage::new(1024));
        ingest(&storage, "srv-a", "untyped_thing 1\n# TYPE typed gauge\ntyped 2\n");

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        assert!(!output.contains("untyped_thing"));
        assert!(output.contains("typed{instance_id=\"srv-a\"} 2"));
    }

    #[test]
    fn test_every_sample_carries_instance_id() {
        let storage = Arc::new(Storage::new(1024));
        ingest(&storage, "srv-a", "# TYPE foo gauge\nfoo 1\nfoo{x=\"y\"} 2\n");
        ingest(&storage, "srv-b", "# TYPE bar counter\nbar 3\n");

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        for line in output.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            assert!(
                line.contains("instance_id=\""),
                "sample without instance_id: {line}"
            );
        }
    }

    #[test]
    fn test_type_declared_once_across_instances() {
        let storage = Arc::new(Storage::new(1024));
        ingest(&storage, "srv-a", "# TYPE foo gauge\nfoo 1\n");
        ingest(&storage, "srv-b", "# TYPE foo gauge\nfoo 2\n");

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());

        assert_eq!(output.matches("# TYPE foo gauge").count(), 1);
        assert!(output.contains("foo{instance_id=\"srv-a\"} 1"));
        assert!(output.contains("foo{instance_id=\"srv-b\"} 2"));
    }

    #[test]
    fn test_label_value_escaping() {
        let storage = Arc::new(Storage::new(1024));
        ingest(
            &storage,
            "srv-a",
            "# TYPE foo gauge\nfoo{name=\"a \\\"b\\\"\"} 1\n",
        );

        let exporter = ScrapeExporter::new(storage, &stale_cfg());
        let output = exporter.render(SystemTime::now());
        assert!(output.contains("name=\"a \\\"b\\\"\""));
    }
}
