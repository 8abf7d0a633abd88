use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use metricz_gateway::config::{Config, IngestConfig, StaleConfig};
use metricz_gateway::error::IngestError;
use metricz_gateway::ingest::{BodyFormat, Ingestor};
use metricz_gateway::public::PublicProjector;
use metricz_gateway::scrape::ScrapeExporter;
use metricz_gateway::storage::Storage;

fn setup() -> (Arc<Storage>, Ingestor) {
    let cfg = IngestConfig::default();
    let storage = Arc::new(Storage::new(cfg.max_staging_size));
    let ingestor = Ingestor::new(storage.clone(), &cfg);
    (storage, ingestor)
}

fn text(body: &str) -> Bytes {
    Bytes::copy_from_slice(body.as_bytes())
}

#[test]
fn identity_injection() {
    let (storage, ingestor) = setup();

    ingestor
        .single_shot("srv-a", text("foo{} 1\n"), BodyFormat::Text)
        .unwrap();

    let snap = storage.snapshot();
    let foo = &snap["srv-a"].ingested_families.as_ref().unwrap()["foo"];
    assert_eq!(foo.samples.len(), 1);
    assert_eq!(
        foo.samples[0].labels,
        vec![("instance_id".to_string(), "srv-a".to_string())]
    );
    assert_eq!(foo.samples[0].value, 1.0);
}

#[test]
fn identity_mismatch_rejected_and_store_unchanged() {
    let (storage, ingestor) = setup();

    let err = ingestor
        .single_shot(
            "srv-a",
            text("foo{instance_id=\"srv-b\"} 1\n"),
            BodyFormat::Text,
        )
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    let msg = err.to_string();
    assert!(msg.contains("foo"));
    assert!(msg.contains("srv-a"));
    assert!(msg.contains("srv-b"));

    assert!(storage.snapshot().is_empty());
}

#[test]
fn identity_overwrite() {
    let cfg = IngestConfig {
        overwrite_instance_id: true,
        ..IngestConfig::default()
    };
    let storage = Arc::new(Storage::new(cfg.max_staging_size));
    let ingestor = Ingestor::new(storage.clone(), &cfg);

    ingestor
        .single_shot(
            "srv-a",
            text("foo{instance_id=\"srv-b\"} 1\n"),
            BodyFormat::Text,
        )
        .unwrap();

    let snap = storage.snapshot();
    let foo = &snap["srv-a"].ingested_families.as_ref().unwrap()["foo"];
    assert_eq!(foo.samples[0].label("instance_id"), Some("srv-a"));
}

#[test]
fn chunked_reassembly_out_of_order() {
    let (storage, ingestor) = setup();

    ingestor
        .chunk("srv-a", "txn", "3", text("# TYPE c gauge\nc 3\n"), BodyFormat::Text)
        .unwrap();
    ingestor
        .chunk("srv-a", "txn", "1", text("# TYPE a gauge\na 1\n"), BodyFormat::Text)
        .unwrap();
    ingestor
        .chunk("srv-a", "txn", "2", text("# TYPE b gauge\nb 2"), BodyFormat::Text)
        .unwrap();

    let outcome = ingestor.commit("srv-a", "txn").unwrap();
    assert_eq!(outcome.chunks, 3);
    assert_eq!(outcome.families, 3);

    let snap = storage.snapshot();
    let families = snap["srv-a"].ingested_families.as_ref().unwrap();
    for name in ["a", "b", "c"] {
        assert!(families.contains_key(name), "missing family {name}");
    }
    assert_eq!(snap["srv-a"].ingest_stats.total_chunks, 3);

    // The transaction is gone after commit
    assert!(matches!(
        ingestor.commit("srv-a", "txn").unwrap_err(),
        IngestError::TxnNotFound(_)
    ));
}

#[test]
fn staleness_collapse_end_to_end() {
    let (storage, ingestor) = setup();

    ingestor
        .single_shot(
            "srv-a",
            text(
                "# TYPE dayz_metricz_scrape_interval_seconds gauge\n\
                 dayz_metricz_scrape_interval_seconds 15\n\
                 # TYPE dayz_metricz_status gauge\n\
                 dayz_metricz_status 1\n\
                 # TYPE dayz_metricz_players gauge\n\
                 dayz_metricz_players 17\n",
            ),
            BodyFormat::Text,
        )
        .unwrap();

    let stale = StaleConfig {
        multiplier: 2.0,
        min_age_secs: 30,
    };
    let exporter = ScrapeExporter::new(storage, &stale);

    // 45 seconds later the 30s threshold has passed: only the zeroed
    // status family remains of the ingested payload
    let output = exporter.render(SystemTime::now() + Duration::from_secs(45));
    assert!(output.contains("dayz_metricz_status{instance_id=\"srv-a\"} 0"));
    assert!(!output.contains("dayz_metricz_players"));
}

#[test]
fn deduplication_last_write_wins() {
    let (storage, ingestor) = setup();

    ingestor
        .single_shot(
            "srv-a",
            text("foo{a=\"1\",b=\"2\"} 1\nfoo{b=\"2\",a=\"1\"} 2\n"),
            BodyFormat::Text,
        )
        .unwrap();

    let snap = storage.snapshot();
    let foo = &snap["srv-a"].ingested_families.as_ref().unwrap()["foo"];
    assert_eq!(foo.samples.len(), 1);
    assert_eq!(foo.samples[0].value, 2.0);
}

#[test]
fn json_format_full_flow() {
    let (storage, ingestor) = setup();

    ingestor
        .single_shot(
            "srv-a",
            text(r##"["# TYPE foo gauge", "foo 1", "bar 2"]"##),
            BodyFormat::Json,
        )
        .unwrap();

    let snap = storage.snapshot();
    let families = snap["srv-a"].ingested_families.as_ref().unwrap();
    assert_eq!(families["foo"].samples[0].value, 1.0);
    assert_eq!(families["bar"].samples[0].value, 2.0);
}

#[test]
fn push_then_project_public_view() {
    let (storage, ingestor) = setup();

    ingestor
        .single_shot(
            "srv-a",
            text(
                "# TYPE dayz_metricz_status gauge\n\
                 dayz_metricz_status{world=\"namalsk\",steam_id=\"765611980\"} 1\n",
            ),
            BodyFormat::Text,
        )
        .unwrap();

    let cfg = Config::default();
    let projector = PublicProjector::new(
        storage,
        cfg.public_export.clone(),
        Duration::from_secs(15),
    );

    let (body, _) = projector.status_single("srv-a").unwrap();
    let data: serde_json::Value = serde_json::from_str(&body).unwrap();

    assert_eq!(data["values"]["dayz_metricz_status"], 1.0);
    let worlds = data["labels"]["dayz_metricz_status"]["world"]
        .as_array()
        .unwrap();
    assert_eq!(worlds[0], "namalsk");
    // steam_id is deny-listed by default
    assert!(data["labels"]["dayz_metricz_status"]
        .get("steam_id")
        .is_none());
}

#[test]
fn concurrent_pushers_never_expose_partial_state() {
    let (storage, ingestor) = setup();
    let ingestor = Arc::new(ingestor);

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let ingestor = ingestor.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let payload = format!(
                        "# TYPE alpha gauge\nalpha {w}\n# TYPE beta gauge\nbeta {i}\n"
                    );
                    ingestor
                        .single_shot("srv-a", Bytes::from(payload), BodyFormat::Text)
                        .unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let storage = storage.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let snap = storage.snapshot();
                    if let Some(state) = snap.get("srv-a") {
                        if let Some(families) = &state.ingested_families {
                            // Both families of a commit appear together
                            assert_eq!(families.contains_key("alpha"), families.contains_key("beta"));
                        }
                    }
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().unwrap();
    }
    for handle in readers {
        handle.join().unwrap();
    }
}
