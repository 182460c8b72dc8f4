//! End-to-end pipeline behaviour against in-memory stubs.

mod common;

use bizcard_ingest::{
    IngestConfig, IngestError, PipelineState, Stage, UnknownFieldPolicy, UploadJob,
};
use chrono::{TimeZone, Utc};
use common::*;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

fn card(name: &str) -> UploadJob {
    UploadJob::new(name, PNG_BYTES.to_vec(), "image/png")
}

#[tokio::test]
async fn japanese_card_fills_known_fields_and_blanks_the_rest() {
    let h = Harness::happy(
        "山田太郎\n株式会社サンプル\n03-1234-5678",
        r#"{"name":"山田太郎","company":"株式会社サンプル","tel":"03-1234-5678"}"#,
    );

    let output = h.ingestor.ingest(card("card.jpg")).await.unwrap();
    let record = &output.record;

    assert_eq!(record.fields().len(), 7);
    assert_eq!(record.get("name"), Some("山田太郎"));
    assert_eq!(record.get("company"), Some("株式会社サンプル"));
    assert_eq!(record.get("tel"), Some("03-1234-5678"));
    for key in ["furigana", "address", "email", "industry"] {
        assert_eq!(record.get(key), Some(""), "{key}");
    }
    assert!(output.degraded.is_none());

    let body = serde_json::to_value(output.response()).unwrap();
    assert_eq!(body["sink"], "ok");
    assert!(body["file"].as_str().unwrap().ends_with("_card.jpg"));
    let keys: Vec<&str> = body["structured"]
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(keys.len(), 7);

    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.store.len(), 1);
    let user = h.completion.last_user.lock().unwrap().clone().unwrap();
    assert!(user.contains("株式会社サンプル"));
}

#[tokio::test]
async fn row_timestamp_is_when_the_upload_arrived() {
    let h = Harness::happy("ACME", r#"{"company":"ACME"}"#);
    let mut job = card("a.png");
    job.received_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();

    let output = h.ingestor.ingest(job).await.unwrap();

    assert_eq!(output.record.ingested_at, Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());
    assert_eq!(h.sink.rows.lock().unwrap()[0].ingested_at, output.record.ingested_at);
}

#[tokio::test]
async fn every_state_is_entered_in_order() {
    let h = Harness::happy("ACME", r#"{"company":"ACME"}"#);
    h.ingestor.ingest(card("a.png")).await.unwrap();

    assert_eq!(
        h.observer.states(),
        vec![
            PipelineState::Persisting,
            PipelineState::Recognizing,
            PipelineState::Extracting,
            PipelineState::Normalizing,
            PipelineState::Sinking,
            PipelineState::Completed,
        ]
    );
}

#[tokio::test]
async fn empty_text_still_completes_without_a_completion_call() {
    let h = Harness::happy("  \n ", r#"{"name":"Invented Person"}"#);

    let output = h.ingestor.ingest(card("blank.png")).await.unwrap();

    assert_eq!(h.completion.calls(), 0);
    assert!(output.record.fields().iter().all(|(_, v)| v.is_empty()));
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.observer.states().last(), Some(&PipelineState::Completed));
}

#[tokio::test]
async fn non_json_completion_degrades_to_empty_fields() {
    let h = Harness::happy("Jane Doe\nACME", "Sorry, I can't help with that.");

    let output = h.ingestor.ingest(card("jane.png")).await.unwrap();

    assert!(output.degraded.is_some());
    assert!(output.record.fields().iter().all(|(_, v)| v.is_empty()));
    assert_eq!(output.record.raw.text, "Jane Doe\nACME");
    assert_eq!(h.sink.len(), 1);
}

#[tokio::test]
async fn fenced_completion_is_accepted() {
    let h = Harness::happy(
        "Jane Doe",
        "```json\n{\"name\": \"Jane Doe\", \"email\": null}\n```",
    );
    let output = h.ingestor.ingest(card("jane.png")).await.unwrap();
    assert_eq!(output.record.get("name"), Some("Jane Doe"));
    assert_eq!(output.record.get("email"), Some(""));
    assert!(output.degraded.is_none());
}

#[tokio::test]
async fn persist_failure_stops_before_recognition() {
    let h = Harness::new(
        MemoryStore::failing(),
        StubRecognizer::returning("x"),
        StubCompletion::replying("{}"),
        MemorySink::default(),
    );

    let err = h.ingestor.ingest(card("a.png")).await.unwrap_err();

    assert!(matches!(err, IngestError::StorageFailure { .. }));
    assert_eq!(err.stage(), Some(Stage::Persist));
    assert_eq!(err.status_code(), 500);
    assert_eq!(h.recognizer.calls(), 0);
    assert_eq!(h.completion.calls(), 0);
    assert_eq!(h.sink.len(), 0);
    assert!(matches!(
        h.observer.states().last(),
        Some(PipelineState::Failed {
            stage: Stage::Persist,
            ..
        })
    ));
}

#[tokio::test]
async fn recognition_failure_leaves_blob_but_writes_no_row() {
    let h = Harness::new(
        MemoryStore::default(),
        StubRecognizer::failing(),
        StubCompletion::replying("{}"),
        MemorySink::default(),
    );

    let err = h.ingestor.ingest(card("a.png")).await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Recognize));
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.completion.calls(), 0);
    assert_eq!(h.sink.len(), 0);
}

#[tokio::test]
async fn completion_transport_failure_is_fatal() {
    let h = Harness::new(
        MemoryStore::default(),
        StubRecognizer::returning("Jane"),
        StubCompletion::failing(),
        MemorySink::default(),
    );

    let err = h.ingestor.ingest(card("a.png")).await.unwrap_err();

    assert!(matches!(err, IngestError::ExtractionFailure { .. }));
    assert_eq!(h.sink.len(), 0);
}

#[tokio::test]
async fn sink_rejection_is_a_bad_gateway() {
    let h = Harness::new(
        MemoryStore::default(),
        StubRecognizer::returning("Jane"),
        StubCompletion::replying(r#"{"name":"Jane"}"#),
        MemorySink::rejecting(403),
    );

    let err = h.ingestor.ingest(card("a.png")).await.unwrap_err();

    match &err {
        IngestError::SinkFailure { status, .. } => assert_eq!(*status, Some(403)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.status_code(), 502);
    assert!(matches!(
        h.observer.states().last(),
        Some(PipelineState::Failed {
            stage: Stage::Sink,
            ..
        })
    ));
}

#[tokio::test]
async fn empty_upload_is_rejected_before_persisting() {
    let h = Harness::happy("x", "{}");

    let err = h
        .ingestor
        .ingest(UploadJob::new("empty.png", Vec::new(), "image/png"))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::InvalidUpload(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(h.store.len(), 0);
    assert_eq!(
        h.observer.states(),
        vec![PipelineState::Failed {
            stage: Stage::Upload,
            cause: err.to_string(),
        }]
    );
}

#[tokio::test]
async fn identical_filenames_get_distinct_locators() {
    let h = Arc::new(Harness::happy("x", "{}"));

    let runs = (0..25).map(|_| {
        let h = h.clone();
        tokio::spawn(async move { h.ingestor.ingest(card("same.jpg")).await })
    });
    let mut locators = HashSet::new();
    for run in runs {
        let output = run.await.unwrap().unwrap();
        assert!(output.locator.as_str().ends_with("_same.jpg"));
        locators.insert(output.locator);
    }

    assert_eq!(locators.len(), 25);
    assert_eq!(h.store.len(), 25);
    assert_eq!(h.sink.len(), 25);
}

#[tokio::test]
async fn preserved_unknown_keys_land_in_raw_json() {
    let config = IngestConfig::builder()
        .unknown_fields(UnknownFieldPolicy::Preserve)
        .build()
        .unwrap();
    let h = Harness::with_config(
        config,
        MemoryStore::default(),
        StubRecognizer::returning("Jane, CTO"),
        StubCompletion::replying(r#"{"name":"Jane","title":"CTO"}"#),
        MemorySink::default(),
    );

    let output = h.ingestor.ingest(card("jane.png")).await.unwrap();

    assert!(output.record.get("title").is_none());
    let row = output.record.to_row().unwrap();
    let raw: Value = serde_json::from_str(row["raw_json"].as_str().unwrap()).unwrap();
    assert_eq!(raw["unknown"]["title"], "CTO");
    assert_eq!(raw["file"], output.locator.as_str());
}

#[tokio::test]
async fn custom_field_set_shapes_the_record() {
    let fields = bizcard_ingest::CanonicalFieldSet::parse_list("name, email").unwrap();
    let config = IngestConfig::builder().fields(fields).build().unwrap();
    let h = Harness::with_config(
        config,
        MemoryStore::default(),
        StubRecognizer::returning("Jane"),
        StubCompletion::replying(r#"{"name":"Jane","company":"ACME"}"#),
        MemorySink::default(),
    );

    let output = h.ingestor.ingest(card("jane.png")).await.unwrap();

    let keys: Vec<&str> = output.record.fields().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["name", "email"]);
}
