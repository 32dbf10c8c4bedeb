use triage_harness::checksum::{self, ChecksumStatus};
use triage_harness::source::{parse_dataset, Category, SourceFilter, SourceRecord, SourceStore};
use triage_harness::store::Store;
use tempfile::tempdir;

const DATASET: &str = r#"{"case_id":"c1","category":"violence","text":"he threatened me"}
{"case_id":"c1","category":"self_harm","text":"he threatened me"}
{"case_id":"c2","category":"violence","text":null}
{"case_id":"c3","category":"violence","text":"all quiet"}
"#;

fn records(raw: &str) -> Vec<SourceRecord> {
    parse_dataset(raw).unwrap()
}

#[test]
fn fingerprint_is_deterministic_and_order_independent() {
    let forward = records(DATASET);
    let mut reversed = forward.clone();
    reversed.reverse();
    assert_eq!(checksum::compute(&forward), checksum::compute(&forward));
    assert_eq!(checksum::compute(&forward), checksum::compute(&reversed));
}

#[test]
fn any_single_character_change_alters_the_fingerprint() {
    let base = checksum::compute(&records(DATASET));
    let variants = [
        DATASET.replacen("threatened me", "threatened mE", 1),
        DATASET.replace("\"c3\"", "\"c4\""),
        DATASET.replace("all quiet", "all quiet."),
        DATASET.replace("\"text\":null", "\"text\":\"\""),
    ];
    for variant in &variants {
        assert_ne!(checksum::compute(&records(variant)), base, "{variant}");
    }
}

#[test]
fn verify_reports_match_mismatch_and_absent() {
    let dataset = records(DATASET);
    let stored = checksum::compute(&dataset);
    assert_eq!(checksum::verify(Some(&stored), &dataset), ChecksumStatus::Match);

    let drifted = records(&DATASET.replace("all quiet", "all quiet!"));
    match checksum::verify(Some(&stored), &drifted) {
        ChecksumStatus::Mismatch { stored: s, current } => {
            assert_eq!(s, stored);
            assert_ne!(current, stored);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert!(checksum::verify(Some(&stored), &drifted).is_mismatch());

    assert_eq!(
        checksum::verify(None, &dataset),
        ChecksumStatus::Absent { current: stored }
    );
}

#[tokio::test]
async fn loading_is_idempotent_and_drift_is_a_new_dataset() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("source.sqlite")).unwrap();
    let sources = SourceStore::new(store);

    let path = dir.path().join("cases.jsonl");
    std::fs::write(&path, DATASET).unwrap();
    let first = sources.load(&path).await.unwrap();
    assert!(first.newly_loaded);
    assert_eq!(first.count, 4);

    let again = sources.load(&path).await.unwrap();
    assert!(!again.newly_loaded);
    assert_eq!(again.checksum, first.checksum);

    let stored = sources
        .query(&SourceFilter::dataset(&first.checksum), None)
        .await
        .unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(checksum::compute(&stored), first.checksum);

    std::fs::write(&path, DATASET.replace("all quiet", "all calm")).unwrap();
    let drifted = sources.load(&path).await.unwrap();
    assert!(drifted.newly_loaded);
    assert_ne!(drifted.checksum, first.checksum);

    let original = sources
        .query(&SourceFilter::dataset(&first.checksum).case_ids(["c3".to_string()]), None)
        .await
        .unwrap();
    assert_eq!(original[0].text.as_deref(), Some("all quiet"));

    let info = sources.dataset(&first.checksum).await.unwrap().unwrap();
    assert_eq!(info.record_count, 4);
}

#[tokio::test]
async fn query_filters_by_category_and_text_presence() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("source.sqlite")).unwrap();
    let sources = SourceStore::new(store);
    let report = sources
        .load_records("inline", records(DATASET))
        .await
        .unwrap();

    let violence = sources
        .query(
            &SourceFilter::dataset(&report.checksum).categories([Category::new("violence").unwrap()]),
            None,
        )
        .await
        .unwrap();
    let ids: Vec<_> = violence.iter().map(|r| r.case_id.as_str()).collect();
    assert_eq!(ids, ["c1", "c2", "c3"]);

    let without_text = sources
        .query(&SourceFilter::dataset(&report.checksum).has_text(false), None)
        .await
        .unwrap();
    assert_eq!(without_text.len(), 1);
    assert_eq!(without_text[0].case_id, "c2");

    let limited = sources
        .query(&SourceFilter::dataset(&report.checksum), Some(2))
        .await
        .unwrap();
    let keys: Vec<_> = limited
        .iter()
        .map(|r| (r.case_id.as_str(), r.category.as_str()))
        .collect();
    assert_eq!(keys, [("c1", "self_harm"), ("c1", "violence")]);
}
