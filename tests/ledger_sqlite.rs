use triage_harness::checksum::Fingerprint;
use triage_harness::experiment::{ExperimentStore, NewExperiment};
use triage_harness::ledger::{Detected, Ledger, Outcome, RecordStatus, ResultFilter, ResultRecord, WorkItem};
use triage_harness::source::Category;
use triage_harness::store::Store;
use tempfile::tempdir;

fn cat(s: &str) -> Category {
    Category::new(s).unwrap()
}

async fn running_experiment(store: &Store, id: &str, total: u64) {
    let experiments = ExperimentStore::new(store.clone());
    experiments
        .create(NewExperiment {
            id: id.to_string(),
            configuration_fingerprint: "cfg".to_string(),
            dataset_checksum: Fingerprint::from_hex("dataset"),
            total_items: total,
        })
        .await
        .unwrap();
    experiments.start_session(id).await.unwrap();
}

#[tokio::test]
async fn duplicate_write_is_a_noop_and_keeps_first_row() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("ledger.sqlite")).unwrap();
    running_experiment(&store, "e1", 2).await;
    let ledger = Ledger::new(store.clone());

    let first = Outcome::detected(true).confidence(0.9).raw_output("first");
    let second = Outcome::detected(false).confidence(0.1).raw_output("second");
    assert_eq!(
        ledger.record("e1", "c1", &cat("violence"), &first).await.unwrap(),
        RecordStatus::Inserted
    );
    assert_eq!(
        ledger.record("e1", "c1", &cat("violence"), &second).await.unwrap(),
        RecordStatus::Duplicate
    );

    let rows = ledger.query_results("e1", &ResultFilter::all()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].detected, Detected::Yes);
    assert_eq!(rows[0].raw_output, "first");

    let exp = ExperimentStore::new(store).get("e1").await.unwrap();
    assert_eq!(exp.completed_items, 1);
}

#[tokio::test]
async fn completed_items_tracks_distinct_ledger_rows() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("ledger.sqlite")).unwrap();
    running_experiment(&store, "e1", 4).await;
    let ledger = Ledger::new(store.clone());
    let experiments = ExperimentStore::new(store.clone());

    let writes = [
        ("c1", "violence"),
        ("c1", "self_harm"),
        ("c1", "violence"),
        ("c2", "violence"),
        ("c2", "violence"),
    ];
    let mut last_completed = 0;
    for (case_id, category) in writes {
        ledger
            .record("e1", case_id, &cat(category), &Outcome::detected(false).confidence(0.5))
            .await
            .unwrap();
        let exp = experiments.get("e1").await.unwrap();
        assert!(exp.completed_items >= last_completed);
        assert_eq!(exp.completed_items as usize, ledger.count("e1").await.unwrap());
        last_completed = exp.completed_items;
    }
    assert_eq!(last_completed, 3);

    let completed = ledger.query_completed("e1").await.unwrap();
    assert!(completed.contains(&WorkItem::new("c1", cat("self_harm"))));
    assert!(completed.contains(&WorkItem::new("c2", cat("violence"))));
    assert!(!completed.contains(&WorkItem::new("c2", cat("self_harm"))));
}

#[tokio::test]
async fn experiments_do_not_share_ledger_keys() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("ledger.sqlite")).unwrap();
    running_experiment(&store, "e1", 1).await;
    running_experiment(&store, "e2", 1).await;
    let ledger = Ledger::new(store);

    let outcome = Outcome::detected(true).confidence(0.7);
    assert_eq!(
        ledger.record("e1", "c1", &cat("violence"), &outcome).await.unwrap(),
        RecordStatus::Inserted
    );
    assert_eq!(
        ledger.record("e2", "c1", &cat("violence"), &outcome).await.unwrap(),
        RecordStatus::Inserted
    );
    assert_eq!(ledger.count("e1").await.unwrap(), 1);
    assert_eq!(ledger.count("e2").await.unwrap(), 1);
}

#[tokio::test]
async fn query_results_filters_and_export_round_trips() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path().join("ledger.sqlite")).unwrap();
    running_experiment(&store, "e1", 3).await;
    let ledger = Ledger::new(store);

    ledger
        .record("e1", "c2", &cat("violence"), &Outcome::detected(true).confidence(0.8))
        .await
        .unwrap();
    ledger
        .record("e1", "c1", &cat("violence"), &Outcome::failed("timeout"))
        .await
        .unwrap();
    ledger
        .record("e1", "c1", &cat("self_harm"), &Outcome::detected(false).confidence(0.3))
        .await
        .unwrap();

    let all = ledger.query_results("e1", &ResultFilter::all()).await.unwrap();
    let keys: Vec<_> = all
        .iter()
        .map(|r| (r.case_id.as_str(), r.category.as_str()))
        .collect();
    assert_eq!(keys, [("c1", "self_harm"), ("c1", "violence"), ("c2", "violence")]);

    let errors = ledger
        .query_results("e1", &ResultFilter::all().errors_only())
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error.as_deref(), Some("timeout"));
    assert_eq!(errors[0].detected, Detected::Unknown);
    assert_eq!(ledger.error_count("e1").await.unwrap(), 1);

    let detected = ledger
        .query_results("e1", &ResultFilter::all().detected(Detected::Yes))
        .await
        .unwrap();
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].case_id, "c2");

    let c1_violence = ledger
        .query_results("e1", &ResultFilter::all().case("c1").category(cat("violence")))
        .await
        .unwrap();
    assert_eq!(c1_violence.len(), 1);

    let out = dir.path().join("results.jsonl");
    assert_eq!(ledger.export_jsonl("e1", &out).await.unwrap(), 3);
    let exported: Vec<ResultRecord> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(exported, all);
}
