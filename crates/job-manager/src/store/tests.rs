use std::sync::Arc;

use ahash::HashSet;

use super::*;
use crate::test_util::setup_test_tracing;

fn units(n: u32) -> Vec<NewUnit> {
    (1..=n)
        .map(|i| NewUnit {
            files: vec![format!("/store/file_{i}.root")],
            lumis: vec![Lumi::new(1, i)],
            arg: None,
        })
        .collect()
}

async fn open(dir: &tempfile::TempDir, retry: RetryPolicy) -> WorkUnitStore {
    setup_test_tracing();
    WorkUnitStore::open(&dir.path().join("store.db"), retry)
        .await
        .expect("opening store")
}

#[tokio::test]
async fn claim_returns_one_batch_per_cap() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(25)).await.unwrap();

    let batches = store.claim(&[10, 10]).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].units.len(), 10);
    assert_eq!(batches[1].units.len(), 10);
    assert_ne!(batches[0].job, batches[1].job, "each batch gets its own job");
    assert!(batches
        .iter()
        .flat_map(|batch| batch.units.iter())
        .all(|unit| unit.status == UnitStatus::Running));

    let counts = store.counts("wf").await.unwrap();
    assert_eq!(counts.running, 20);
    assert_eq!(counts.pending, 5);
    assert_eq!(store.unfinished_count().await.unwrap(), 25);
}

#[tokio::test]
async fn claim_is_empty_when_nothing_is_pending() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(3)).await.unwrap();

    assert_eq!(store.claim(&[10]).await.unwrap().len(), 1);
    assert!(store.claim(&[10]).await.unwrap().is_empty());
    assert!(!store.done().await.unwrap(), "claimed units are still unfinished");
}

#[tokio::test]
async fn batches_do_not_mix_workflows_or_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("a", &units(3)).await.unwrap();

    let mut with_args = units(2);
    with_args[0].arg = Some("seed=1".to_string());
    with_args[1].arg = Some("seed=2".to_string());
    store.register("b", &with_args).await.unwrap();

    let batches = store.claim(&[10, 10, 10]).await.unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].workflow, "a");
    assert_eq!(batches[0].units.len(), 3);
    assert_eq!(batches[1].arg.as_deref(), Some("seed=1"));
    assert_eq!(batches[2].arg.as_deref(), Some("seed=2"));
    assert!(batches[1..].iter().all(|batch| batch.workflow == "b"));
}

#[tokio::test]
async fn claim_fills_batches_past_interleaved_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;

    let mut interleaved = units(20);
    for (i, unit) in interleaved.iter_mut().enumerate() {
        let seed = if i % 2 == 0 { "seed=1" } else { "seed=2" };
        unit.arg = Some(seed.to_string());
    }
    store.register("wf", &interleaved).await.unwrap();

    let batches = store.claim(&[10]).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].units.len(), 10, "the batch is filled to its cap");
    assert_eq!(batches[0].arg.as_deref(), Some("seed=1"));
    assert!(batches[0]
        .units
        .iter()
        .all(|unit| unit.arg.as_deref() == Some("seed=1")));

    let rest = store.claim(&[4, 10]).await.unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].units.len(), 4);
    assert_eq!(rest[1].units.len(), 6, "a second batch opens for the same argument");
    assert!(rest.iter().all(|batch| batch.arg.as_deref() == Some("seed=2")));
    assert_eq!(store.counts("wf").await.unwrap().pending, 0);
}

#[tokio::test]
async fn register_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(2)).await.unwrap();

    let err = store.register("wf", &units(2)).await.unwrap_err();
    assert!(matches!(
        err.current_context(),
        StoreError::AlreadyRegistered(label) if label == "wf"
    ));
    assert_eq!(store.counts("wf").await.unwrap().total(), 2);
}

#[tokio::test]
async fn successful_completion_reduces_unfinished_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(15)).await.unwrap();

    let batches = store.claim(&[10, 10]).await.unwrap();
    let before = store.unfinished_count().await.unwrap();

    store.complete(batches[0].job, false).await.unwrap();
    assert_eq!(store.unfinished_count().await.unwrap(), before - 10);
    assert!(!store.done().await.unwrap());

    store.complete(batches[1].job, false).await.unwrap();
    assert_eq!(store.unfinished_count().await.unwrap(), 0);
    assert!(store.done().await.unwrap());
    assert_eq!(store.counts("wf").await.unwrap().successful, 15);
}

#[tokio::test]
async fn failed_units_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(4)).await.unwrap();

    let batch = store.claim(&[10]).await.unwrap().remove(0);
    let result = store.complete(batch.job, true).await.unwrap();
    let Completed::Applied { units, .. } = result else {
        panic!("first completion should apply");
    };
    assert!(units
        .iter()
        .all(|unit| unit.status == UnitStatus::Failed && unit.attempts == 1));
    assert_eq!(store.unfinished_count().await.unwrap(), 4);

    let retry = store.claim(&[10]).await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].units.len(), 4);
    assert_ne!(retry[0].job, batch.job, "a retry is a new job");
    assert!(retry[0].units.iter().all(|unit| unit.attempts == 1));
}

#[tokio::test]
async fn duplicate_completion_only_replaces_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(2)).await.unwrap();
    let batch = store.claim(&[10]).await.unwrap().remove(0);

    let first = Completion {
        failed: true,
        log: Some("first".to_string()),
        ..Default::default()
    };
    store.complete_with(batch.job, first).await.unwrap();

    let second = Completion {
        failed: true,
        log: Some("second".to_string()),
        ..Default::default()
    };
    let result = store.complete_with(batch.job, second).await.unwrap();
    assert!(matches!(result, Completed::Duplicate));

    let units = store.job_units(batch.job).await.unwrap();
    assert!(
        units.iter().all(|unit| unit.attempts == 1),
        "attempts are not counted twice"
    );

    let job = store.job(batch.job).await.unwrap().expect("job exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.log.as_deref(), Some("second"));
}

#[tokio::test]
async fn completing_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;

    let err = store.complete(JobId(99), false).await.unwrap_err();
    assert!(matches!(err.current_context(), StoreError::UnknownJob(JobId(99))));
}

#[tokio::test]
async fn reset_after_restart_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(&dir, RetryPolicy::default()).await;
        store.register("wf", &units(12)).await.unwrap();
        store.claim(&[10]).await.unwrap();
    }

    for _ in 0..2 {
        let store = open(&dir, RetryPolicy::default()).await;
        store.reset().await.unwrap();
        let counts = store.counts("wf").await.unwrap();
        assert_eq!(counts.running, 0);
        assert_eq!(counts.total(), 12, "no unit is lost or duplicated");
        store.claim(&[5]).await.unwrap();
    }

    let store = open(&dir, RetryPolicy::default()).await;
    let summary = store.reset().await.unwrap();
    assert_eq!(summary.units, 5);
    assert_eq!(summary.jobs, 1);
    assert_eq!(store.counts("wf").await.unwrap().running, 0);
    assert_eq!(store.unfinished_count().await.unwrap(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(&dir, RetryPolicy::default()).await);
    store.register("wf", &units(200)).await.unwrap();

    let claims = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim(&[5, 5]).await })
        })
        .collect::<Vec<_>>();

    let mut seen = HashSet::default();
    let mut total = 0;
    for claim in claims {
        let batches = claim.await.unwrap().unwrap();
        for unit in batches.into_iter().flat_map(|batch| batch.units) {
            total += 1;
            assert!(seen.insert(unit.id), "unit {} was claimed twice", unit.id);
        }
    }

    assert_eq!(total, 80);
    assert_eq!(store.counts("wf").await.unwrap().running, 80);
}

#[tokio::test]
async fn retry_cap_exhausts_units() {
    let dir = tempfile::tempdir().unwrap();
    let retry = RetryPolicy {
        max_attempts: Some(2),
        ..Default::default()
    };
    let store = open(&dir, retry).await;
    store.register("wf", &units(3)).await.unwrap();

    for _ in 0..2 {
        let batch = store.claim(&[10]).await.unwrap().remove(0);
        store.complete(batch.job, true).await.unwrap();
    }

    assert!(store.claim(&[10]).await.unwrap().is_empty());
    let counts = store.counts("wf").await.unwrap();
    assert_eq!(counts.exhausted, 3);
    assert_eq!(counts.failed, 0);
    assert_eq!(store.unfinished_count().await.unwrap(), 0);
    assert!(store.done().await.unwrap());
}

#[tokio::test]
async fn backoff_delays_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let retry = RetryPolicy {
        max_attempts: None,
        backoff_base_secs: 3600,
        backoff_max_secs: None,
    };
    let store = open(&dir, retry).await;
    store.register("wf", &units(3)).await.unwrap();

    let batch = store.claim(&[10]).await.unwrap().remove(0);
    store.complete(batch.job, true).await.unwrap();

    assert!(
        store.claim(&[10]).await.unwrap().is_empty(),
        "failed units wait for their backoff"
    );
    assert_eq!(
        store.unfinished_count().await.unwrap(),
        3,
        "waiting units still count as unfinished"
    );
}

#[tokio::test]
async fn merge_jobs_consume_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(2)).await.unwrap();

    let batches = store.claim(&[1, 1]).await.unwrap();
    let mut output_ids = Vec::new();
    for batch in &batches {
        let completion = Completion {
            failed: false,
            log: None,
            outputs: vec![NewOutput {
                path: format!("wf/out_{}.root", batch.job),
                report: format!("/work/wf/successful/{}/report.json", batch.job),
                size: 100,
                mergeable: true,
            }],
            downstream: Vec::new(),
        };
        let Completed::Applied { outputs, .. } =
            store.complete_with(batch.job, completion).await.unwrap()
        else {
            panic!("completion should apply");
        };
        output_ids.extend(outputs);
    }

    let unmerged = store.unmerged_outputs("wf").await.unwrap();
    assert_eq!(unmerged.iter().map(|o| o.id).collect::<Vec<_>>(), output_ids);

    let merge = store.claim_merge("wf", &output_ids).await.unwrap();
    assert!(store.unmerged_outputs("wf").await.unwrap().is_empty());

    let err = store.claim_merge("wf", &output_ids).await.unwrap_err();
    assert!(matches!(err.current_context(), StoreError::MergeConflict(_)));

    store.complete(merge, true).await.unwrap();
    assert_eq!(
        store.unmerged_outputs("wf").await.unwrap().len(),
        2,
        "a failed merge releases its inputs"
    );

    let merge = store.claim_merge("wf", &output_ids).await.unwrap();
    let job = store.job(merge).await.unwrap().unwrap();
    assert_eq!(job.kind, JobKind::Merge);
    store.complete(merge, false).await.unwrap();
    assert!(store.unmerged_outputs("wf").await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_releases_outputs_of_running_merges() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("wf", &units(1)).await.unwrap();

    let batch = store.claim(&[1]).await.unwrap().remove(0);
    let completion = Completion {
        outputs: vec![NewOutput {
            path: "wf/out.root".to_string(),
            report: "report.json".to_string(),
            size: 5,
            mergeable: true,
        }],
        ..Completion::new(false)
    };
    let Completed::Applied { outputs, .. } =
        store.complete_with(batch.job, completion).await.unwrap()
    else {
        panic!("completion should apply");
    };
    store.claim_merge("wf", &outputs).await.unwrap();

    store.reset().await.unwrap();
    assert_eq!(store.unmerged_outputs("wf").await.unwrap().len(), 1);
}

#[tokio::test]
async fn downstream_units_are_created_on_success_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir, RetryPolicy::default()).await;
    store.register("up", &units(2)).await.unwrap();
    store.register("down", &[]).await.unwrap();

    let batches = store.claim(&[1, 1]).await.unwrap();
    let downstream = |job: JobId| DownstreamUnit {
        workflow: "down".to_string(),
        unit: NewUnit {
            files: vec![format!("up/out_{job}.root")],
            lumis: Vec::new(),
            arg: None,
        },
    };

    let failed = Completion {
        downstream: vec![downstream(batches[0].job)],
        ..Completion::new(true)
    };
    store.complete_with(batches[0].job, failed).await.unwrap();
    assert_eq!(store.counts("down").await.unwrap().total(), 0);

    let succeeded = Completion {
        downstream: vec![downstream(batches[1].job)],
        ..Completion::new(false)
    };
    store.complete_with(batches[1].job, succeeded).await.unwrap();
    assert_eq!(store.counts("down").await.unwrap().pending, 1);
}
