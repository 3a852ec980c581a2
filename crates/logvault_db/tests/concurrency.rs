//! Several store handles on one database file, the way the scheduler,
//! reaper and garbage collector share it.

use logvault_db::JobStore;
use logvault_protocol::{JobKind, JobStatus, TaskStatus};
use tempfile::TempDir;

async fn open_pair(tmp: &TempDir) -> (JobStore, JobStore) {
    let url = format!("sqlite:{}", tmp.path().join("jobs.sqlite").display());
    let a = JobStore::open(&url, 2).await.unwrap();
    let b = JobStore::open(&url, 2).await.unwrap();
    (a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_only_one_scheduler_starts_a_job() {
    let tmp = TempDir::new().unwrap();
    let (a, b) = open_pair(&tmp).await;
    let id = a.create_job(JobKind::Compression, b"cfg").await.unwrap();

    let payloads = vec![b"t0".to_vec(), b"t1".to_vec()];
    let first = {
        let a = a.clone();
        let payloads = payloads.clone();
        tokio::spawn(async move { a.start_job(id, "sched-a", &payloads).await })
    };
    let second = {
        let b = b.clone();
        tokio::spawn(async move { b.start_job(id, "sched-b", &payloads).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(loser.is_lost_race());

    // The loser's transaction left no tasks behind.
    let tasks = a.list_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_seen_by_other_handle() {
    let tmp = TempDir::new().unwrap();
    let (scheduler, client) = open_pair(&tmp).await;
    let id = client.create_job(JobKind::ExtractIr, b"cfg").await.unwrap();

    let status = client.cancel_job(id).await.unwrap();
    assert_eq!(status, JobStatus::Cancelled);

    let err = scheduler
        .start_job(id, "sched-a", &[b"t0".to_vec()])
        .await
        .unwrap_err();
    assert!(err.is_lost_race());
    assert!(scheduler.list_tasks(id).await.unwrap().is_empty());
    assert_eq!(
        scheduler.get_job_status(id).await.unwrap(),
        Some(JobStatus::Cancelled)
    );
}
