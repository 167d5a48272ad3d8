
use std::collections::HashSet;
use std::path::PathBuf;

use batchq::job::{Job, NO_BATCH};
use batchq::producer::Launcher;
use batchq::queue::memory::FaultPoint;
use batchq::queue::{JobQueue, MemoryBroker, MemoryQueue};
use test_harness::fast_reconnect;

fn argv(word: &str) -> Vec<String> {
    vec!["echo".to_string(), word.to_string()]
}

fn launcher(broker: &MemoryBroker) -> Launcher<MemoryQueue> {
    Launcher::new(broker.connect(0).unwrap()).with_reconnect(fast_reconnect())
}

/// Claim everything on the queue and acknowledge it.
async fn drain(broker: &MemoryBroker) -> Vec<Job> {
    let mut consumer = broker.connect(0).unwrap();
    let mut jobs = Vec::new();
    for claimed in consumer.claim(usize::MAX).await.unwrap() {
        jobs.push(claimed.job);
        consumer.ack(claimed.handle).await.unwrap();
    }
    jobs
}

#[tokio::test]
async fn test_stage_publishes_nothing_until_flush() {
    let broker = MemoryBroker::new();
    let mut launcher = Launcher::new(broker.connect(0).unwrap());

    launcher
        .stage_job(argv("a"), 1, -1.0, "a.log", None)
        .stage_job(argv("b"), 2, 30.0, "b.log", Some(PathBuf::from("/out/b")));

    assert_eq!(launcher.staged(), 2);
    assert_eq!(broker.ready_len(), 0);
}

#[tokio::test]
async fn test_flush_publishes_batch_with_fresh_ids() {
    let broker = MemoryBroker::new();
    let mut launcher = Launcher::new(broker.connect(0).unwrap());
    for i in 0..20 {
        launcher.stage_job(argv(&format!("job{i}")), 1, -1.0, "job_{id}.log", None);
    }

    let batch_id = launcher.flush(None).await.unwrap();

    assert_eq!(batch_id.len(), 10);
    assert_eq!(launcher.staged(), 0);
    let jobs = drain(&broker).await;
    assert_eq!(jobs.len(), 20);
    assert!(jobs.iter().all(|j| j.batch_id == batch_id));
    let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids.len(), 20, "every job in a batch gets its own id");
    // Published in staging order
    assert_eq!(jobs[0].argv[1], "job0");
    assert_eq!(jobs[19].argv[1], "job19");
}

#[tokio::test]
async fn test_flush_keeps_explicit_batch_id_and_fields() {
    let broker = MemoryBroker::new();
    let mut launcher = Launcher::new(broker.connect(0).unwrap());
    launcher.stage_job(argv("x"), 8, 3600.0, "x_{id}.log", Some(PathBuf::from("/out/x")));

    let batch_id = launcher.flush(Some("NIGHTLY".to_string())).await.unwrap();

    assert_eq!(batch_id, "NIGHTLY");
    let job = drain(&broker).await.remove(0);
    assert_eq!(job.batch_id, "NIGHTLY");
    assert_eq!(job.num_cpus, 8);
    assert_eq!(job.expected_runtime, 3600.0);
    assert_eq!(job.log_file_template, "x_{id}.log");
    assert_eq!(job.output_file, Some(PathBuf::from("/out/x")));
}

/// A connection lost in the middle of a batch is rebuilt and the batch
/// completes under one batch id.
#[tokio::test]
async fn test_publish_fault_mid_batch_reconnects_and_keeps_batch_id() {
    let broker = MemoryBroker::new();
    let mut launcher = launcher(&broker);
    for word in ["a", "b", "c"] {
        launcher.stage_job(argv(word), 1, -1.0, "job_{id}.log", None);
    }

    broker.fail_after(FaultPoint::Publish, 1);
    let batch_id = launcher.flush(None).await.unwrap();

    assert_eq!(launcher.staged(), 0);
    let jobs = drain(&broker).await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.batch_id == batch_id));
    let words: Vec<&str> = jobs.iter().map(|j| j.argv[1].as_str()).collect();
    assert_eq!(words, vec!["a", "b", "c"]);
    let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
}

/// When every retry fails, the unpublished jobs stay staged and the next
/// flush reconnects by itself and finishes the same batch.
#[tokio::test]
async fn test_failed_flush_resumes_same_batch() {
    let broker = MemoryBroker::new();
    let mut launcher = launcher(&broker);
    for word in ["a", "b", "c"] {
        launcher.stage_job(argv(word), 1, -1.0, "job_{id}.log", None);
    }

    broker.fail_after(FaultPoint::Publish, 1);
    broker.fail_next(FaultPoint::Publish);
    broker.fail_next(FaultPoint::Publish);
    let err = launcher.flush(None).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(launcher.staged(), 2);
    assert_eq!(broker.ready_len(), 1);

    let batch_id = launcher.flush(None).await.unwrap();

    assert_eq!(launcher.staged(), 0);
    let jobs = drain(&broker).await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.batch_id == batch_id));
    let words: Vec<&str> = jobs.iter().map(|j| j.argv[1].as_str()).collect();
    assert_eq!(words, vec!["a", "b", "c"]);
}

/// Posting after the broker dropped the connection reconnects first.
#[tokio::test]
async fn test_post_job_reconnects_after_connection_loss() {
    let broker = MemoryBroker::new();
    let mut launcher = launcher(&broker);
    broker.drop_connections();

    let job_id = launcher.post_job(Job::new(argv("late")), None).await.unwrap();

    assert_eq!(broker.ready_len(), 1);
    assert_eq!(drain(&broker).await.remove(0).id, job_id);
}

#[tokio::test]
async fn test_post_job_publishes_immediately() {
    let broker = MemoryBroker::new();
    let mut launcher = Launcher::new(broker.connect(0).unwrap());
    let job = Job::new(argv("now")).with_output_file("/out/now");

    let job_id = launcher.post_job(job, None).await.unwrap();

    assert_eq!(broker.ready_len(), 1);
    assert_eq!(launcher.staged(), 0);
    let posted = drain(&broker).await.remove(0);
    assert_eq!(posted.id, job_id);
    assert_eq!(posted.batch_id, NO_BATCH);
    assert_eq!(posted.argv, argv("now"));
    assert_eq!(job_id.len(), 32);
}

#[tokio::test]
async fn test_post_job_with_batch() {
    let broker = MemoryBroker::new();
    let mut launcher = Launcher::new(broker.connect(0).unwrap());

    let first = launcher
        .post_job(Job::new(argv("one")), Some("B1".to_string()))
        .await
        .unwrap();
    let second = launcher
        .post_job(Job::new(argv("two")), Some("B1".to_string()))
        .await
        .unwrap();

    assert_ne!(first, second);
    let jobs = drain(&broker).await;
    assert!(jobs.iter().all(|j| j.batch_id == "B1"));
}
