use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::alloc::{
    AllocationFailureReason, AllocationManager, AllocationRegistry, AllocationRequest,
    AllocationStatus,
};
use crate::common::error::BatchError;
use crate::tests::runner::{FakeReply, FakeRunner, reply};
use crate::tests::utils::{create_backend, temp_dir};

const GRANTED: &str =
    "salloc: Granted job allocation 77\nsalloc: Nodes node[01-02] are ready for job\n";

fn manager(runner: &FakeRunner) -> AllocationManager {
    let dir = temp_dir();
    AllocationManager::new(
        create_backend(runner, dir.path()),
        Arc::new(AllocationRegistry::new()),
    )
}

fn request(nodes: u32) -> AllocationRequest {
    AllocationRequest {
        nodes,
        ..Default::default()
    }
}

fn granted_runner() -> FakeRunner {
    let runner = FakeRunner::slurm();
    runner.on("salloc", &[], reply(0, "", GRANTED));
    runner
}

fn compensations(runner: &FakeRunner) -> usize {
    runner
        .calls_of("scancel")
        .iter()
        .filter(|call| call.args.iter().any(|arg| arg.starts_with("--name=")))
        .count()
}

#[tokio::test]
async fn allocate_blocking() {
    let runner = granted_runner();
    let manager = manager(&runner);

    let record = manager.allocate(request(2)).await.unwrap();
    assert_eq!(record.status, AllocationStatus::Allocated);
    assert_eq!(record.backend_job_id.as_deref(), Some("77"));
    assert_eq!(record.nodes, vec!["node01", "node02"]);
    assert_eq!(record.nodelist.as_deref(), Some("node[01-02]"));
    assert!(record.real_backend);
    assert!(!record.is_error());

    let job_name = record.backend_job_name.clone().unwrap();
    assert_eq!(
        job_name,
        format!("batchctl_allocation.{}", record.allocation_id)
    );
    let salloc = &runner.calls_of("salloc")[0];
    assert!(salloc.args.contains(&format!("--job-name={job_name}")));
    assert!(salloc.args.contains(&"--no-shell".to_string()));
    assert!(salloc.args.contains(&"--exclusive".to_string()));
    assert_eq!(salloc.timeout, Some(Duration::from_secs(60)));
    assert_eq!(compensations(&runner), 0);

    assert_eq!(
        manager.registry().get(&record.allocation_id).unwrap().status,
        AllocationStatus::Allocated
    );
}

#[tokio::test]
async fn allocation_ids_are_unique() {
    let runner = granted_runner();
    let manager = manager(&runner);

    let a = manager.allocate(request(1)).await.unwrap();
    let b = manager.allocate(request(1)).await.unwrap();
    assert_ne!(a.allocation_id, b.allocation_id);
    assert_eq!(manager.list().len(), 2);
}

#[tokio::test]
async fn allocate_invalid_request() {
    let runner = FakeRunner::slurm();
    let manager = manager(&runner);

    for request in [
        request(0),
        AllocationRequest {
            cores: 0,
            ..Default::default()
        },
        AllocationRequest {
            time_limit: Some("25:00:00:00".to_string()),
            ..Default::default()
        },
        AllocationRequest {
            timeout: Duration::ZERO,
            ..Default::default()
        },
    ] {
        let error = manager.allocate(request).await.unwrap_err();
        assert!(matches!(error, BatchError::Validation(_)), "{error:?}");
    }
    assert_eq!(runner.call_count(), 0);
    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn allocate_without_slurm() {
    let runner = FakeRunner::new();
    let manager = manager(&runner);

    let record = manager.allocate(request(1)).await.unwrap();
    assert_eq!(record.status, AllocationStatus::Failed);
    assert_eq!(record.reason, Some(AllocationFailureReason::BackendUnavailable));
    assert!(!record.real_backend);
    assert!(runner.calls_of("salloc").is_empty());
}

#[tokio::test]
async fn immediate_allocation_refused() {
    let runner = FakeRunner::slurm();
    runner.fail(
        "salloc",
        &["--immediate=1"],
        1,
        "salloc: error: Unable to allocate resources: Immediate allocation impossible\n",
    );
    let manager = manager(&runner);

    let record = manager
        .allocate(AllocationRequest {
            immediate: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, AllocationStatus::Failed);
    assert_eq!(
        record.reason,
        Some(AllocationFailureReason::ResourcesUnavailable)
    );
    assert_eq!(record.error_kind(), "resources_unavailable");
    assert_eq!(compensations(&runner), 0);
}

#[tokio::test]
async fn allocation_rejected_by_policy() {
    let runner = FakeRunner::slurm();
    runner.fail(
        "salloc",
        &[],
        1,
        "salloc: error: Job submit/allocate failed: Job violates accounting/QOS policy\n",
    );
    let manager = manager(&runner);

    let record = manager.allocate(request(1)).await.unwrap();
    assert_eq!(record.reason, Some(AllocationFailureReason::PolicyViolation));
}

#[tokio::test]
async fn immediate_allocation_exceeding_wait() {
    let runner = FakeRunner::slurm();
    runner.on("salloc", &[], FakeReply::Hang);
    let manager = manager(&runner);

    let record = manager
        .allocate(AllocationRequest {
            immediate: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status, AllocationStatus::Failed);
    assert_eq!(
        record.reason,
        Some(AllocationFailureReason::ResourcesUnavailable)
    );
    assert_eq!(compensations(&runner), 1);
    assert_eq!(runner.running(), 0);
}

#[tokio::test]
async fn blocking_allocation_timeout() {
    let runner = FakeRunner::slurm();
    runner.on("salloc", &[], FakeReply::Hang);
    let manager = manager(&runner);

    let timeout = Duration::from_millis(300);
    let start = Instant::now();
    let record = manager
        .allocate(AllocationRequest {
            timeout,
            ..Default::default()
        })
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(record.status, AllocationStatus::Timeout);
    assert!(record.is_error());
    assert_eq!(record.error_kind(), "timeout");
    assert_eq!(runner.running(), 0);

    let name = format!("--name={}", record.backend_job_name.unwrap());
    let scancel = runner.calls_of("scancel");
    assert_eq!(scancel.len(), 1);
    assert_eq!(scancel[0].args[1], name);
}

#[tokio::test]
async fn cancelled_allocation_is_compensated() {
    let runner = FakeRunner::slurm();
    runner.on("salloc", &[], FakeReply::Hang);
    let manager = manager(&runner);

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };
    let record = manager
        .allocate_with_cancel(request(1), &token)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(record.status, AllocationStatus::Failed);
    assert_eq!(record.reason, Some(AllocationFailureReason::Cancelled));
    assert_eq!(runner.running(), 0);
    assert_eq!(compensations(&runner), 1);
}

#[tokio::test]
async fn dropped_allocation_is_compensated() {
    let runner = FakeRunner::slurm();
    runner.on("salloc", &[], FakeReply::Hang);
    let manager = manager(&runner);

    let result =
        tokio::time::timeout(Duration::from_millis(50), manager.allocate(request(1))).await;
    assert!(result.is_err());
    assert_eq!(runner.running(), 0);

    // The release runs in a spawned task
    for _ in 0..50 {
        if compensations(&runner) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(compensations(&runner), 1);
}

#[tokio::test]
async fn granted_allocation_without_job_id() {
    let runner = FakeRunner::slurm();
    runner.stdout("salloc", &[], "");
    runner.stdout("squeue", &["--name="], "");
    let manager = manager(&runner);

    let record = manager.allocate(request(1)).await.unwrap();
    assert_eq!(record.status, AllocationStatus::Failed);
    assert_eq!(record.reason, Some(AllocationFailureReason::ProtocolMismatch));
    assert_eq!(compensations(&runner), 1);
}

#[tokio::test]
async fn granted_allocation_is_looked_up_by_name() {
    let runner = FakeRunner::slurm();
    runner.stdout("salloc", &[], "");
    runner.stdout("squeue", &["--name="], "88\n");
    runner.stdout("squeue", &["--format=%N"], "n[1-3]\n");
    let manager = manager(&runner);

    let record = manager.allocate(request(3)).await.unwrap();
    assert_eq!(record.status, AllocationStatus::Allocated);
    assert_eq!(record.backend_job_id.as_deref(), Some("88"));
    assert_eq!(record.nodes, vec!["n1", "n2", "n3"]);
}

#[tokio::test]
async fn deallocate_twice() {
    let runner = granted_runner();
    runner.stdout("scancel", &["77"], "");
    let manager = manager(&runner);

    let record = manager.allocate(request(2)).await.unwrap();
    let released = manager.deallocate(&record.allocation_id).await.unwrap();
    assert_eq!(released.status, AllocationStatus::Deallocated);

    let again = manager.deallocate(&record.allocation_id).await.unwrap();
    assert_eq!(again.status, AllocationStatus::NotFound);
    assert_eq!(runner.calls_of("scancel").len(), 1);
}

#[tokio::test]
async fn deallocate_unknown() {
    let runner = FakeRunner::slurm();
    let manager = manager(&runner);

    let record = manager.deallocate("alloc-unknown").await.unwrap();
    assert_eq!(record.status, AllocationStatus::NotFound);
    assert!(!record.is_error());
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn concurrent_deallocation_releases_once() {
    let runner = granted_runner();
    runner.stdout("scancel", &["77"], "");
    let manager = manager(&runner);
    let record = manager.allocate(request(1)).await.unwrap();

    let (a, b) = tokio::join!(
        manager.deallocate(&record.allocation_id),
        manager.deallocate(&record.allocation_id)
    );
    let mut statuses = vec![a.unwrap().status, b.unwrap().status];
    statuses.sort_by_key(|status| status.as_str());
    assert_eq!(
        statuses,
        vec![AllocationStatus::Deallocated, AllocationStatus::NotFound]
    );
    assert_eq!(runner.calls_of("scancel").len(), 1);
}

#[tokio::test]
async fn failed_release_keeps_allocation() {
    let runner = granted_runner();
    runner.fail("scancel", &["77"], 1, "scancel: error: Access/permission denied\n");
    let manager = manager(&runner);
    let record = manager.allocate(request(1)).await.unwrap();

    let error = manager.deallocate(&record.allocation_id).await.unwrap_err();
    assert!(matches!(error, BatchError::SchedulerRejected { .. }), "{error:?}");
    assert_eq!(
        manager.registry().get(&record.allocation_id).unwrap().status,
        AllocationStatus::Allocated
    );
}

#[tokio::test]
async fn release_of_expired_allocation() {
    let runner = granted_runner();
    runner.fail(
        "scancel",
        &["77"],
        1,
        "scancel: error: Kill job error on job id 77: Invalid job id specified\n",
    );
    let manager = manager(&runner);
    let record = manager.allocate(request(1)).await.unwrap();

    let released = manager.deallocate(&record.allocation_id).await.unwrap();
    assert_eq!(released.status, AllocationStatus::Deallocated);
}

#[tokio::test]
async fn status_of_running_allocation() {
    let runner = granted_runner();
    runner.stdout(
        "squeue",
        &["--format=%i,%T,%M,%N"],
        "77,RUNNING,5:00,node[01-02]\n",
    );
    let manager = manager(&runner);
    let record = manager.allocate(request(2)).await.unwrap();

    let status = manager.get_status(&record.allocation_id).await.unwrap();
    assert_eq!(status.status, AllocationStatus::Allocated);
    assert!(status.live);
    assert_eq!(status.backend_state.as_deref(), Some("RUNNING"));
    assert_eq!(status.time_used.as_deref(), Some("5:00"));
    assert_eq!(status.nodes, vec!["node01", "node02"]);
}

#[tokio::test]
async fn status_of_vanished_allocation() {
    let runner = granted_runner();
    runner.stdout("squeue", &["--format=%i,%T,%M,%N"], "");
    let manager = manager(&runner);
    let record = manager.allocate(request(2)).await.unwrap();

    let status = manager.get_status(&record.allocation_id).await.unwrap();
    assert_eq!(status.status, AllocationStatus::Allocated);
    assert!(!status.live);
    assert!(status.message.is_some());
}

#[tokio::test]
async fn status_of_unknown_allocation() {
    let runner = FakeRunner::slurm();
    let manager = manager(&runner);

    let status = manager.get_status("alloc-x").await.unwrap();
    assert_eq!(status.status, AllocationStatus::NotFound);
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn release_from_reloaded_registry() {
    let dir = temp_dir();
    let path = dir.path().join("state.json");
    let runner = granted_runner();
    runner.stdout("scancel", &["77"], "");

    let first = manager(&runner);
    let record = first.allocate(request(1)).await.unwrap();
    first.registry().save(&path).unwrap();

    let second = AllocationManager::new(
        create_backend(&runner, dir.path()),
        Arc::new(AllocationRegistry::load(&path).unwrap()),
    );
    let released = second.deallocate(&record.allocation_id).await.unwrap();
    assert_eq!(released.status, AllocationStatus::Deallocated);

    let fresh = second.allocate(request(1)).await.unwrap();
    assert_ne!(fresh.allocation_id, record.allocation_id);
}
