use crate::common::error::BatchError;
use crate::jobs::{
    ArraySpec, CancellationManager, CancellationStatus, DetailsSource, JobSpec, JobState,
    MonitoringService, OutputStream, ScriptSource, SubmissionManager,
};
use crate::tests::runner::{FakeReply, FakeRunner, reply};
use crate::tests::utils::{create_backend, temp_dir};

fn inline_spec(script: &str) -> JobSpec {
    JobSpec {
        script: ScriptSource::Inline(script.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn submit_returns_pending_job() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Submitted batch job 42\n");
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let job = manager.submit(&inline_spec("echo hello")).await.unwrap();
    assert_eq!(job.job_id, "42");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.stdout_path, Some(dir.path().join("slurm_42.out")));
    assert_eq!(job.stderr_path, Some(dir.path().join("slurm_42.err")));

    let calls = runner.calls_of("sbatch");
    assert_eq!(calls.len(), 1);
    let script = calls[0].stdin.as_deref().unwrap();
    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("#SBATCH --job-name=batchctl_job"));
    assert!(script.trim_end().ends_with("echo hello"));
}

#[tokio::test]
async fn submit_reads_script_file() {
    let dir = temp_dir();
    let path = dir.path().join("job.sh");
    std::fs::write(&path, "#!/usr/bin/env python3\nprint(1)\n").unwrap();

    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Submitted batch job 7\n");
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));
    let spec = JobSpec {
        script: ScriptSource::Path(path),
        ..Default::default()
    };
    manager.submit(&spec).await.unwrap();

    let script = runner.calls_of("sbatch")[0].stdin.clone().unwrap();
    assert!(script.starts_with("#!/usr/bin/env python3\n"));
    assert_eq!(script.matches("#!").count(), 1);
}

#[tokio::test]
async fn invalid_spec_does_not_spawn_anything() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let invalid = [
        JobSpec {
            cores: 0,
            ..inline_spec("echo")
        },
        JobSpec {
            time_limit: "1:99:00".to_string(),
            ..inline_spec("echo")
        },
        JobSpec {
            memory: Some("0G".to_string()),
            ..inline_spec("echo")
        },
        JobSpec {
            partition: Some("gpu;rm -rf".to_string()),
            ..inline_spec("echo")
        },
    ];
    for spec in invalid {
        let error = manager.submit(&spec).await.unwrap_err();
        assert!(matches!(error, BatchError::Validation(_)), "{error:?}");
    }

    let array = ArraySpec {
        job: inline_spec("echo"),
        array: "10-1".to_string(),
        max_concurrent: None,
    };
    let error = manager.submit_array(&array).await.unwrap_err();
    assert!(matches!(error, BatchError::Validation(_)), "{error:?}");
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn submit_without_slurm() {
    let dir = temp_dir();
    let runner = FakeRunner::new();
    runner.on("sinfo", &["--version"], FakeReply::Missing);
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let error = manager.submit(&inline_spec("echo")).await.unwrap_err();
    assert!(matches!(error, BatchError::BackendUnavailable));
    assert!(runner.calls_of("sbatch").is_empty());
}

#[tokio::test]
async fn submit_rejected_by_scheduler() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.fail(
        "sbatch",
        &[],
        1,
        "sbatch: error: invalid partition specified: foo\n",
    );
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    match manager.submit(&inline_spec("echo")).await.unwrap_err() {
        BatchError::SchedulerRejected {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "sbatch: error: invalid partition specified: foo");
        }
        error => panic!("Unexpected error {error:?}"),
    }
}

#[tokio::test]
async fn submit_with_unexpected_output() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Job queued somewhere\n");
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let error = manager.submit(&inline_spec("echo")).await.unwrap_err();
    assert!(matches!(error, BatchError::ProtocolMismatch { .. }), "{error:?}");
}

#[tokio::test]
async fn submit_array_job() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Submitted batch job 100\n");
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let spec = ArraySpec {
        job: inline_spec("echo $SLURM_ARRAY_TASK_ID"),
        array: "1-10:3".to_string(),
        max_concurrent: Some(2),
    };
    let job = manager.submit_array(&spec).await.unwrap();
    let array = job.array.unwrap();
    assert_eq!(array.tasks, 4);
    assert_eq!(array.max_concurrent, Some(2));
    assert_eq!(job.stdout_path, Some(dir.path().join("slurm_100_%a.out")));

    let script = runner.calls_of("sbatch")[0].stdin.clone().unwrap();
    assert!(script.contains("#SBATCH --array=1-10:3%2"));
}

#[tokio::test]
async fn submit_array_job_with_full_index_range() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Submitted batch job 101\n");
    let manager = SubmissionManager::new(create_backend(&runner, dir.path()));

    let spec = ArraySpec {
        job: inline_spec("hostname"),
        array: "0-4294967295".to_string(),
        max_concurrent: None,
    };
    let job = manager.submit_array(&spec).await.unwrap();
    assert_eq!(job.job_id, "101");
    assert_eq!(job.array.unwrap().tasks, 4294967296);
}

#[tokio::test]
async fn status_of_queued_job() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &["--format=%i,%T,%r"], "42,PENDING,Resources\n");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let job = monitor.status("42").await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.reason.as_deref(), Some("Resources"));
    assert!(!job.inferred);
}

#[tokio::test]
async fn status_after_submit() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("sbatch", &[], "Submitted batch job 42\n");
    runner.stdout("squeue", &["--format=%i,%T,%r"], "42,RUNNING,None\n");
    let backend = create_backend(&runner, dir.path());

    let job = SubmissionManager::new(backend.clone())
        .submit(&inline_spec("sleep 10"))
        .await
        .unwrap();
    let status = MonitoringService::new(backend)
        .status(&job.job_id)
        .await
        .unwrap();
    assert!(matches!(status.state, JobState::Pending | JobState::Running));
    assert_eq!(status.reason, None);
}

#[tokio::test]
async fn status_falls_back_to_accounting() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.fail("squeue", &[], 1, "slurm_load_jobs error: Invalid job id specified\n");
    runner.stdout(
        "sacct",
        &["--format=JobID,State,ExitCode"],
        "42|FAILED|1:0\n42.batch|FAILED|1:0\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let job = monitor.status("42").await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.reason.as_deref(), Some("exit code 1:0"));
    assert!(!job.inferred);
}

#[tokio::test]
async fn status_of_finished_array_job_from_accounting() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.fail("squeue", &[], 1, "slurm_load_jobs error: Invalid job id specified\n");
    runner.stdout(
        "sacct",
        &["--format=JobID,State,ExitCode"],
        "42_0|COMPLETED|0:0\n42_0.batch|COMPLETED|0:0\n42_1|FAILED|2:0\n42_1.batch|FAILED|2:0\n42_2|COMPLETED|0:0\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let job = monitor.status("42").await.unwrap();
    assert_eq!(job.job_id, "42");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.reason.as_deref(), Some("array task 42_1 exit code 2:0"));
    assert!(!job.inferred);
}

#[tokio::test]
async fn status_of_array_job_with_pending_tasks() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &[], "");
    runner.stdout(
        "sacct",
        &[],
        "420_0|COMPLETED|0:0\n420_[1-3]|PENDING|0:0\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let job = monitor.status("420").await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.reason, None);
    assert!(!job.inferred);
}

#[tokio::test]
async fn status_of_vanished_job_is_inferred() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &[], "");
    runner.stdout("sacct", &[], "");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let job = monitor.status("42").await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.inferred);
    assert_eq!(job.reason.as_deref(), Some("not found in active queue"));
}

#[tokio::test]
async fn status_without_accounting() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &[], "");
    let mut config = crate::tests::utils::test_config(dir.path());
    config.use_accounting = false;
    let backend = crate::backend::Backend::new(std::sync::Arc::new(runner.clone()), config);

    let job = MonitoringService::new(backend).status("42").await.unwrap();
    assert!(job.inferred);
    assert!(runner.calls_of("sacct").is_empty());
}

#[tokio::test]
async fn status_with_malformed_line() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &[], "42 RUNNING\n");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let error = monitor.status("42").await.unwrap_err();
    assert!(matches!(error, BatchError::ProtocolMismatch { .. }), "{error:?}");
}

#[tokio::test]
async fn status_of_invalid_id() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    for job_id in ["", "12; rm", "--all"] {
        let error = monitor.status(job_id).await.unwrap_err();
        assert!(matches!(error, BatchError::Validation(_)), "{error:?}");
    }
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn list_jobs_with_filters() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout(
        "squeue",
        &["--format=%i|%T|%u|%P|%M|%l|%D|%C|%N|%j"],
        "1|RUNNING|alice|cpu|0:10|1:00:00|2|4|n[1-2]|a\n2|RUNNING|alice|cpu|0:05|1:00:00|1|1|n3|b,c\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let snapshot = monitor.list(Some("alice"), Some("running")).await.unwrap();
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.counts[&JobState::Running], 2);
    assert_eq!(snapshot.counts[&JobState::Pending], 0);
    assert_eq!(snapshot.jobs[0].nodes, vec!["n1", "n2"]);
    assert_eq!(snapshot.jobs[1].name.as_deref(), Some("b,c"));
    assert_eq!(snapshot.jobs[1].user.as_deref(), Some("alice"));

    let call = &runner.calls_of("squeue")[0];
    assert!(call.args.windows(2).any(|w| w == ["--user", "alice"]));
    assert!(call.args.windows(2).any(|w| w == ["--states", "RUNNING"]));
}

#[tokio::test]
async fn list_empty_queue() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("squeue", &[], "");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let snapshot = monitor.list(None, None).await.unwrap();
    assert_eq!(snapshot.total, 0);
    assert!(snapshot.jobs.is_empty());
}

#[tokio::test]
async fn details_from_live_queue() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout(
        "scontrol",
        &["show"],
        "JobId=42 JobName=train\n   UserId=alice(1000) JobState=RUNNING Reason=None\n   NumCPUs=4 TRES=cpu=4,mem=8G,node=1 NodeList=gpu[01-02]\n   StdOut=/home/alice/out.txt\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let details = monitor.details("42").await.unwrap();
    assert_eq!(details.source, DetailsSource::Live);
    assert_eq!(details.record.state, JobState::Running);
    assert_eq!(details.record.user.as_deref(), Some("alice"));
    assert_eq!(details.record.memory.as_deref(), Some("8G"));
    assert_eq!(details.record.nodes, vec!["gpu01", "gpu02"]);
    assert!(runner.calls_of("sacct").is_empty());
}

#[tokio::test]
async fn details_from_accounting() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.fail("scontrol", &[], 1, "slurm_load_jobs error: Invalid job id specified");
    runner.stdout(
        "sacct",
        &["--parsable2"],
        "42|train|gpu|proj|4|COMPLETED|0:0|2024-01-01T10:00:00|2024-01-01T11:00:00|01:00:00||\n42.batch|batch||proj|4|COMPLETED|0:0|2024-01-01T10:00:00|2024-01-01T11:00:00|01:00:00|1024K|2048K\n",
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let details = monitor.details("42").await.unwrap();
    assert_eq!(details.source, DetailsSource::Accounting);
    assert_eq!(details.record.state, JobState::Completed);
    assert_eq!(details.account.as_deref(), Some("proj"));
    assert_eq!(details.max_rss.as_deref(), Some("1024K"));
}

#[tokio::test]
async fn details_of_unknown_job() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.fail("scontrol", &[], 1, "slurm_load_jobs error: Invalid job id specified");
    runner.stdout("sacct", &[], "");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let error = monitor.details("42").await.unwrap_err();
    assert!(matches!(error, BatchError::NotFound(_)), "{error:?}");
    assert_eq!(error.kind(), "not_found");
}

#[tokio::test]
async fn output_from_default_location() {
    let dir = temp_dir();
    std::fs::write(dir.path().join("slurm_42.out"), "hello\n").unwrap();
    let runner = FakeRunner::slurm();
    runner.fail("scontrol", &[], 1, "Invalid job id specified");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let output = monitor.output("42", OutputStream::Stdout).await.unwrap();
    assert_eq!(output.content, "hello\n");
    assert_eq!(output.path, dir.path().join("slurm_42.out"));
}

#[tokio::test]
async fn output_from_reported_path() {
    let dir = temp_dir();
    let path = dir.path().join("custom.err");
    std::fs::write(&path, "oops\n").unwrap();
    let runner = FakeRunner::slurm();
    runner.stdout(
        "scontrol",
        &["show"],
        &format!("JobId=42 JobState=COMPLETED StdErr={}\n", path.display()),
    );
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    let output = monitor.output("42", OutputStream::Stderr).await.unwrap();
    assert_eq!(output.content, "oops\n");
    assert_eq!(output.path, path);
}

#[tokio::test]
async fn output_not_written_yet() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("scontrol", &["show"], "JobId=42 JobState=PENDING\n");
    let monitor = MonitoringService::new(create_backend(&runner, dir.path()));

    match monitor.output("42", OutputStream::Stderr).await.unwrap_err() {
        BatchError::OutputNotFound { job_id, candidates } => {
            assert_eq!(job_id, "42");
            assert_eq!(candidates, vec![dir.path().join("slurm_42.err")]);
        }
        error => panic!("Unexpected error {error:?}"),
    }
}

#[tokio::test]
async fn cancel_then_status() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.stdout("scancel", &["42"], "");
    runner.stdout("squeue", &[], "42,CANCELLED,None\n");
    let backend = create_backend(&runner, dir.path());

    let result = CancellationManager::new(backend.clone())
        .cancel("42")
        .await
        .unwrap();
    assert_eq!(result.status, CancellationStatus::Cancelled);

    let job = MonitoringService::new(backend).status("42").await.unwrap();
    assert!(matches!(job.state, JobState::Cancelled | JobState::Completed));
}

#[tokio::test]
async fn cancel_unknown_job() {
    let dir = temp_dir();
    let runner = FakeRunner::slurm();
    runner.on(
        "scancel",
        &[],
        reply(1, "", "scancel: error: Kill job error on job id 42: Invalid job id specified\n"),
    );
    let manager = CancellationManager::new(create_backend(&runner, dir.path()));

    let result = manager.cancel("42").await.unwrap();
    assert_eq!(result.status, CancellationStatus::Error);
    assert!(result.message.contains("Invalid job id"));
}
