
use std::collections::HashSet;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gpu_idle_scheduler::config::SchedulerConfig;
use gpu_idle_scheduler::controller::{Controller, RunSummary};
use gpu_idle_scheduler::scheduler::{Job, JobAssigner, JobOutcome, JobStatus};
use test_harness::{fake_cluster, script, test_config};

const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `controller` to completion and collect every delivered outcome.
async fn run_to_end(
    controller: Controller,
    shutdown: CancellationToken,
) -> (RunSummary, Vec<JobOutcome>) {
    let (tx, mut rx) = mpsc::channel(64);
    let summary = tokio::time::timeout(RUN_TIMEOUT, controller.run(tx, shutdown))
        .await
        .expect("run did not finish");

    let mut outcomes = Vec::new();
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }
    (summary, outcomes)
}

#[tokio::test]
async fn test_single_job_runs_to_completion() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(1, test_config(staging.path()));
    fakes[0].state().log_output = "accuracy: 0.93\n".to_string();

    assert!(controller.submit(Job::new(script(&dir, "eval.py"), 60)).await);
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    assert_eq!(
        summary,
        RunSummary {
            interrupted: false,
            unfinished_jobs: 0
        }
    );
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, JobStatus::Completed);
    assert_eq!(outcomes[0].machine, "gpu-0");
    assert_eq!(outcomes[0].output.as_deref(), Some("accuracy: 0.93\n"));
    assert_eq!(fakes[0].state().launches.len(), 1);
}

#[tokio::test]
async fn test_jobs_spread_over_idle_machines() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(2, test_config(staging.path()));
    for fake in &fakes {
        fake.state().job_runtime_checks = 3;
    }

    for i in 0..6 {
        controller
            .submit(Job::new(script(&dir, &format!("job{i}.py")), 60))
            .await;
    }
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    assert!(!summary.interrupted);
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.status == JobStatus::Completed));

    let mut scripts: Vec<String> = outcomes.iter().map(|o| o.job.script_name()).collect();
    scripts.sort();
    scripts.dedup();
    assert_eq!(scripts.len(), 6);

    let launches: usize = fakes.iter().map(|f| f.state().launches.len()).sum();
    assert_eq!(launches, 6);
    assert!(fakes.iter().all(|f| !f.state().launches.is_empty()));
}

#[tokio::test]
async fn test_one_machine_runs_jobs_one_at_a_time_in_order() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(1, test_config(staging.path()));
    fakes[0].state().job_runtime_checks = 2;

    for name in ["a.py", "b.py", "c.py"] {
        controller.submit(Job::new(script(&dir, name), 60)).await;
    }
    let (_, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    let order: Vec<String> = outcomes.iter().map(|o| o.job.script_name()).collect();
    assert_eq!(order, vec!["a.py", "b.py", "c.py"]);

    // Each process had exited before the next launch.
    let fake = fakes[0].state();
    assert_eq!(fake.launches.len(), 3);
    assert!(fake.running.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_assignment_passes_never_share_a_job() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(4, test_config(staging.path()));
    for fake in &fakes {
        fake.state().job_runtime_checks = 100;
    }
    for machine in &controller.machines {
        machine.refresh_utilization().await;
    }
    for i in 0..10 {
        controller
            .submit(Job::new(script(&dir, &format!("job{i}.py")), 60))
            .await;
    }

    let (tx, _rx) = mpsc::channel(64);
    let mut passes = Vec::new();
    for _ in 0..2 {
        let mut assigner = JobAssigner::new(
            controller.machines.clone(),
            controller.job_queue.clone(),
            tx.clone(),
        );
        passes.push(tokio::spawn(async move {
            let started = assigner.assign_pass().await;
            (assigner, started)
        }));
    }
    let mut assigners = Vec::new();
    let mut started = 0;
    for pass in passes {
        let (assigner, count) = pass.await.unwrap();
        started += count;
        assigners.push(assigner);
    }
    assert_eq!(started, 4);

    let launched = test_harness::wait_for(Duration::from_secs(5), || {
        let fakes = fakes.clone();
        async move { fakes.iter().map(|f| f.state().launches.len()).sum::<usize>() == 4 }
    })
    .await;
    assert!(launched);

    let mut attached = HashSet::new();
    for machine in &controller.machines {
        let state = machine.state().read().await;
        let job = state
            .current_job()
            .or(state.dispatching_job())
            .expect("every idle machine got a job");
        assert!(attached.insert(job.id), "job attached to two machines");
    }
    let queued: HashSet<_> = controller
        .job_queue
        .read()
        .await
        .peek_all()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(queued.len(), 6);
    assert!(attached.is_disjoint(&queued));
    assert!(fakes.iter().all(|f| f.state().launches.len() == 1));
    drop(assigners);
}

#[tokio::test]
async fn test_busy_machine_never_receives_jobs() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(2, test_config(staging.path()));
    fakes[0].state().default_utilization = 95;

    for i in 0..3 {
        controller
            .submit(Job::new(script(&dir, &format!("job{i}.py")), 60))
            .await;
    }
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    assert!(!summary.interrupted);
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.machine == "gpu-1"));
    assert!(fakes[0].state().launches.is_empty());
}

#[tokio::test]
async fn test_failed_transfer_is_retried() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(1, test_config(staging.path()));
    fakes[0].state().fail_copy_to = 1;

    controller
        .submit(Job::new(script(&dir, "flaky.py"), 60))
        .await;
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    assert!(!summary.interrupted);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, JobStatus::Completed);
    assert_eq!(outcomes[0].job.attempts, 1);
    assert!(fakes[0]
        .state()
        .removed
        .contains(&"/tmp/flaky.py".to_string()));
}

#[tokio::test]
async fn test_abandoned_job_is_reported_and_run_ends() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let config = SchedulerConfig {
        max_dispatch_attempts: 2,
        ..test_config(staging.path())
    };
    let (controller, fakes) = fake_cluster(1, config);
    fakes[0].state().fail_launch = 10;

    controller
        .submit(Job::new(script(&dir, "broken.py"), 60))
        .await;
    controller.submit(Job::new(script(&dir, "next.py"), 60)).await;
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;

    assert_eq!(summary.unfinished_jobs, 0);
    assert!(!summary.interrupted);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == JobStatus::Failed));
    assert!(outcomes.iter().all(|o| o.output.is_none()));
    assert!(fakes[0].state().launches.is_empty());
}

#[tokio::test]
async fn test_shutdown_interrupts_run() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(1, test_config(staging.path()));
    fakes[0].state().default_utilization = 100;

    controller
        .submit(Job::new(script(&dir, "waiting.py"), 60))
        .await;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let (summary, outcomes) = run_to_end(controller, shutdown).await;

    assert!(summary.interrupted);
    assert_eq!(summary.unfinished_jobs, 1);
    assert!(outcomes.is_empty());
    assert!(fakes[0].state().utilization_queries > 0);
}

#[tokio::test]
async fn test_shutdown_while_job_running() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, fakes) = fake_cluster(1, test_config(staging.path()));
    fakes[0].state().job_runtime_checks = u32::MAX;

    controller
        .submit(Job::new(script(&dir, "long.py"), 3600))
        .await;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let fake = fakes[0].clone();
    tokio::spawn(async move {
        test_harness::wait_for(Duration::from_secs(5), || {
            let fake = fake.clone();
            async move { !fake.state().launches.is_empty() }
        })
        .await;
        trigger.cancel();
    });
    let (summary, outcomes) = run_to_end(controller, shutdown).await;

    assert!(summary.interrupted);
    assert_eq!(summary.unfinished_jobs, 1);
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn test_is_finished() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, _fakes) = fake_cluster(2, test_config(staging.path()));
    assert!(controller.is_finished().await);

    controller.submit(Job::new(script(&dir, "a.py"), 60)).await;
    assert!(!controller.is_finished().await);

    let job = controller.job_queue.write().await.take_oldest().unwrap();
    controller.machines[0]
        .state()
        .write()
        .await
        .try_reserve(job)
        .unwrap();
    assert!(!controller.is_finished().await);

    let mut state = controller.machines[0].state().write().await;
    state.mark_running(7).unwrap();
    state.finish_job(Ok(String::new()));
    drop(state);
    // Outcome not yet delivered.
    assert!(!controller.is_finished().await);

    controller.machines[0]
        .state()
        .write()
        .await
        .take_pending_outputs();
    assert!(controller.is_finished().await);
}

#[tokio::test]
async fn test_status_lists_queue_and_machines() {
    let staging = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let (controller, _fakes) = fake_cluster(2, test_config(staging.path()));
    controller.submit(Job::new(script(&dir, "a.py"), 30)).await;
    controller.submit(Job::new(script(&dir, "b.py"), 45)).await;

    let report = controller.status().await;
    assert_eq!(report.machines.len(), 2);
    assert!(report.machines.iter().all(|m| !m.idle && m.script.is_none()));
    assert_eq!(report.pending.len(), 2);
    assert_eq!(report.pending[0].script, "a.py");
    assert_eq!(report.pending[1].timeout_secs, 45);

    let table = report.render_table();
    assert!(table.contains("gpu-0"));
    assert!(table.contains("a.py (Timeout: 30s)"));
}

#[tokio::test]
async fn test_empty_run_finishes_immediately() {
    let staging = TempDir::new().unwrap();
    let (controller, _fakes) = fake_cluster(1, test_config(staging.path()));
    let (summary, outcomes) = run_to_end(controller, CancellationToken::new()).await;
    assert!(!summary.interrupted);
    assert!(outcomes.is_empty());
}
