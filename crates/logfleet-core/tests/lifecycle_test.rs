// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the instance lifecycle: initialize, start, stop,
//! force-stop, restart, and drift reconciliation.

mod common;

use common::*;

use logfleet_core::command::pipeline_config_file;
use logfleet_core::deploy::ForceStopOutcome;
use logfleet_core::error::Error;
use logfleet_core::monitor::{FleetMonitor, MonitorConfig};
use logfleet_core::persistence::Persistence;
use logfleet_core::state::InstanceState;
use std::sync::Arc;

#[tokio::test]
async fn full_lifecycle_create_start_stop_delete() {
    let ctx = TestContext::new().await;

    // 1. Create: instance initializes in the background to not_started,
    //    with the pipeline config physically on the machine.
    let (process, instances) = ctx.create_settled_process("nginx-access").await;
    let instance = ctx.instance(instances[0].id).await;
    assert_eq!(instance.state, "not_started");
    assert!(instance.pid.is_none());

    let remote_config = ctx
        .channel
        .file(1, &pipeline_config_file(&instance.deploy_path, instance.id))
        .expect("pipeline config written during initialize");
    assert_eq!(remote_config, process.pipeline_config);

    let init_task = ctx.wait_task_settled(instance.id, "initialize").await;
    assert_eq!(init_task.status, "completed");
    assert!(init_task.started_at.is_some());
    assert!(init_task.ended_at.is_some());

    // 2. Start: running with a recorded pid that is actually alive.
    let batch = ctx.service.start_process(process.id).await.expect("start");
    assert!(batch.all_succeeded());
    let instance = ctx.instance(instance.id).await;
    assert_eq!(instance.state, "running");
    let pid = instance.pid.expect("pid recorded on entry to running");
    assert!(ctx.channel.alive_pids().contains(&pid));

    // 3. Stop: back to not_started with the pid cleared and process dead.
    let batch = ctx.service.stop_process(process.id).await.expect("stop");
    assert!(batch.all_succeeded());
    let stopped = ctx.instance(instance.id).await;
    assert_eq!(stopped.state, "not_started");
    assert!(stopped.pid.is_none());
    assert!(!ctx.channel.alive_pids().contains(&pid));

    // 4. Delete: instance row gone, ledger history still queryable.
    ctx.service.delete_process(process.id).await.expect("delete");
    assert!(
        ctx.persistence
            .get_instance(instance.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(matches!(
        ctx.service.get_process(process.id).await,
        Err(Error::ProcessNotFound(_))
    ));
    let history = ctx
        .service
        .instance_history(instance.id)
        .await
        .expect("history survives deletion");
    assert!(history.len() >= 3, "initialize, start, stop tasks retained");
    assert!(!ctx.channel.dir_exists(1, &instance.deploy_path));
}

#[tokio::test]
async fn start_failure_settles_in_start_failed_with_failed_ledger() {
    let ctx = TestContext::new().await;
    let (process, instances) = ctx.create_settled_process("syslog").await;
    ctx.channel.set_launch_dead_on(1);

    let batch = ctx.service.start_process(process.id).await.expect("dispatch");
    assert!(!batch.all_succeeded());

    let instance = ctx.instance(instances[0].id).await;
    assert_eq!(instance.state, "start_failed");
    assert!(instance.pid.is_none());

    let task = ctx.wait_task_settled(instance.id, "start").await;
    assert_eq!(task.status, "failed");
    assert!(task.error.is_some());

    // Failed task: at least one failed step, and nothing completed after it.
    let detail = ctx.service.task_detail(&task.id).await.expect("detail");
    assert!(detail.failed_steps >= 1);
    let failed_seq = detail
        .steps
        .iter()
        .find(|s| s.status == "failed")
        .map(|s| s.seq)
        .expect("a failed step exists");
    assert!(
        detail
            .steps
            .iter()
            .filter(|s| s.seq > failed_seq)
            .all(|s| s.status != "completed"),
        "no step after the failure may complete"
    );

    // start_failed is a legal retry point.
    ctx.channel.clear_launch_dead(1);
    let retry = ctx.service.start_process(process.id).await.expect("retry");
    assert!(retry.all_succeeded());
    assert_eq!(ctx.instance_state(instances[0].id).await, InstanceState::Running);
}

#[tokio::test]
async fn start_rejected_while_running_creates_no_task() {
    let ctx = TestContext::new().await;
    let (_, instance) = ctx.running_process("kafka-logs").await;

    let before = ctx
        .service
        .instance_history(instance.id)
        .await
        .unwrap()
        .len();
    let err = ctx.service.start_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInstanceState { .. }));
    let msg = err.to_string();
    assert!(msg.contains("running") && msg.contains("not_started"));

    let after = ctx
        .service
        .instance_history(instance.id)
        .await
        .unwrap()
        .len();
    assert_eq!(before, after, "validation errors precede task creation");
    assert_eq!(ctx.instance_state(instance.id).await, InstanceState::Running);
}

#[tokio::test]
async fn stop_timeout_fails_then_force_stop_recovers() {
    let ctx = TestContext::new().await;
    let (_, instance) = ctx.running_process("app-logs").await;
    ctx.channel.set_refuse_term(true);

    let err = ctx.service.stop_instance(instance.id).await.unwrap_err();
    assert!(matches!(err, Error::Execution(_)));
    assert_eq!(
        ctx.instance_state(instance.id).await,
        InstanceState::StopFailed
    );
    let stop_task = ctx.wait_task_settled(instance.id, "stop").await;
    assert_eq!(stop_task.status, "failed");

    // Force-stop is the documented way out; SIGKILL still works here.
    let outcome = ctx
        .service
        .force_stop_instance(instance.id)
        .await
        .expect("force stop");
    assert_eq!(outcome, ForceStopOutcome::Confirmed);
    let recovered = ctx.instance(instance.id).await;
    assert_eq!(recovered.state, "not_started");
    assert!(recovered.pid.is_none());
}

#[tokio::test]
async fn force_stop_reports_unconfirmed_liveness_distinctly() {
    let ctx = TestContext::new().await;
    let (_, instance) = ctx.running_process("audit-logs").await;
    ctx.channel.set_refuse_term(true);
    ctx.channel.set_resist_sigkill(true);

    let outcome = ctx
        .service
        .force_stop_instance(instance.id)
        .await
        .expect("force stop always succeeds");
    assert_eq!(outcome, ForceStopOutcome::Unconfirmed);

    // State machine still settles to not_started with the pid cleared.
    let settled = ctx.instance(instance.id).await;
    assert_eq!(settled.state, "not_started");
    assert!(settled.pid.is_none());

    // The ambiguity is observable in the ledger.
    let task = ctx.wait_task_settled(instance.id, "force_stop").await;
    assert_eq!(task.status, "completed");
    let detail = ctx.service.task_detail(&task.id).await.unwrap();
    let terminate = detail
        .steps
        .iter()
        .find(|s| s.name == "terminate process")
        .expect("terminate step recorded");
    assert_eq!(terminate.status, "completed");
    assert!(
        terminate
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .contains("unconfirmed")
    );
}

#[tokio::test]
async fn force_stop_is_legal_from_idle_state() {
    let ctx = TestContext::new().await;
    let (_, instances) = ctx.create_settled_process("idle-logs").await;

    let outcome = ctx
        .service
        .force_stop_instance(instances[0].id)
        .await
        .expect("force stop from not_started");
    assert_eq!(outcome, ForceStopOutcome::Confirmed);
    assert_eq!(
        ctx.instance_state(instances[0].id).await,
        InstanceState::NotStarted
    );
}

#[tokio::test]
async fn restart_runs_stop_and_start_under_one_task() {
    let ctx = TestContext::new().await;
    let (_, instance) = ctx.running_process("restart-me").await;
    let old_pid = instance.pid.expect("running pid");

    let outcome = ctx
        .service
        .restart_instance(instance.id)
        .await
        .expect("restart");
    let task_id = outcome.task_id.expect("restart task recorded");

    let restarted = ctx.instance(instance.id).await;
    assert_eq!(restarted.state, "running");
    let new_pid = restarted.pid.expect("pid after restart");
    assert_ne!(old_pid, new_pid);

    let detail = ctx.service.task_detail(&task_id).await.unwrap();
    assert_eq!(detail.task.kind, "restart");
    let names: Vec<&str> = detail.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "stop process",
            "verify configuration",
            "launch process",
            "verify process"
        ]
    );
    assert_eq!(detail.failed_steps, 0);
}

#[tokio::test]
async fn batch_failure_is_isolated_per_instance() {
    let ctx = TestContext::new().await;
    let mut spec = ctx.spec("fanout");
    spec.machine_ids = vec![1, 2];
    spec.deploy_path = None; // generated defaults, unique per machine
    let (process, instances) = ctx
        .service
        .create_process(spec, "ops@example.com")
        .await
        .expect("create");
    for instance in &instances {
        ctx.wait_task_settled(instance.id, "initialize").await;
    }

    // Machine 2 launches processes that die instantly.
    ctx.channel.set_launch_dead_on(2);

    let batch = ctx.service.start_process(process.id).await.expect("start");
    let ok: Vec<_> = batch.outcomes.iter().filter(|o| o.result.is_ok()).collect();
    let failed: Vec<_> = batch
        .outcomes
        .iter()
        .filter(|o| o.result.is_err())
        .collect();
    assert_eq!(ok.len(), 1);
    assert_eq!(failed.len(), 1);

    let healthy = instances.iter().find(|i| i.machine_id == 1).unwrap();
    let broken = instances.iter().find(|i| i.machine_id == 2).unwrap();
    assert_eq!(ctx.instance_state(healthy.id).await, InstanceState::Running);
    assert_eq!(
        ctx.instance_state(broken.id).await,
        InstanceState::StartFailed
    );
}

#[tokio::test]
async fn monitor_reconciles_dead_process_to_start_failed() {
    let ctx = TestContext::new().await;
    let (_, instance) = ctx.running_process("watched").await;
    let pid = instance.pid.expect("pid");

    let monitor = FleetMonitor::new(
        Arc::clone(&ctx.persistence),
        ctx.channel.clone(),
        ctx.machines.clone(),
        MonitorConfig::default(),
    );

    // Nothing to reconcile while the process is alive.
    monitor.sweep().await.expect("sweep");
    assert_eq!(ctx.instance_state(instance.id).await, InstanceState::Running);

    // Out-of-band crash: the recorded state has drifted from reality.
    ctx.channel.kill_process(pid);
    monitor.sweep().await.expect("sweep");
    let reconciled = ctx.instance(instance.id).await;
    assert_eq!(reconciled.state, "start_failed");
    assert!(reconciled.pid.is_none());
}
