// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for scale-out conflict handling and scale-in safety rails.

mod common;

use common::*;

use logfleet_core::error::Error;
use logfleet_core::persistence::Persistence;
use logfleet_core::service::ScaleRequest;
use logfleet_core::state::InstanceState;

#[tokio::test]
async fn scale_out_onto_occupied_path_is_rejected_whole() {
    let ctx = TestContext::new().await;
    let (process, instances) = ctx.create_settled_process("occupied").await;
    let taken_path = instances[0].deploy_path.clone();

    // Machine 2 is free, machine 1 collides: the whole batch must fail
    // before any row or remote action exists.
    let err = ctx
        .service
        .scale_process(
            process.id,
            ScaleRequest {
                add_machine_ids: vec![2, 1],
                deploy_path: Some(taken_path.clone()),
                ..ScaleRequest::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        Error::PathConflict {
            machine_id,
            deploy_path,
            instance_id,
        } => {
            assert_eq!(machine_id, 1);
            assert_eq!(deploy_path, taken_path);
            assert_eq!(instance_id, instances[0].id);
        }
        other => panic!("expected PathConflict, got {other}"),
    }

    let remaining = ctx.service.process_instances(process.id).await.unwrap();
    assert_eq!(remaining.len(), 1, "instance count unchanged");
    // No provisioning task was created for the rejected batch.
    let history = ctx
        .service
        .instance_history(instances[0].id)
        .await
        .unwrap();
    assert!(history.iter().all(|t| t.kind != "scale_out_init"));
}

#[tokio::test]
async fn scale_out_provisions_and_initializes_new_instances() {
    let ctx = TestContext::new().await;
    let (process, _) = ctx.create_settled_process("growing").await;

    let created = ctx
        .service
        .scale_process(
            process.id,
            ScaleRequest {
                add_machine_ids: vec![2, 3],
                ..ScaleRequest::default()
            },
        )
        .await
        .expect("scale out");
    assert_eq!(created.len(), 2);
    for instance in &created {
        assert!(
            instance.deploy_path.starts_with("/opt/logfleet/agent-"),
            "generated default path, got {}",
            instance.deploy_path
        );
        let task = ctx.wait_task_settled(instance.id, "scale_out_init").await;
        assert_eq!(task.status, "completed");
        ctx.wait_instance_state(instance.id, InstanceState::NotStarted)
            .await;
    }
    assert_eq!(
        ctx.service.process_instances(process.id).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn duplicate_machines_in_one_request_are_rejected() {
    let ctx = TestContext::new().await;
    let (process, _) = ctx.create_settled_process("dupes").await;
    let err = ctx
        .service
        .scale_process(
            process.id,
            ScaleRequest {
                add_machine_ids: vec![2, 2],
                ..ScaleRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(
        ctx.service.process_instances(process.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn scale_in_to_zero_is_rejected_with_no_side_effects() {
    let ctx = TestContext::new().await;
    let (process, instances) = ctx.create_settled_process("solo").await;

    let before_rm = ctx.channel.commands_containing("rm -rf");
    let err = ctx
        .service
        .scale_process(
            process.id,
            ScaleRequest {
                remove_instance_ids: vec![instances[0].id],
                ..ScaleRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Row still there, directory untouched, no remote deletion attempted.
    assert_eq!(
        ctx.service.process_instances(process.id).await.unwrap().len(),
        1
    );
    assert!(ctx.channel.dir_exists(1, &instances[0].deploy_path));
    assert_eq!(ctx.channel.commands_containing("rm -rf"), before_rm);
}

#[tokio::test]
async fn scale_in_of_running_instance_requires_force() {
    let ctx = TestContext::new().await;
    let mut spec = ctx.spec("pair");
    spec.machine_ids = vec![1, 2];
    spec.deploy_path = None;
    let (process, instances) = ctx
        .service
        .create_process(spec, "ops@example.com")
        .await
        .expect("create");
    for instance in &instances {
        ctx.wait_task_settled(instance.id, "initialize").await;
    }
    let batch = ctx.service.start_process(process.id).await.expect("start");
    assert!(batch.all_succeeded());

    let target = instances
        .iter()
        .find(|i| i.machine_id == 2)
        .expect("instance on machine 2");

    // Non-forced: rejected while running, nothing removed.
    let err = ctx
        .service
        .scale_process(
            process.id,
            ScaleRequest {
                remove_instance_ids: vec![target.id],
                ..ScaleRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(ctx.instance_state(target.id).await, InstanceState::Running);

    // Forced: stopped, directory removed, row removed, history retained.
    ctx.service
        .scale_process(
            process.id,
            ScaleRequest {
                remove_instance_ids: vec![target.id],
                force: true,
                ..ScaleRequest::default()
            },
        )
        .await
        .expect("forced scale in");

    assert!(
        ctx.persistence
            .get_instance(target.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(!ctx.channel.dir_exists(2, &target.deploy_path));
    let history = ctx.service.instance_history(target.id).await.unwrap();
    assert!(
        history.iter().any(|t| t.kind == "stop"),
        "forced scale-in stop is on the ledger"
    );
    // The survivor keeps running.
    let survivor = instances.iter().find(|i| i.machine_id == 1).unwrap();
    assert_eq!(ctx.instance_state(survivor.id).await, InstanceState::Running);
}

#[tokio::test]
async fn concurrent_path_reservation_is_atomic() {
    let ctx = TestContext::new().await;
    let (process, _) = ctx.create_settled_process("racer").await;

    // Two scale-outs race for the same explicit path on machine 2. The
    // unique constraint guarantees at most one wins even though both pass
    // the pre-check read.
    let path = "/opt/logfleet/contested".to_string();
    let first = ctx.service.scale_process(
        process.id,
        ScaleRequest {
            add_machine_ids: vec![2],
            deploy_path: Some(path.clone()),
            ..ScaleRequest::default()
        },
    );
    let second = ctx.service.scale_process(
        process.id,
        ScaleRequest {
            add_machine_ids: vec![2],
            deploy_path: Some(path.clone()),
            ..ScaleRequest::default()
        },
    );
    let (a, b) = tokio::join!(first, second);
    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one reservation may win: {a:?} / {b:?}");

    let holders = ctx
        .persistence
        .find_instance_by_machine_and_path(2, &path)
        .await
        .unwrap();
    assert!(holders.is_some());
}
