// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation of single processes and whole process trees over a real
//! SQLite database, including under concurrent claims and status reports.

mod common;

use std::collections::HashSet;

use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

use common::TestContext;
use jobline_core::dispatch::AgentCommand;
use jobline_core::logs::ProcessLogStore;
use jobline_core::model::Capabilities;
use jobline_core::queue::ProcessQueue;
use jobline_core::status::ProcessStatus;

fn cancel(instance_id: Uuid) -> AgentCommand {
    AgentCommand::CancelJob { instance_id }
}

#[tokio::test]
async fn test_kill_cascade_cancels_tree_and_signals_agents() {
    let ctx = TestContext::sqlite().await;

    //   root (RUNNING on agent-1)
    //   ├── queued child
    //   │   └── suspended grandchild
    //   ├── running child (agent-2)
    //   │   └── finished grandchild
    //   └── starting child (no agent yet)
    let root = ctx.enqueue().await;
    ctx.report(root, "agent-1", ProcessStatus::Running).await;

    let queued = ctx.enqueue_child(root).await;
    let suspended = ctx.enqueue_child(queued).await;
    ctx.store
        .update_status_if(suspended, ProcessStatus::Enqueued, ProcessStatus::Suspended)
        .await
        .unwrap();

    let running = ctx.enqueue_child(root).await;
    ctx.report(running, "agent-2", ProcessStatus::Running).await;
    let finished = ctx.enqueue_child(running).await;
    ctx.report(finished, "agent-2", ProcessStatus::Finished).await;

    let starting = ctx.enqueue_child(root).await;
    ctx.store
        .update_status_if(starting, ProcessStatus::Enqueued, ProcessStatus::Starting)
        .await
        .unwrap();

    let bystander = ctx.enqueue().await;

    ctx.engine.kill_cascade(root).await.unwrap();

    assert_eq!(ctx.status(queued).await, ProcessStatus::Cancelled);
    assert_eq!(ctx.status(suspended).await, ProcessStatus::Cancelled);
    assert_eq!(ctx.status(finished).await, ProcessStatus::Finished);
    assert_eq!(ctx.status(bystander).await, ProcessStatus::Enqueued);

    // Active processes keep running until their worker reacts.
    assert_eq!(ctx.status(root).await, ProcessStatus::Running);
    assert_eq!(ctx.status(running).await, ProcessStatus::Running);
    assert_eq!(ctx.status(starting).await, ProcessStatus::Starting);

    assert_eq!(
        ctx.store.take_agent_commands("agent-1").await.unwrap(),
        vec![cancel(root)]
    );
    assert_eq!(
        ctx.store.take_agent_commands("agent-2").await.unwrap(),
        vec![cancel(running)]
    );

    // The starting child's cancel waits for its first report.
    assert!(ctx.store.take_agent_commands("agent-3").await.unwrap().is_empty());
    ctx.report(starting, "agent-3", ProcessStatus::Running).await;
    assert_eq!(
        ctx.store.take_agent_commands("agent-3").await.unwrap(),
        vec![cancel(starting)]
    );

    // The workers acknowledge.
    ctx.report(root, "agent-1", ProcessStatus::Cancelled).await;
    ctx.report(running, "agent-2", ProcessStatus::Cancelled).await;
    assert_eq!(ctx.status(root).await, ProcessStatus::Cancelled);
    assert_eq!(ctx.status(running).await, ProcessStatus::Cancelled);
}

#[tokio::test]
async fn test_kill_cascade_is_idempotent() {
    let ctx = TestContext::sqlite().await;
    let root = ctx.enqueue().await;
    let child = ctx.enqueue_child(root).await;

    ctx.engine.kill_cascade(root).await.unwrap();
    ctx.engine.kill_cascade(root).await.unwrap();

    assert_eq!(ctx.status(root).await, ProcessStatus::Cancelled);
    assert_eq!(ctx.status(child).await, ProcessStatus::Cancelled);

    // Missing roots are a no-op.
    ctx.engine.kill_cascade(Uuid::new_v4()).await.unwrap();
}

#[tokio::test]
async fn test_kill_single_process() {
    let ctx = TestContext::sqlite().await;

    let queued = ctx.enqueue().await;
    ctx.engine.kill(queued).await.unwrap();
    assert_eq!(ctx.status(queued).await, ProcessStatus::Cancelled);

    let running = ctx.enqueue().await;
    ctx.report(running, "agent-1", ProcessStatus::Running).await;
    ctx.engine.kill(running).await.unwrap();
    assert_eq!(ctx.status(running).await, ProcessStatus::Running);
    assert_eq!(
        ctx.store.take_agent_commands("agent-1").await.unwrap(),
        vec![cancel(running)]
    );

    // Terminal processes are left alone and nobody is signalled.
    ctx.engine.kill(queued).await.unwrap();
    assert!(ctx.store.take_agent_commands("agent-1").await.unwrap().is_empty());

    let err = ctx.engine.kill(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.error_code(), "PROCESS_NOT_FOUND");
}

#[tokio::test]
async fn test_kill_during_startup_reaches_first_agent() {
    let ctx = TestContext::sqlite().await;
    let id = ctx.enqueue().await;

    let entry = ctx.claim(json!({})).await;
    assert_eq!(entry.process.instance_id, id);
    assert_eq!(ctx.status(id).await, ProcessStatus::Starting);

    ctx.engine.kill(id).await.unwrap();
    assert_eq!(ctx.status(id).await, ProcessStatus::Starting);

    ctx.report(id, "agent-1", ProcessStatus::Running).await;
    assert_eq!(
        ctx.store.take_agent_commands("agent-1").await.unwrap(),
        vec![cancel(id)]
    );

    // Handed over once; later reports carry nothing.
    ctx.report(id, "agent-1", ProcessStatus::Running).await;
    assert!(ctx.store.take_agent_commands("agent-1").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_cascade_with_concurrent_claims_leaves_nothing_queued() {
    let ctx = TestContext::sqlite().await;
    let root = ctx.enqueue().await;
    ctx.report(root, "agent-1", ProcessStatus::Running).await;

    let mut children = Vec::new();
    for _ in 0..20 {
        children.push(ctx.enqueue_child(root).await);
    }

    // Workers claim children while the cascade runs.
    let claimers: Vec<_> = (0..3)
        .map(|n| {
            let engine = ctx.engine.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                for _ in 0..10 {
                    if let Ok(Some(entry)) = engine.next_payload(&Capabilities::new()).await {
                        let id = entry.process.instance_id;
                        engine
                            .update_status(id, &format!("worker-{n}"), ProcessStatus::Running)
                            .await
                            .unwrap();
                        claimed.push(id);
                    }
                    tokio::task::yield_now().await;
                }
                claimed
            })
        })
        .collect();

    ctx.engine.kill_cascade(root).await.unwrap();

    let claimed: HashSet<Uuid> = join_all(claimers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();

    let mut signalled = HashSet::new();
    for n in 0..3 {
        for command in ctx.store.take_agent_commands(&format!("worker-{n}")).await.unwrap() {
            let AgentCommand::CancelJob { instance_id } = command;
            signalled.insert(instance_id);
        }
    }

    for child in &children {
        let status = ctx.status(*child).await;
        assert!(
            !status.is_queued(),
            "child {child} left queued as {status} after the cascade"
        );
        if status == ProcessStatus::Cancelled {
            assert!(!claimed.contains(child), "a cancelled child was claimed");
        } else {
            assert!(claimed.contains(child), "child {child} is {status} but was never claimed");
            assert!(
                signalled.contains(child),
                "claimed child {child} never received a cancel"
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminal_status_survives_concurrent_writers() {
    let ctx = TestContext::sqlite().await;
    let root = ctx.enqueue().await;
    let mut finished = vec![root];
    for _ in 0..5 {
        finished.push(ctx.enqueue_child(root).await);
    }
    for id in &finished {
        ctx.report(*id, "agent-1", ProcessStatus::Finished).await;
    }

    let mut tasks = Vec::new();
    for id in finished.clone() {
        let engine = ctx.engine.clone();
        tasks.push(tokio::spawn(async move { engine.kill(id).await }));
        let engine = ctx.engine.clone();
        tasks.push(tokio::spawn(async move { engine.kill_cascade(id).await }));
        let engine = ctx.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .update_status(id, "agent-2", ProcessStatus::Running)
                .await
        }));
    }
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    for id in &finished {
        let process = ctx.store.get(*id).await.unwrap().unwrap();
        assert_eq!(process.status, ProcessStatus::Finished);
        assert_eq!(process.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(ctx.store.list(*id).await.unwrap().len(), 1);
    }
    assert!(ctx.store.take_agent_commands("agent-1").await.unwrap().is_empty());
    assert!(ctx.store.take_agent_commands("agent-2").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cascades_over_one_tree() {
    let ctx = TestContext::sqlite().await;
    let root = ctx.enqueue().await;
    let mut tree = vec![root];
    for i in 0..10 {
        let parent = tree[i / 2];
        tree.push(ctx.enqueue_child(parent).await);
    }

    let tasks: Vec<_> = tree
        .iter()
        .map(|id| {
            let engine = ctx.engine.clone();
            let id = *id;
            tokio::spawn(async move { engine.kill_cascade(id).await })
        })
        .collect();
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    for id in &tree {
        assert_eq!(ctx.status(*id).await, ProcessStatus::Cancelled);
    }
}

#[tokio::test]
async fn test_requirements_survive_cascade_snapshot() {
    let ctx = TestContext::sqlite().await;
    let mut process = jobline_core::model::NewProcess::new(Uuid::new_v4());
    process.requirements = Some(json!({"region": "eu"}));
    let root = ctx.enqueue_process(process).await;

    let cascade = ctx.store.get_cascade(root).await.unwrap();
    assert_eq!(cascade.len(), 1);
    assert_eq!(cascade[0].requirements, Some(json!({"region": "eu"})));
}
