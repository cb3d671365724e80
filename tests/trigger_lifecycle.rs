//! Trigger manager: arming, conflicts, deletion and test fires

mod common;

use common::{harness, Harness};
use serde_json::json;
use wireflow::error::TriggerError;
use wireflow::store::{RunStatus, Store, TriggerKind};
use wireflow::trigger::TriggerPatch;
use wireflow::{Edge, Node, NodeKind};

async fn echo_workflow(h: &Harness, id: &str) {
    h.save(
        id,
        vec![
            Node::new("hook", NodeKind::WebhookTrigger, json!({})),
            Node::new("out", NodeKind::Output, json!({})),
        ],
        vec![Edge::new("hook", "out")],
    )
    .await;
}

#[tokio::test]
async fn arming_twice_starts_the_listener_once() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let trigger = h
        .triggers
        .create("wf", TriggerKind::Webhook, json!({"path": "orders"}))
        .await
        .unwrap();

    let armed = h.triggers.arm(&trigger.id).await.unwrap();
    assert!(armed.armed);
    let again = h.triggers.arm(&trigger.id).await.unwrap();
    assert!(again.armed);
    assert_eq!(h.listener.starts(), 1);

    let status = h.triggers.status().await;
    assert!(status.running);
    assert_eq!(status.active_hooks, 1);

    h.triggers.disarm(&trigger.id).await.unwrap();
    assert_eq!(h.listener.stops(), 1);
    assert!(!h.triggers.status().await.running);
    assert!(!h.triggers.get(&trigger.id).await.unwrap().armed);
}

#[tokio::test]
async fn listener_stays_up_while_any_hook_is_armed() {
    let h = harness();
    echo_workflow(&h, "a").await;
    echo_workflow(&h, "b").await;
    let first = h.triggers.create("a", TriggerKind::Webhook, json!({"path": "a"})).await.unwrap();
    let second = h.triggers.create("b", TriggerKind::Webhook, json!({"path": "b"})).await.unwrap();
    h.triggers.arm(&first.id).await.unwrap();
    h.triggers.arm(&second.id).await.unwrap();
    assert_eq!(h.listener.starts(), 1);

    h.triggers.disarm(&first.id).await.unwrap();
    assert_eq!(h.listener.stops(), 0);
    h.triggers.disarm(&second.id).await.unwrap();
    assert_eq!(h.listener.stops(), 1);
}

#[tokio::test]
async fn empty_secret_is_rejected_at_arm_time() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let trigger = h
        .triggers
        .create("wf", TriggerKind::Webhook, json!({"path": "secure", "authMode": "token", "secret": ""}))
        .await
        .unwrap();

    let err = h.triggers.arm(&trigger.id).await.unwrap_err();
    assert!(matches!(err, TriggerError::InvalidConfig(_)));
    assert!(!h.triggers.get(&trigger.id).await.unwrap().armed);
    assert_eq!(h.listener.starts(), 0);
}

#[tokio::test]
async fn one_armed_trigger_per_kind_per_workflow() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let first = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": "one"})).await.unwrap();
    let second = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": "two"})).await.unwrap();
    let cron = h
        .triggers
        .create("wf", TriggerKind::Cron, json!({"expression": "0 9 * * 1-5"}))
        .await
        .unwrap();

    h.triggers.arm(&first.id).await.unwrap();
    let err = h.triggers.arm(&second.id).await.unwrap_err();
    assert!(matches!(err, TriggerError::Conflict(_)));
    assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);

    // a different kind may be armed alongside
    h.triggers.arm(&cron.id).await.unwrap();
    assert!(h.triggers.cron().is_registered(&cron.id));
}

#[tokio::test]
async fn webhook_paths_are_unique_across_workflows() {
    let h = harness();
    echo_workflow(&h, "a").await;
    echo_workflow(&h, "b").await;
    let first = h.triggers.create("a", TriggerKind::Webhook, json!({"path": "shared"})).await.unwrap();
    let second = h.triggers.create("b", TriggerKind::Webhook, json!({"path": "/shared/"})).await.unwrap();

    h.triggers.arm(&first.id).await.unwrap();
    let err = h.triggers.arm(&second.id).await.unwrap_err();
    assert!(matches!(err, TriggerError::Conflict(_)));
    assert!(!h.triggers.get(&second.id).await.unwrap().armed);
}

#[tokio::test]
async fn armed_trigger_cannot_be_deleted() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let trigger = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": "p"})).await.unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();

    let err = h.triggers.delete(&trigger.id).await.unwrap_err();
    assert!(matches!(err, TriggerError::StillArmed(_)));

    h.triggers.disarm(&trigger.id).await.unwrap();
    h.triggers.delete(&trigger.id).await.unwrap();
    assert!(matches!(
        h.triggers.get(&trigger.id).await.unwrap_err(),
        TriggerError::NotFound(_)
    ));
}

#[tokio::test]
async fn triggers_need_an_existing_workflow() {
    let h = harness();
    let err = h
        .triggers
        .create("ghost", TriggerKind::Cron, json!({"expression": "* * * * *"}))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);

    echo_workflow(&h, "wf").await;
    let err = h.triggers.create("wf", TriggerKind::Cron, json!("nope")).await.unwrap_err();
    assert!(matches!(err, TriggerError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_fire_runs_without_counting() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let trigger = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": "p"})).await.unwrap();

    let record = h.triggers.test_fire(&trigger.id).await.unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.trigger_id.as_deref(), Some(trigger.id.as_str()));
    assert_eq!(record.output, Some(json!({"test": true, "triggerId": trigger.id})));

    let stored = h.triggers.get(&trigger.id).await.unwrap();
    assert_eq!(stored.fire_count, 0);
    assert!(stored.last_fired.is_none());

    let log = h.triggers.log(&trigger.id, None).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, "test");
    assert_eq!(log[0].run_id.as_deref(), Some(record.id.as_str()));
}

#[tokio::test]
async fn patching_an_armed_trigger_reregisters_it() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let trigger = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": "old"})).await.unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();

    let updated = h
        .triggers
        .update(
            &trigger.id,
            TriggerPatch {
                config: Some(json!({"path": "new"})),
                armed: None,
            },
        )
        .await
        .unwrap();
    assert!(updated.armed);
    assert_eq!(updated.config, json!({"path": "new"}));
    assert_eq!(h.triggers.status().await.active_hooks, 1);
}

#[tokio::test]
async fn restore_rearms_persisted_triggers() {
    let h = harness();
    echo_workflow(&h, "wf").await;
    let good = h.triggers.create("wf", TriggerKind::Cron, json!({"expression": "*/5 * * * *"})).await.unwrap();
    let bad = h.triggers.create("wf", TriggerKind::Webhook, json!({"path": ""})).await.unwrap();
    h.store.set_trigger_armed(&good.id, true).await.unwrap();
    h.store.set_trigger_armed(&bad.id, true).await.unwrap();

    let restored = h.triggers.restore_armed().await.unwrap();
    assert_eq!(restored, 1);
    assert!(h.triggers.cron().is_registered(&good.id));
    assert!(!h.triggers.get(&bad.id).await.unwrap().armed);
}
