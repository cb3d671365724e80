//! Cron ticks driven with an explicit clock

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{harness, Harness};
use serde_json::{json, Value};
use wireflow::store::{Store, Trigger, TriggerKind};
use wireflow::{Edge, Node, NodeKind};

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, h, m, s).unwrap()
}

async fn cron_workflow(h: &Harness) {
    h.save(
        "nightly",
        vec![
            Node::new("tick", NodeKind::CronTrigger, json!({})),
            Node::new("out", NodeKind::Output, json!({})),
        ],
        vec![Edge::new("tick", "out").from_handle("timestamp")],
    )
    .await;
}

/// Persist an armed cron trigger as a previous process would have left it
async fn persisted_trigger(h: &Harness, config: Value, last_fired: DateTime<Utc>, fire_count: i64) -> Trigger {
    let trigger = Trigger {
        id: "cron-1".to_string(),
        workflow_id: "nightly".to_string(),
        kind: TriggerKind::Cron,
        config,
        armed: true,
        last_fired: Some(last_fired),
        fire_count,
        created_at: last_fired - Duration::days(1),
        updated_at: last_fired - Duration::days(1),
    };
    h.store.save_trigger(&trigger).await.unwrap();
    trigger
}

#[tokio::test]
async fn fires_once_per_matching_minute() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = h
        .triggers
        .create("nightly", TriggerKind::Cron, json!({"expression": "*/1 * * * *"}))
        .await
        .unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();
    let cron = h.triggers.cron();

    let report = cron.tick_at(at(12, 0, 5)).await;
    assert_eq!(report.fired, vec![trigger.id.clone()]);
    report.settle().await;

    let report = cron.tick_at(at(12, 0, 35)).await;
    assert!(report.fired.is_empty());

    let report = cron.tick_at(at(12, 1, 2)).await;
    assert_eq!(report.fired.len(), 1);
    report.settle().await;

    let stored = h.triggers.get(&trigger.id).await.unwrap();
    assert_eq!(stored.fire_count, 2);
    assert_eq!(stored.last_fired, Some(at(12, 1, 0)));

    let log = h.triggers.log(&trigger.id, None).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|entry| entry.status == "completed"));
}

#[tokio::test]
async fn non_matching_minutes_stay_quiet() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = h
        .triggers
        .create("nightly", TriggerKind::Cron, json!({"expression": "30 9 * * *"}))
        .await
        .unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();

    assert!(h.triggers.cron().tick_at(at(9, 29, 59)).await.fired.is_empty());
    let report = h.triggers.cron().tick_at(at(9, 30, 0)).await;
    assert_eq!(report.fired.len(), 1);
    report.settle().await;
}

#[tokio::test]
async fn restart_inside_a_fired_minute_does_not_refire() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = persisted_trigger(&h, json!({"expression": "* * * * *"}), at(12, 0, 10), 5).await;

    assert_eq!(h.triggers.restore_armed().await.unwrap(), 1);
    let cron = h.triggers.cron();
    assert!(cron.is_registered(&trigger.id));

    assert!(cron.tick_at(at(12, 0, 40)).await.fired.is_empty());

    let report = cron.tick_at(at(12, 1, 0)).await;
    assert_eq!(report.fired.len(), 1);
    report.settle().await;
    assert_eq!(h.triggers.get(&trigger.id).await.unwrap().fire_count, 6);
}

#[tokio::test]
async fn run_all_replays_missed_minutes_before_the_current_one() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = persisted_trigger(
        &h,
        json!({"expression": "* * * * *", "catchUp": "run_all", "maxConcurrent": 2}),
        at(11, 57, 0),
        0,
    )
    .await;
    h.triggers.restore_armed().await.unwrap();

    let report = h.triggers.cron().tick_at(at(12, 0, 0)).await;
    assert_eq!(report.catch_up, vec![trigger.id.clone()]);
    assert_eq!(report.fired, vec![trigger.id.clone()]);
    report.settle().await;

    // 11:58 and 11:59 replayed, 12:00 fired live
    assert_eq!(h.triggers.get(&trigger.id).await.unwrap().fire_count, 3);
}

#[tokio::test]
async fn skip_policy_drops_missed_minutes() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = persisted_trigger(&h, json!({"expression": "* * * * *"}), at(11, 0, 0), 0).await;
    h.triggers.restore_armed().await.unwrap();

    let report = h.triggers.cron().tick_at(at(12, 0, 0)).await;
    assert!(report.catch_up.is_empty());
    assert_eq!(report.fired.len(), 1);
    report.settle().await;
    assert_eq!(h.triggers.get(&trigger.id).await.unwrap().fire_count, 1);
}

#[tokio::test]
async fn disarmed_trigger_no_longer_ticks() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = h
        .triggers
        .create("nightly", TriggerKind::Cron, json!({"expression": "* * * * *"}))
        .await
        .unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();
    h.triggers.disarm(&trigger.id).await.unwrap();

    assert!(h.triggers.cron().is_empty());
    assert!(h.triggers.cron().tick_at(at(12, 0, 0)).await.fired.is_empty());
}

#[tokio::test]
async fn run_once_replay_leaves_the_current_minute_live() {
    let h = harness();
    cron_workflow(&h).await;
    let trigger = persisted_trigger(
        &h,
        json!({"expression": "*/5 * * * *", "catchUp": "run_once"}),
        at(12, 0, 0),
        4,
    )
    .await;
    h.triggers.restore_armed().await.unwrap();

    // 12:05 replays while 12:10 fires live under a ceiling of one
    let report = h.triggers.cron().tick_at(at(12, 10, 3)).await;
    assert_eq!(report.catch_up, vec![trigger.id.clone()]);
    assert_eq!(report.fired, vec![trigger.id.clone()]);
    report.settle().await;

    let stored = h.triggers.get(&trigger.id).await.unwrap();
    assert_eq!(stored.fire_count, 6);
    assert_eq!(stored.last_fired, Some(at(12, 10, 0)));
}

#[tokio::test]
async fn ceiling_skips_a_fire_while_a_run_is_active() {
    let h = harness();
    h.save(
        "nightly",
        vec![
            Node::new("tick", NodeKind::CronTrigger, json!({})),
            Node::new("nap", NodeKind::ShellExec, json!({"command": "sleep 1"})),
            Node::new("out", NodeKind::Output, json!({})),
        ],
        vec![Edge::new("tick", "nap"), Edge::new("nap", "out").from_handle("exitCode")],
    )
    .await;
    let trigger = h
        .triggers
        .create("nightly", TriggerKind::Cron, json!({"expression": "* * * * *", "maxConcurrent": 1}))
        .await
        .unwrap();
    h.triggers.arm(&trigger.id).await.unwrap();
    let cron = h.triggers.cron();

    let first = cron.tick_at(at(12, 0, 0)).await;
    assert_eq!(first.fired.len(), 1);

    // the 12:00 run is still sleeping
    let skipped = cron.tick_at(at(12, 1, 0)).await;
    assert!(skipped.fired.is_empty());

    first.settle().await;
    let next = cron.tick_at(at(12, 2, 0)).await;
    assert_eq!(next.fired.len(), 1);
    next.settle().await;

    assert_eq!(h.triggers.get(&trigger.id).await.unwrap().fire_count, 2);
}
