//! End-to-end scenarios over the full pipeline: in-memory store, scripted
//! LLM, recording chat double.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use common::{seed_person, seed_task, seed_user, FnLlm, Fixture};
use kokoro::announce::executor::ExecutorDeps;
use kokoro::announce::Status;
use kokoro::jobs::JobRunner;
use kokoro::store::conversation::StateType;

fn task_routing() -> Arc<FnLlm> {
    Arc::new(FnLlm::routing(vec![
        (
            "タスクを教えて",
            r#"{"intent": "task_search", "entities": {}, "confidence": 0.92, "urgency": "normal", "reasoning": "task list request"}"#
                .to_owned(),
        ),
        (
            "タスクをお願い",
            r#"{"intent": "task_create", "entities": {"assignee": "太郎", "body": "スライド準備", "deadline": "金曜"}, "confidence": 0.9, "urgency": "normal", "reasoning": "task creation"}"#
                .to_owned(),
        ),
    ]))
}

/// Scenario 1: "Tell me my tasks." — grouped list across rooms, state
/// stays normal, one successful decision row.
#[tokio::test]
async fn scenario_task_search_lists_across_rooms() {
    let fixture = Fixture::new(task_routing()).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "スライド準備").await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "予算レビュー").await;
    seed_task(&fixture.db, fixture.tenant_id, "room-b", fixture.user_id, "会場の手配").await;

    let reply = fixture
        .brain
        .handle(fixture.message("m-1", "room-a", "タスクを教えて"))
        .await
        .expect("reply");
    fixture.settle().await;

    assert!(reply.text.contains("3件"));
    assert!(reply.text.contains("room-a") && reply.text.contains("room-b"));

    let tenant = fixture.db.tenant(fixture.tenant_id);
    let state = tenant
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::Normal);

    assert_eq!(fixture.decision_count().await, 1);
    assert_eq!(fixture.chat.sent_count(), 1, "exactly one outbound reply");
}

/// Scenario 2: "Create a task for Taro by Friday" — unique resolution, no
/// confirmation, creation reply with a follow-up suggestion.
#[tokio::test]
async fn scenario_task_create_with_deadline() {
    let fixture = Fixture::new(task_routing()).await;
    seed_person(&fixture.db, fixture.tenant_id, "太郎", Some("acct-taro")).await;
    seed_user(&fixture.db, fixture.tenant_id, "acct-taro", "太郎", 2).await;

    let reply = fixture
        .brain
        .handle(fixture.message(
            "m-2",
            "room-a",
            "太郎さんに金曜までにタスクをお願い：スライド準備",
        ))
        .await
        .expect("reply");
    fixture.settle().await;

    assert!(reply.text.contains("作成しました"), "{}", reply.text);
    assert!(reply.text.contains("💡"), "suggestion appended: {}", reply.text);

    // The chat-side task carries the Friday deadline.
    let tasks = fixture.chat.tasks.lock().expect("lock");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].1, vec!["acct-taro".to_owned()]);
    assert!(tasks[0].2.is_some(), "deadline forwarded");
    drop(tasks);

    assert_eq!(fixture.decision_count().await, 1);
}

/// Scenario 3: announcement end to end — auto-picked room, confirmation
/// preview, "はい", scheduling, and an executed delivery with tasks and
/// one completed log row.
#[tokio::test]
async fn scenario_announcement_flow_to_delivery() {
    let llm = Arc::new(FnLlm::routing(vec![(
        "研修チャットにアナウンス",
        r#"{"intent": "announcement_create", "entities": {"message": "明日はノートPCを持参してください", "room": "研修チャット", "create_tasks": true, "task_deadline": "明日 18:00"}, "confidence": 0.93, "reasoning": "announcement request"}"#
            .to_owned(),
    )]));
    let fixture = Fixture::new(llm).await;
    let tenant = fixture.db.tenant(fixture.tenant_id);

    // Stage (a)+(b): request → resolved preview.
    let preview = fixture
        .brain
        .handle(fixture.message(
            "m-3",
            "room-src",
            "研修チャットにアナウンスして：明日はノートPC持参。全員にタスクも。",
        ))
        .await
        .expect("preview");
    assert!(preview.text.contains("配信先: 研修チャット"), "{}", preview.text);

    let state = tenant
        .current_state("room-src", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::Announcement);

    // Stage (c)+(d): confirm.
    let confirmed = fixture
        .brain
        .handle(fixture.message("m-4", "room-src", "はい"))
        .await
        .expect("confirmed");
    assert!(confirmed.text.contains("配信します"), "{}", confirmed.text);

    let announcement_id = state.reference_id.clone().expect("reference");
    let announcement = tenant
        .announcement(Uuid::parse_str(&announcement_id).expect("uuid"))
        .await
        .expect("load");
    assert_eq!(announcement.status, Status::Scheduled);
    let next = announcement.next_execution_at.expect("next execution set");
    assert!(next > Utc::now() - chrono::Duration::seconds(1));

    // Stage (e): the job runner delivers.
    let runner = JobRunner::new(
        fixture.db.clone(),
        ExecutorDeps {
            messaging: fixture.chat.clone(),
            tasks: fixture.chat.clone(),
        },
        Duration::from_secs(30),
        Duration::from_secs(30),
    );
    let sends_before = fixture.chat.sent_count();
    runner
        .tick_once(Utc::now() + chrono::Duration::seconds(30))
        .await
        .expect("tick");
    fixture.settle().await;

    assert_eq!(fixture.chat.sent_count(), sends_before + 1, "one delivery");
    let (room, text) = fixture.chat.last_sent().expect("sent");
    assert_eq!(room, "r-train");
    assert!(text.contains("ノートPC"), "{text}");

    // Tasks created for both members; one completed log row.
    let created = fixture.chat.tasks.lock().expect("lock");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1.len(), 2);
    drop(created);

    let logs = tenant
        .execution_logs(Uuid::parse_str(&announcement_id).expect("uuid"))
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].1, "completed");

    let after = tenant
        .announcement(Uuid::parse_str(&announcement_id).expect("uuid"))
        .await
        .expect("reload");
    assert_eq!(after.status, Status::Completed);
}

/// Scenario 4: bare "それ" with no referent — low confidence, a
/// confirmation listing concrete referents, state = confirmation.
#[tokio::test]
async fn scenario_bare_pronoun_asks_with_referents() {
    let fixture = Fixture::new(Arc::new(FnLlm::routing(vec![]))).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "スライド準備").await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "予算レビュー").await;

    let reply = fixture
        .brain
        .handle(fixture.message("m-5", "room-a", "それ"))
        .await
        .expect("reply");
    fixture.settle().await;

    assert!(reply.text.contains("どの件"), "{}", reply.text);
    assert!(reply.text.contains("タスク"), "task referents listed: {}", reply.text);

    let state = fixture
        .db
        .tenant(fixture.tenant_id)
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::Confirmation);
    assert!(state.data.get("plan").is_some(), "pending plan reconstructable");
}

/// Scenario 5: "never mind" during goal-setting step `why` — state back
/// to normal, canonical acknowledgement, audit row, no goal persisted.
#[tokio::test]
async fn scenario_cancel_during_goal_flow() {
    let llm = Arc::new(FnLlm::routing(vec![(
        "目標を設定",
        r#"{"intent": "goal_set", "entities": {"title": "簿記2級"}, "confidence": 0.9, "reasoning": "goal"}"#
            .to_owned(),
    )]));
    let fixture = Fixture::new(llm).await;
    let tenant = fixture.db.tenant(fixture.tenant_id);

    fixture
        .brain
        .handle(fixture.message("m-6", "room-a", "目標を設定したい：簿記2級"))
        .await
        .expect("flow opened");
    let state = tenant
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::GoalSetting);
    assert_eq!(state.step, "why");

    let reply = fixture
        .brain
        .handle(fixture.message("m-7", "room-a", "やっぱりやめる"))
        .await
        .expect("cancelled");
    fixture.settle().await;

    assert!(reply.text.contains("中止します"), "{}", reply.text);
    let state = tenant
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::Normal);

    // No goal was persisted beyond the prior step.
    assert!(tenant
        .active_goals_for(fixture.user_id, 10)
        .await
        .expect("goals")
        .is_empty());

    // One audit row for the cancellation.
    let audit = tenant.recent_audit(20).await.expect("audit");
    assert_eq!(
        audit
            .iter()
            .filter(|entry| entry.action == "state_cancelled")
            .count(),
        1
    );
}

/// Scenario 6: an identical webhook delivered twice — the replay performs
/// nothing and writes no decision row.
#[tokio::test]
async fn scenario_duplicate_delivery_short_circuits() {
    let fixture = Fixture::new(task_routing()).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "スライド準備").await;

    let first = fixture
        .brain
        .handle(fixture.message("m-8", "room-a", "タスクを教えて"))
        .await;
    assert!(first.is_some());

    let replay = fixture
        .brain
        .handle(fixture.message("m-8", "room-a", "タスクを教えて"))
        .await;
    assert!(replay.is_none(), "duplicate is a no-op");
    fixture.settle().await;

    assert_eq!(fixture.decision_count().await, 1, "no decision row for the replay");
    assert_eq!(fixture.chat.sent_count(), 1, "no second reply");
}

/// LLM outage: keyword-only understanding caps confidence, which forces a
/// confirmation instead of a silent action.
#[tokio::test]
async fn llm_outage_degrades_to_confirmation() {
    let fixture = Fixture::new(Arc::new(FnLlm::down())).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "スライド準備").await;

    let reply = fixture
        .brain
        .handle(fixture.message("m-9", "room-a", "タスクを教えて"))
        .await
        .expect("reply");
    fixture.settle().await;

    let state = fixture
        .db
        .tenant(fixture.tenant_id)
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::Confirmation, "{}", reply.text);

    // Accepting the confirmation releases the stored plan.
    let confirmed = fixture
        .brain
        .handle(fixture.message("m-10", "room-a", "はい"))
        .await
        .expect("confirmed");
    assert!(confirmed.text.contains("1件"), "{}", confirmed.text);
}

/// A clear new request mid-flow deflects into the full pipeline with the
/// active state attached; the flow itself is preserved for the next turn.
#[tokio::test]
async fn mid_flow_request_deflects_to_pipeline() {
    let llm = Arc::new(FnLlm::routing(vec![
        (
            "目標を設定",
            r#"{"intent": "goal_set", "entities": {"title": "簿記2級"}, "confidence": 0.9, "reasoning": "goal"}"#
                .to_owned(),
        ),
        (
            "タスクを教えて",
            r#"{"intent": "task_search", "entities": {}, "confidence": 0.92, "reasoning": "task list request"}"#
                .to_owned(),
        ),
    ]));
    let fixture = Fixture::new(llm).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "予算レビュー").await;
    let tenant = fixture.db.tenant(fixture.tenant_id);

    fixture
        .brain
        .handle(fixture.message("m-13", "room-a", "目標を設定したい：簿記2級"))
        .await
        .expect("flow opened");

    // A task request in the middle of the goal dialogue is answered as a
    // task request, not stored as the "why" answer.
    let reply = fixture
        .brain
        .handle(fixture.message("m-14", "room-a", "タスクを教えて"))
        .await
        .expect("deflected reply");
    fixture.settle().await;
    assert!(reply.text.contains("1件"), "{}", reply.text);

    let state = tenant
        .current_state("room-a", fixture.user_id, Utc::now())
        .await
        .expect("state");
    assert_eq!(state.state_type, StateType::GoalSetting, "flow preserved");
    assert_eq!(state.step, "why");
    assert!(state.data.get("why").is_none(), "no answer recorded");
    assert_eq!(fixture.decision_count().await, 2);
}

/// Multi-action: two conjunctive requests run sequentially in one
/// invocation, recorded as a single multi-action decision.
#[tokio::test]
async fn multi_action_runs_segments_sequentially() {
    let fixture = Fixture::new(task_routing()).await;
    seed_task(&fixture.db, fixture.tenant_id, "room-a", fixture.user_id, "予算レビュー").await;
    seed_person(&fixture.db, fixture.tenant_id, "太郎", Some("acct-taro")).await;
    seed_user(&fixture.db, fixture.tenant_id, "acct-taro", "太郎", 2).await;

    let reply = fixture
        .brain
        .handle(fixture.message(
            "m-12",
            "room-a",
            "私のタスクを教えて、それと、太郎さんにタスクをお願い：スライド準備",
        ))
        .await
        .expect("reply");
    fixture.settle().await;

    assert!(reply.text.contains("予算レビュー"), "{}", reply.text);
    assert!(reply.text.contains("作成しました"), "{}", reply.text);
    assert_eq!(fixture.decision_count().await, 1, "one multi-action record");
    assert_eq!(fixture.chat.sent_count(), 1, "one combined reply");
}

/// Insufficient role level: a refusal, never a plan.
#[tokio::test]
async fn insufficient_role_is_refused() {
    let llm = Arc::new(FnLlm::routing(vec![(
        "方針として覚えて",
        r#"{"intent": "teaching_record", "entities": {"statement": "失敗を学びに変える"}, "confidence": 0.9, "reasoning": "teaching"}"#
            .to_owned(),
    )]));
    let fixture = Fixture::new(llm).await;

    let reply = fixture
        .brain
        .handle(fixture.message("m-11", "room-a", "方針として覚えて：失敗を学びに変える"))
        .await
        .expect("reply");
    fixture.settle().await;

    assert!(reply.text.contains("権限"), "{}", reply.text);
    assert_eq!(fixture.decision_count().await, 1);
}
