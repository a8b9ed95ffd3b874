mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{comment, rules, Call, FakeSource, RecordingMetrics, PAGE};
use reel_watchbot::error::CycleError;
use reel_watchbot::model::{Rule, TenantKey};
use reel_watchbot::monitor::{CycleExecutor, MonitorOptions};
use reel_watchbot::source::SourceError;

fn executor(metrics: Arc<RecordingMetrics>) -> CycleExecutor {
    CycleExecutor::new(metrics, MonitorOptions::default())
}

fn tenant() -> TenantKey {
    TenantKey::new(1, PAGE)
}

#[tokio::test]
async fn price_question_gets_the_only_reply() {
    let source = FakeSource::new(PAGE);
    source.add_reel(
        "R1",
        vec![
            comment("c1", "what's the price?", "u1"),
            comment("c2", "nice video", "u2"),
        ],
    );
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("R1", ["price"], "see inbox")]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.reels_scanned, 1);
    assert_eq!(summary.reels_with_enabled_rule, 1);
    assert_eq!(summary.comments_scanned, 2);
    assert_eq!(summary.replies_sent, 1);
    assert_eq!(summary.inbox_sent, 0);
    assert_eq!(
        source.public_replies(),
        vec![("c1".to_string(), "see inbox".to_string())]
    );
    assert!(source.private_replies().is_empty());
}

#[tokio::test]
async fn replies_and_messages_matching_comments_only() {
    let source = FakeSource::new(PAGE);
    let mut answered = comment("c4", "price please", "u4");
    answered.replies.push(comment("c4-r", "sent you a DM", PAGE));
    source.add_reel(
        "r1",
        vec![
            comment("c1", "What's the PRICE?", "u1"),
            comment("c2", "nice video", "u2"),
            comment("c3", "price list in bio", PAGE),
            answered,
        ],
    );
    source.add_reel("r2", vec![comment("c5", "price?", "u5")]);

    let metrics = RecordingMetrics::new();
    let mut exec = executor(metrics.clone());
    let rules = rules(vec![
        Rule::new("r1", ["price"], "Check your inbox").with_inbox("It costs 10"),
    ]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(
        source.public_replies(),
        vec![("c1".to_string(), "Check your inbox".to_string())]
    );
    assert_eq!(
        source.private_replies(),
        vec![("c1".to_string(), "It costs 10".to_string())]
    );
    assert_eq!(summary.reels_scanned, 2);
    assert_eq!(summary.reels_with_enabled_rule, 1);
    assert_eq!(summary.comments_scanned, 4);
    assert_eq!(summary.replies_sent, 1);
    assert_eq!(summary.inbox_sent, 1);
    // list reels, list comments of r1, one reply, one private reply
    assert_eq!(summary.api_calls, 4);
    assert!(!source.calls().contains(&Call::ListComments("r2".into())));

    let recorded = metrics.cycles();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, tenant());
    assert_eq!(recorded[0].1, summary);
}

#[tokio::test]
async fn second_cycle_does_not_reply_again() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let first = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    let second = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(first.replies_sent, 1);
    assert_eq!(second.replies_sent, 0);
    assert_eq!(second.api_calls, 2);
    assert_eq!(source.public_replies().len(), 1);
    assert!(exec.dedup().is_known_replied("c1"));
}

#[tokio::test]
async fn fresh_executor_sees_nested_reply() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    executor(RecordingMetrics::new())
        .run_cycle(&tenant(), source.as_ref(), &rules)
        .await
        .unwrap();
    // Simulates a restart: the dedup cache is gone, the nested reply is not.
    let summary = executor(RecordingMetrics::new())
        .run_cycle(&tenant(), source.as_ref(), &rules)
        .await
        .unwrap();

    assert_eq!(summary.replies_sent, 0);
    assert_eq!(source.public_replies().len(), 1);
}

#[tokio::test]
async fn wildcard_rule_matches_every_comment() {
    let source = FakeSource::new(PAGE);
    source.add_reel(
        "r1",
        vec![
            comment("c1", "anything", "u1"),
            comment("c2", "", "u2"),
            comment("c3", "own", PAGE),
        ],
    );
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["."], "hello")]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.replies_sent, 2);
    let replied: Vec<String> = source.public_replies().into_iter().map(|(id, _)| id).collect();
    assert_eq!(replied, vec!["c1".to_string(), "c2".to_string()]);
}

#[tokio::test]
async fn disabled_rules_cause_no_remote_calls() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    let metrics = RecordingMetrics::new();
    let mut exec = executor(metrics.clone());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks").disabled()]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert!(summary.is_empty());
    assert!(source.calls().is_empty());
    assert!(metrics.cycles().is_empty());
}

#[tokio::test]
async fn reel_with_only_disabled_rule_is_skipped() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    source.add_reel("r2", vec![comment("c2", "price?", "u2")]);
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![
        Rule::new("r1", ["price"], "thanks").disabled(),
        Rule::new("r2", ["price"], "thanks"),
    ]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.reels_with_enabled_rule, 1);
    assert!(!source.calls().contains(&Call::ListComments("r1".into())));
    assert_eq!(source.public_replies()[0].0, "c2");
}

#[tokio::test]
async fn duplicate_reply_response_is_not_a_failure() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    source.duplicate_reply("c1");
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks").with_inbox("dm")]);

    let first = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    let second = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(first.already_replied, 1);
    assert_eq!(first.replies_sent, 0);
    assert_eq!(first.reply_failures, 0);
    assert!(source.private_replies().is_empty());
    assert_eq!(second.already_replied, 0);
    assert_eq!(source.public_replies().len(), 1);
}

#[tokio::test]
async fn truncated_replies_fall_back_to_remote_check() {
    let source = FakeSource::new(PAGE);
    let mut answered = comment("c1", "price?", "u1");
    answered.reply_count = Some(30);
    let mut unanswered = comment("c2", "price?", "u2");
    unanswered.reply_count = Some(5);
    source.add_reel("r1", vec![answered, unanswered]);
    source.mark_remote_replied("c1");
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let first = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(first.replies_sent, 1);
    assert_eq!(source.public_replies()[0].0, "c2");
    assert_eq!(source.count(|c| matches!(c, Call::CheckReplied(_))), 2);

    let second = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    assert_eq!(second.replies_sent, 0);
    assert_eq!(source.count(|c| matches!(c, Call::CheckReplied(_))), 2);
}

#[tokio::test]
async fn complete_nested_replies_skip_remote_check() {
    let source = FakeSource::new(PAGE);
    let mut c1 = comment("c1", "price?", "u1");
    c1.replies.push(comment("c1-r", "me too", "u9"));
    c1.reply_count = Some(1);
    source.add_reel("r1", vec![c1, comment("c2", "price?", "u2")]);
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.replies_sent, 2);
    assert_eq!(source.count(|c| matches!(c, Call::CheckReplied(_))), 0);
}

#[tokio::test]
async fn missing_summary_is_verified_when_configured() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    source.mark_remote_replied("c1");
    let options = MonitorOptions {
        verify_when_summary_missing: true,
        ..MonitorOptions::default()
    };
    let mut exec = CycleExecutor::new(RecordingMetrics::new(), options);
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.replies_sent, 0);
    assert_eq!(source.count(|c| matches!(c, Call::CheckReplied(_))), 1);
}

#[tokio::test]
async fn failing_reel_does_not_stop_the_others() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    source.add_reel("r2", vec![comment("c2", "price?", "u2")]);
    source.fail_comments("r1");
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![
        Rule::new("r1", ["price"], "thanks"),
        Rule::new("r2", ["price"], "thanks"),
    ]);

    let summary = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(summary.reel_failures, 1);
    assert_eq!(summary.replies_sent, 1);
    assert_eq!(source.public_replies()[0].0, "c2");
}

#[tokio::test]
async fn failed_reply_is_retried_next_cycle() {
    let source = FakeSource::new(PAGE);
    source.add_reel(
        "r1",
        vec![comment("c1", "price?", "u1"), comment("c2", "price?", "u2")],
    );
    source.fail_reply("c1", true);
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let first = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    assert_eq!(first.reply_failures, 1);
    assert_eq!(first.replies_sent, 1);
    assert!(!exec.dedup().is_known_replied("c1"));

    source.fail_reply("c1", false);
    let second = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    assert_eq!(second.replies_sent, 1);
    assert_eq!(second.reply_failures, 0);
    assert!(exec.dedup().is_known_replied("c1"));
}

#[tokio::test]
async fn inbox_failure_keeps_public_reply() {
    let source = FakeSource::new(PAGE);
    source.add_reel("r1", vec![comment("c1", "price?", "u1")]);
    source.fail_inbox("c1");
    let mut exec = executor(RecordingMetrics::new());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks").with_inbox("dm")]);

    let first = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();
    let second = exec.run_cycle(&tenant(), source.as_ref(), &rules).await.unwrap();

    assert_eq!(first.replies_sent, 1);
    assert_eq!(first.inbox_sent, 0);
    assert_eq!(first.inbox_failures, 1);
    assert_eq!(second.replies_sent, 0);
    assert_eq!(source.private_replies().len(), 1);
}

#[tokio::test]
async fn reel_listing_failure_fails_the_cycle() {
    let source = FakeSource::new(PAGE);
    source.fail_reels(true);
    let metrics = RecordingMetrics::new();
    let mut exec = executor(metrics.clone());
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let err = exec
        .run_cycle(&tenant(), source.as_ref(), &rules)
        .await
        .unwrap_err();

    assert!(matches!(err, CycleError::ReelFetch(SourceError::Api { .. })));
    assert!(metrics.cycles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_call_hits_the_call_timeout() {
    let source = FakeSource::new(PAGE);
    source.set_delay(Duration::from_secs(60));
    let options = MonitorOptions {
        call_timeout: Duration::from_secs(5),
        ..MonitorOptions::default()
    };
    let mut exec = CycleExecutor::new(RecordingMetrics::new(), options);
    let rules = rules(vec![Rule::new("r1", ["price"], "thanks")]);

    let err = exec
        .run_cycle(&tenant(), source.as_ref(), &rules)
        .await
        .unwrap_err();

    assert!(matches!(err, CycleError::ReelFetch(SourceError::Timeout(d)) if d == Duration::from_secs(5)));
}
